//! Resize and encode finished portraits.

use crate::crop::CropRect;
use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("invalid output size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Portrait file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
    Bmp,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Bmp => "bmp",
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Self::Png)
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "bmp" => Ok(Self::Bmp),
            other => Err(format!("unknown output format '{other}' (expected jpg, png or bmp)")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Cut `crop` out of `image` and resize it to exactly `width × height`.
///
/// The crop has already been corrected to the target aspect, so the resize
/// does not distort unless the full frame is used as-is.
pub fn render_portrait(
    image: &DynamicImage,
    crop: &CropRect,
    width: u32,
    height: u32,
) -> Result<DynamicImage, RenderError> {
    if width == 0 || height == 0 {
        return Err(RenderError::InvalidSize { width, height });
    }
    let region = image.crop_imm(crop.x, crop.y, crop.width, crop.height);
    Ok(region.resize_exact(width, height, FilterType::Lanczos3))
}

/// Resize a whole image (placeholders) to exactly `width × height`.
pub fn render_full(image: &DynamicImage, width: u32, height: u32) -> Result<DynamicImage, RenderError> {
    render_portrait(image, &CropRect::full(image.width(), image.height()), width, height)
}

/// Composite onto white: `rgb × α + 255 × (1 − α)`. Opaque pixels are unchanged.
pub fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let alpha = src[3] as f32 / 255.0;
        for c in 0..3 {
            dst[c] = (src[c] as f32).mul_add(alpha, 255.0 * (1.0 - alpha)).round() as u8;
        }
    }
    out
}

/// True when `identity_id` is a single plain path component, so the output
/// file lands directly inside its variant directory.
pub fn is_safe_identity(identity_id: &str) -> bool {
    let mut components = Path::new(identity_id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// File name for an identity's portrait.
pub fn output_file_name(identity_id: &str, format: OutputFormat) -> String {
    format!("{identity_id}.{}", format.extension())
}

/// Encode `image` to `destination`, creating parent directories and replacing
/// any existing file.
pub fn save_portrait(
    image: &DynamicImage,
    destination: &Path,
    format: OutputFormat,
    jpeg_quality: u8,
) -> Result<(), RenderError> {
    let io_err = |source| RenderError::Io {
        path: destination.to_path_buf(),
        source,
    };
    let encode_err = |source| RenderError::Encode {
        path: destination.to_path_buf(),
        source,
    };

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty() && !p.exists()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut writer = BufWriter::new(File::create(destination).map_err(io_err)?);
    match format {
        OutputFormat::Jpeg => flatten_on_white(image)
            .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, jpeg_quality.clamp(1, 100)))
            .map_err(encode_err)?,
        OutputFormat::Bmp => flatten_on_white(image)
            .write_with_encoder(BmpEncoder::new(&mut writer))
            .map_err(encode_err)?,
        OutputFormat::Png if image.color().has_alpha() => image
            .to_rgba8()
            .write_with_encoder(PngEncoder::new(&mut writer))
            .map_err(encode_err)?,
        OutputFormat::Png => image
            .to_rgb8()
            .write_with_encoder(PngEncoder::new(&mut writer))
            .map_err(encode_err)?,
    }
    writer.flush().map_err(io_err)?;

    tracing::debug!(path = %destination.display(), %format, "saved portrait");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crop::{compute_crop, CropPolicy};
    use crate::types::{FaceRect, Landmarks, Point};
    use image::{Rgba, RgbaImage};

    fn half_transparent_half_red() -> DynamicImage {
        let mut img = RgbaImage::new(100, 100);
        for (x, _, px) in img.enumerate_pixels_mut() {
            *px = if x < 50 {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([255, 0, 0, 255])
            };
        }
        DynamicImage::ImageRgba8(img)
    }

    fn channel_means(img: &RgbImage, xs: std::ops::Range<u32>) -> [f32; 3] {
        let mut sum = [0f64; 3];
        let mut n = 0f64;
        for y in 0..img.height() {
            for x in xs.clone() {
                let p = img.get_pixel(x, y);
                for c in 0..3 {
                    sum[c] += p[c] as f64;
                }
                n += 1.0;
            }
        }
        [(sum[0] / n) as f32, (sum[1] / n) as f32, (sum[2] / n) as f32]
    }

    #[test]
    fn test_parse_output_format() {
        assert_eq!("JPG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("jpeg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!(".png".parse::<OutputFormat>().unwrap(), OutputFormat::Png);
        assert_eq!("bmp".parse::<OutputFormat>().unwrap(), OutputFormat::Bmp);
        assert!("tiff".parse::<OutputFormat>().is_err());
        assert_eq!(output_file_name("42", OutputFormat::Jpeg), "42.jpg");
    }

    #[test]
    fn test_safe_identity() {
        assert!(is_safe_identity("17"));
        assert!(is_safe_identity("smith.j"));
        assert!(is_safe_identity("..hidden"));
        assert!(!is_safe_identity("../escaped"));
        assert!(!is_safe_identity(".."));
        assert!(!is_safe_identity("."));
        assert!(!is_safe_identity("/etc/passwd"));
        assert!(!is_safe_identity("team/17"));
        assert!(!is_safe_identity(""));
    }

    #[test]
    fn test_render_exact_dimensions() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(640, 480));
        for (w, h) in [(200, 300), (34, 50), (1, 1), (1000, 1000)] {
            let out = render_portrait(&image, &CropRect { x: 10, y: 20, width: 300, height: 400 }, w, h).unwrap();
            assert_eq!((out.width(), out.height()), (w, h));
        }
    }

    #[test]
    fn test_render_zero_size_rejected() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        assert!(matches!(
            render_full(&image, 0, 10),
            Err(RenderError::InvalidSize { width: 0, height: 10 })
        ));
    }

    #[test]
    fn test_reference_portrait_is_200x300() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(1200, 1600, image::Rgb([120, 110, 100])));
        let lm = Landmarks::with_eyes(
            "cascade",
            FaceRect::new(450.0, 350.0, 260.0, 320.0),
            Some(Point::new(520.0, 470.0)),
            Some(Point::new(640.0, 472.0)),
            0.9,
        );
        let crop = compute_crop(1200, 1600, &lm, 200, 300, &CropPolicy::default());
        let out = render_portrait(&image, &crop.rect, 200, 300).unwrap();
        assert_eq!((out.width(), out.height()), (200, 300));
    }

    #[test]
    fn test_flatten_opaque_unchanged() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([12, 200, 99, 255])));
        let flat = flatten_on_white(&img);
        assert_eq!(flat.get_pixel(1, 1).0, [12, 200, 99]);
    }

    #[test]
    fn test_flatten_half_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128])));
        let flat = flatten_on_white(&img);
        // 255 * (1 - 128/255) = 127
        assert_eq!(flat.get_pixel(0, 0).0, [127, 127, 127]);
    }

    #[test]
    fn test_jpeg_flattens_transparency_to_white() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("7.jpg");
        let rendered = render_full(&half_transparent_half_red(), 50, 50).unwrap();
        save_portrait(&rendered, &path, OutputFormat::Jpeg, 95).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (50, 50));

        let white = channel_means(&decoded, 0..20);
        assert!(white.iter().all(|&m| m > 210.0), "transparent area: {white:?}");

        let red = channel_means(&decoded, 30..50);
        assert!(red[0] > 180.0, "red channel: {red:?}");
        assert!(red[1] < 90.0 && red[2] < 90.0, "green/blue: {red:?}");
    }

    #[test]
    fn test_bmp_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7.bmp");
        let rendered = render_full(&half_transparent_half_red(), 40, 40).unwrap();
        save_portrait(&rendered, &path, OutputFormat::Bmp, 90).unwrap();

        let decoded = image::open(&path).unwrap();
        assert!(!decoded.color().has_alpha());
        assert_eq!(decoded.to_rgb8().get_pixel(2, 2).0, [255, 255, 255]);
    }

    #[test]
    fn test_png_keeps_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7.png");
        let rendered = render_full(&half_transparent_half_red(), 40, 40).unwrap();
        save_portrait(&rendered, &path, OutputFormat::Png, 90).unwrap();

        let decoded = image::open(&path).unwrap();
        assert!(decoded.color().has_alpha());
        assert_eq!(decoded.to_rgba8().get_pixel(2, 2)[3], 0);
    }

    #[test]
    fn test_save_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("9.png");
        let small = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let large = DynamicImage::ImageRgb8(RgbImage::new(20, 30));
        save_portrait(&small, &path, OutputFormat::Png, 90).unwrap();
        save_portrait(&large, &path, OutputFormat::Png, 90).unwrap();
        assert_eq!(image::image_dimensions(&path).unwrap(), (20, 30));
    }
}
