//! Classical cascade backend: SeetaFace funnel-structured cascade (via
//! `rustface`) for the face, followed by a dark-region search for the eyes
//! inside the upper half of the face box.

use super::{DetectorError, FaceDetector};
use crate::cancel::CancelHandle;
use crate::types::{merge_eye_candidates, DetectorCapabilities, FaceRect, Landmarks, Point};
use async_trait::async_trait;
use image::{GrayImage, RgbImage};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

pub const MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";
pub const CASCADE_ID: &str = "cascade";

// --- SeetaFace tuning ---
const MIN_FACE_SIZE: u32 = 20;
const SCORE_THRESHOLD: f64 = 2.0;
const PYRAMID_SCALE: f32 = 0.8;
const WINDOW_STEP: u32 = 4;
/// Raw cascade scores at or above this map to confidence 1.0.
const SCORE_SATURATION: f64 = 10.0;

// --- Eye search band, as fractions of the face box ---
const EYE_BAND_TOP: f32 = 0.20;
const EYE_BAND_BOTTOM: f32 = 0.55;
const EYE_BAND_LEFT: f32 = 0.10;
const EYE_BAND_RIGHT: f32 = 0.90;
/// Windows within this factor of the darkest window are eye candidates.
const NEAR_MIN_FACTOR: f32 = 1.05;
/// Candidates must also be this much darker than the band average.
const DARKNESS_FACTOR: f32 = 0.80;

/// SeetaFace cascade backend. Reports faces and, when visible, both eyes.
pub struct CascadeDetector {
    model: Arc<rustface::Model>,
}

impl CascadeDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        let file = File::open(model_path).map_err(|e| {
            DetectorError::unavailable(
                CASCADE_ID,
                format!("model file not found: {} ({e})", model_path.display()),
            )
        })?;
        let model = rustface::read_model(BufReader::new(file)).map_err(|e| {
            DetectorError::unavailable(CASCADE_ID, format!("invalid SeetaFace model: {e}"))
        })?;

        tracing::info!(path = %model_path.display(), "loaded SeetaFace cascade model");
        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[async_trait]
impl FaceDetector for CascadeDetector {
    fn id(&self) -> &str {
        CASCADE_ID
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            eyes: true,
            network: false,
        }
    }

    async fn detect(&self, image: Arc<RgbImage>, _cancel: &CancelHandle) -> Result<Landmarks, DetectorError> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || Ok(detect_sync(&model, &image)))
            .await
            .map_err(|e| DetectorError::Inference(format!("cascade task failed: {e}")))?
    }
}

fn detect_sync(model: &rustface::Model, image: &RgbImage) -> Landmarks {
    let (width, height) = image.dimensions();
    if width < MIN_FACE_SIZE || height < MIN_FACE_SIZE {
        return Landmarks::none(CASCADE_ID);
    }

    let gray = image::imageops::grayscale(image);

    let mut detector = rustface::create_detector_with_model(model.clone());
    detector.set_min_face_size(MIN_FACE_SIZE);
    detector.set_score_thresh(SCORE_THRESHOLD);
    detector.set_pyramid_scale_factor(PYRAMID_SCALE);
    detector.set_slide_window_step(WINDOW_STEP, WINDOW_STEP);

    let faces = detector.detect(&rustface::ImageData::new(gray.as_raw(), width, height));
    let best = faces.iter().max_by(|a, b| {
        a.score()
            .partial_cmp(&b.score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let Some(face) = best else {
        return Landmarks::none(CASCADE_ID);
    };

    let bbox = face.bbox();
    let x = bbox.x().max(0) as f32;
    let y = bbox.y().max(0) as f32;
    let rect = FaceRect::new(
        x,
        y,
        (bbox.width() as f32).min(width as f32 - x),
        (bbox.height() as f32).min(height as f32 - y),
    );
    if !rect.is_valid() {
        return Landmarks::none(CASCADE_ID);
    }

    let confidence = (face.score() / SCORE_SATURATION).clamp(0.0, 1.0) as f32;
    let (left, right) = find_eyes(&gray, &rect);
    tracing::debug!(
        score = face.score(),
        left_eye = left.is_some(),
        right_eye = right.is_some(),
        "cascade face"
    );

    Landmarks::with_eyes(CASCADE_ID, rect, left, right, confidence)
}

/// Integer pixel bounds `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy)]
struct Region {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

/// Locate eye candidates as the darkest windows of each half of the eye band
/// and merge them to at most one point per side.
fn find_eyes(gray: &GrayImage, face: &FaceRect) -> (Option<Point>, Option<Point>) {
    let (iw, ih) = gray.dimensions();
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(iw);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(ih);

    let band = Region {
        x0: clamp_x(face.width.mul_add(EYE_BAND_LEFT, face.x)),
        x1: clamp_x(face.width.mul_add(EYE_BAND_RIGHT, face.x)),
        y0: clamp_y(face.height.mul_add(EYE_BAND_TOP, face.y)),
        y1: clamp_y(face.height.mul_add(EYE_BAND_BOTTOM, face.y)),
    };
    let window = ((face.width / 12.0) as u32).max(3);
    if band.x1 <= band.x0 + window || band.y1 <= band.y0 + window {
        return (None, None);
    }

    let band_mean = region_mean(gray, &band);
    let split = clamp_x(face.center().x).clamp(band.x0, band.x1);
    let halves = [
        Region { x1: split, ..band },
        Region { x0: split, ..band },
    ];

    let mut candidates = Vec::new();
    for half in &halves {
        candidates.extend(dark_windows(gray, half, window, band_mean));
    }
    merge_eye_candidates(face, &candidates)
}

/// Centers of the windows in `region` that are nearly as dark as the darkest
/// one and clearly darker than `reference_mean`.
fn dark_windows(gray: &GrayImage, region: &Region, window: u32, reference_mean: f32) -> Vec<Point> {
    let step = (window / 2).max(1);
    let mut windows = Vec::new();

    let mut y = region.y0;
    while y + window <= region.y1 {
        let mut x = region.x0;
        while x + window <= region.x1 {
            let cell = Region {
                x0: x,
                y0: y,
                x1: x + window,
                y1: y + window,
            };
            windows.push((x, y, region_mean(gray, &cell)));
            x += step;
        }
        y += step;
    }

    let Some(darkest) = windows.iter().map(|w| w.2).reduce(f32::min) else {
        return Vec::new();
    };
    if darkest >= reference_mean * DARKNESS_FACTOR {
        return Vec::new();
    }

    let half = window as f32 / 2.0;
    windows
        .into_iter()
        .filter(|&(_, _, mean)| mean <= darkest * NEAR_MIN_FACTOR && mean < reference_mean * DARKNESS_FACTOR)
        .map(|(x, y, _)| Point::new(x as f32 + half, y as f32 + half))
        .collect()
}

fn region_mean(gray: &GrayImage, region: &Region) -> f32 {
    let mut sum = 0u64;
    for y in region.y0..region.y1 {
        for x in region.x0..region.x1 {
            sum += gray.get_pixel(x, y)[0] as u64;
        }
    }
    let count = ((region.x1 - region.x0) * (region.y1 - region.y0)).max(1);
    sum as f32 / count as f32
}
