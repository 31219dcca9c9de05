//! Portrait crop geometry.
//!
//! Turns a [`Landmarks`] result into a source-space rectangle that matches the
//! target aspect ratio and lies fully inside the source image. The function is
//! pure: the same inputs always produce the same rectangle.

use crate::types::{Landmarks, Point};
use serde::{Deserialize, Serialize};

// --- Tuned composition constants ---
/// Eye line position as a fraction of crop height, measured from the top.
pub const EYE_LINE_RATIO: f32 = 0.35;
/// Crop width as a multiple of the face width.
pub const CROP_WIDTH_SCALE: f32 = 2.0;
/// Crop height as a multiple of the face height.
pub const CROP_HEIGHT_SCALE: f32 = 3.0;
/// Approximate eye line below the face-box top, as a fraction of face height.
pub const FACE_EYE_LINE_OFFSET: f32 = 0.40;
/// Face width multiple beyond which the photo is treated as already portrait.
pub const PORTRAIT_WIDTH_FACTOR: f32 = 2.5;
/// Face height multiple beyond which the photo is treated as already portrait.
pub const PORTRAIT_HEIGHT_FACTOR: f32 = 3.0;
/// Head reference for full-body photos without detection, fraction of height.
pub const UPPER_BODY_HEAD_RATIO: f32 = 0.22;

/// Vertical reference used when no face was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoFaceAnchor {
    /// Center crop on the image center.
    #[default]
    Center,
    /// Anchor on the upper part of the frame, where heads sit in full-body shots.
    Upper,
}

impl std::str::FromStr for NoFaceAnchor {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "center" => Ok(Self::Center),
            "upper" => Ok(Self::Upper),
            other => Err(format!("unknown no-face anchor '{other}' (expected center or upper)")),
        }
    }
}

/// Overridable crop constants. [`Default`] uses the tuned values above.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropPolicy {
    pub eye_line_ratio: f32,
    pub crop_width_scale: f32,
    pub crop_height_scale: f32,
    pub face_eye_line_offset: f32,
    pub portrait_width_factor: f32,
    pub portrait_height_factor: f32,
    pub upper_body_head_ratio: f32,
    pub no_face_anchor: NoFaceAnchor,
}

impl Default for CropPolicy {
    fn default() -> Self {
        Self {
            eye_line_ratio: EYE_LINE_RATIO,
            crop_width_scale: CROP_WIDTH_SCALE,
            crop_height_scale: CROP_HEIGHT_SCALE,
            face_eye_line_offset: FACE_EYE_LINE_OFFSET,
            portrait_width_factor: PORTRAIT_WIDTH_FACTOR,
            portrait_height_factor: PORTRAIT_HEIGHT_FACTOR,
            upper_body_head_ratio: UPPER_BODY_HEAD_RATIO,
            no_face_anchor: NoFaceAnchor::Center,
        }
    }
}

/// Which rung of the fallback ladder produced a crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CropTier {
    BothEyes,
    FaceOnly,
    NoFace,
    FullFrame,
}

/// Integer crop rectangle in source image coordinates, always in bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn full(image_width: u32, image_height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width: image_width,
            height: image_height,
        }
    }

    /// True when the rectangle lies inside `[0, 0, image_width, image_height]`.
    pub fn fits_within(&self, image_width: u32, image_height: u32) -> bool {
        self.x as u64 + self.width as u64 <= image_width as u64
            && self.y as u64 + self.height as u64 <= image_height as u64
    }
}

/// Result of [`compute_crop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropDecision {
    pub rect: CropRect,
    pub tier: CropTier,
}

/// Compute the source crop rectangle for one portrait.
///
/// Tiers, in priority order:
/// 1. Face detected but already filling the frame at portrait proportions
///    (`face.width × 2.5 > image width` or `face.height × 3 > image height`):
///    the full frame is used unchanged.
/// 2. Both eyes: anchor on the eye midpoint, crop `2 × face.width` by
///    `3 × face.height`, eye line at 35% of the crop height.
/// 3. Face with at most one eye: anchor on the face center horizontally and on
///    `face.y + 0.40 × face.height` vertically, same crop size and eye line.
/// 4. No face: largest rectangle of the target aspect, centered on the image
///    or, for [`NoFaceAnchor::Upper`], placed so that the head reference
///    (22% of the image height) sits on the eye line.
///
/// The rectangle is widened or heightened to the target aspect, scaled down
/// uniformly if it exceeds the image, then shifted (never shrunk) to stay in
/// bounds.
///
/// # Examples
///
/// ```rust
/// # use portrait_core::crop::{compute_crop, CropPolicy, CropTier};
/// # use portrait_core::types::{FaceRect, Landmarks, Point};
/// let landmarks = Landmarks::with_eyes(
///     "cascade",
///     FaceRect::new(450.0, 350.0, 260.0, 320.0),
///     Some(Point::new(520.0, 470.0)),
///     Some(Point::new(640.0, 472.0)),
///     0.9,
/// );
/// let crop = compute_crop(1200, 1600, &landmarks, 200, 300, &CropPolicy::default());
/// assert_eq!(crop.tier, CropTier::BothEyes);
/// assert!(crop.rect.fits_within(1200, 1600));
/// ```
pub fn compute_crop(
    image_width: u32,
    image_height: u32,
    landmarks: &Landmarks,
    target_width: u32,
    target_height: u32,
    policy: &CropPolicy,
) -> CropDecision {
    if image_width == 0 || image_height == 0 {
        return CropDecision {
            rect: CropRect::full(image_width, image_height),
            tier: CropTier::FullFrame,
        };
    }

    let iw = image_width as f32;
    let ih = image_height as f32;
    let aspect = if target_width > 0 && target_height > 0 {
        target_width as f32 / target_height as f32
    } else {
        1.0
    };

    if landmarks.face_detected && landmarks.face_rect.is_valid() {
        let face = landmarks.face_rect;

        if face.width * policy.portrait_width_factor > iw
            || face.height * policy.portrait_height_factor > ih
        {
            return CropDecision {
                rect: CropRect::full(image_width, image_height),
                tier: CropTier::FullFrame,
            };
        }

        let (anchor, tier) = match landmarks.eye_midpoint() {
            Some(mid) => (mid, CropTier::BothEyes),
            None => (
                Point::new(
                    face.center().x,
                    face.height.mul_add(policy.face_eye_line_offset, face.y),
                ),
                CropTier::FaceOnly,
            ),
        };

        let rect = place(
            anchor,
            face.width * policy.crop_width_scale,
            face.height * policy.crop_height_scale,
            policy.eye_line_ratio,
            aspect,
            image_width,
            image_height,
        );
        return CropDecision { rect, tier };
    }

    let (fit_w, fit_h) = largest_fit(iw, ih, aspect);
    let (anchor, ratio) = match policy.no_face_anchor {
        NoFaceAnchor::Center => (Point::new(iw / 2.0, ih / 2.0), 0.5),
        NoFaceAnchor::Upper => (
            Point::new(iw / 2.0, ih * policy.upper_body_head_ratio),
            policy.eye_line_ratio,
        ),
    };

    CropDecision {
        rect: place(anchor, fit_w, fit_h, ratio, aspect, image_width, image_height),
        tier: CropTier::NoFace,
    }
}

/// Largest rectangle with the given aspect that fits the image.
fn largest_fit(iw: f32, ih: f32, aspect: f32) -> (f32, f32) {
    if iw / ih > aspect {
        (ih * aspect, ih)
    } else {
        (iw, iw / aspect)
    }
}

/// Aspect-correct a raw crop around an anchor and clamp it into the image.
fn place(
    anchor: Point,
    raw_w: f32,
    raw_h: f32,
    vertical_ratio: f32,
    aspect: f32,
    image_width: u32,
    image_height: u32,
) -> CropRect {
    let iw = image_width as f32;
    let ih = image_height as f32;

    // Grow the short side until the rectangle matches the target aspect.
    let (mut w, mut h) = if raw_w / raw_h < aspect {
        (raw_h * aspect, raw_h)
    } else {
        (raw_w, raw_w / aspect)
    };

    // Too large for the source: scale down uniformly, keeping the aspect.
    if w > iw {
        w = iw;
        h = w / aspect;
    }
    if h > ih {
        h = ih;
        w = h * aspect;
    }

    let left = (-w).mul_add(0.5, anchor.x);
    let top = (-h).mul_add(vertical_ratio, anchor.y);

    to_pixels(left, top, w, h, image_width, image_height)
}

/// Round to integers and shift the rectangle inside the image bounds.
fn to_pixels(left: f32, top: f32, w: f32, h: f32, image_width: u32, image_height: u32) -> CropRect {
    let width = finite_or(w.round(), image_width as f32).clamp(1.0, image_width as f32) as u32;
    let height = finite_or(h.round(), image_height as f32).clamp(1.0, image_height as f32) as u32;

    let max_x = (image_width - width) as f32;
    let max_y = (image_height - height) as f32;
    let x = finite_or(left.round(), 0.0).clamp(0.0, max_x) as u32;
    let y = finite_or(top.round(), 0.0).clamp(0.0, max_y) as u32;

    CropRect { x, y, width, height }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}
