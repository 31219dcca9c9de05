//! YOLOv8-face detector via ONNX Runtime.
//!
//! Single-scale anchor-free detector: a 640×640 letterboxed RGB input and one
//! prediction tensor of `[1, C, N]` (or `[1, N, C]`) where the first four
//! channels are `cx, cy, w, h` and the fifth is the face score. Keypoint
//! channels, when the export has them, are ignored.

use super::{run_blocking, DetectorError, FaceDetector};
use crate::cancel::CancelHandle;
use crate::types::{DetectorCapabilities, FaceRect, Landmarks};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const MODEL_FILE: &str = "yolov8n-face.onnx";
pub const YOLO_ID: &str = "yolo";

// --- Named constants (no magic numbers) ---
const YOLO_INPUT_SIZE: usize = 640;
const YOLO_PAD_VALUE: f32 = 114.0;
const YOLO_NMS_THRESHOLD: f32 = 0.45;
const YOLO_BOX_CHANNELS: usize = 4;

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    new_w: usize,
    new_h: usize,
}

impl LetterboxInfo {
    fn compute(width: usize, height: usize, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, input);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, input);
        Self {
            scale,
            pad_x: (input - new_w) as f32 / 2.0,
            pad_y: (input - new_h) as f32 / 2.0,
            new_w,
            new_h,
        }
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Candidate face box before suppression.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScoredBox {
    pub rect: FaceRect,
    pub confidence: f32,
}

/// YOLOv8-face backend. Reports faces only.
pub struct YoloFaceDetector {
    session: Arc<Mutex<Session>>,
    threshold: f32,
}

impl YoloFaceDetector {
    /// Load the ONNX model from the given path.
    pub fn load(model_path: &Path, threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::unavailable(
                YOLO_ID,
                format!("model file not found: {}", model_path.display()),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name().to_string()).collect::<Vec<_>>(),
            "loaded YOLOv8-face model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            threshold,
        })
    }
}

#[async_trait]
impl FaceDetector for YoloFaceDetector {
    fn id(&self) -> &str {
        YOLO_ID
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            eyes: false,
            network: false,
        }
    }

    async fn detect(&self, image: Arc<RgbImage>, _cancel: &CancelHandle) -> Result<Landmarks, DetectorError> {
        let threshold = self.threshold;
        run_blocking(&self.session, move |session| infer(session, &image, threshold)).await
    }
}

fn infer(session: &mut Session, image: &RgbImage, threshold: f32) -> Result<Landmarks, DetectorError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Ok(Landmarks::none(YOLO_ID));
    }

    let (input, letterbox) = preprocess(image);
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

    let (shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectorError::Inference(format!("yolo predictions: {e}")))?;
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    if dims.len() != 3 {
        return Err(DetectorError::Inference(format!(
            "unexpected YOLO output shape {dims:?}"
        )));
    }

    // [1, C, N] when channels < anchors, otherwise [1, N, C].
    let channel_major = dims[1] < dims[2];
    let (channels, anchors) = if channel_major {
        (dims[1], dims[2])
    } else {
        (dims[2], dims[1])
    };
    if channels <= YOLO_BOX_CHANNELS {
        return Err(DetectorError::Inference(format!(
            "YOLO output needs at least 5 channels, got {channels}"
        )));
    }

    let candidates = decode_predictions(data, channels, anchors, channel_major, &letterbox, threshold);
    let kept = nms(candidates, YOLO_NMS_THRESHOLD);
    tracing::debug!(faces = kept.len(), "YOLO detections after NMS");

    Ok(best_face(&kept, width, height)
        .map(|b| Landmarks::face(YOLO_ID, b.rect, b.confidence))
        .unwrap_or_else(|| Landmarks::none(YOLO_ID)))
}

/// Letterbox an RGB image into a normalized NCHW tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let letterbox = LetterboxInfo::compute(width as usize, height as usize, YOLO_INPUT_SIZE);
    let resized = image::imageops::resize(
        image,
        letterbox.new_w as u32,
        letterbox.new_h as u32,
        FilterType::Triangle,
    );

    let pad_x_start = letterbox.pad_x.floor() as usize;
    let pad_y_start = letterbox.pad_y.floor() as usize;
    let pad = YOLO_PAD_VALUE / 255.0;

    let mut tensor = Array4::<f32>::from_elem((1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE), pad);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = x as usize + pad_x_start;
        let ty = y as usize + pad_y_start;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
        }
    }

    (tensor, letterbox)
}

/// Decode raw predictions into source-space boxes above `threshold`.
fn decode_predictions(
    data: &[f32],
    channels: usize,
    anchors: usize,
    channel_major: bool,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<ScoredBox> {
    let at = |anchor: usize, channel: usize| -> f32 {
        let idx = if channel_major {
            channel * anchors + anchor
        } else {
            anchor * channels + channel
        };
        data.get(idx).copied().unwrap_or(0.0)
    };

    let mut boxes = Vec::new();
    for i in 0..anchors {
        let score = at(i, YOLO_BOX_CHANNELS);
        if !score.is_finite() || score <= threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
        if ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
            continue;
        }
        let (x1, y1) = letterbox.to_source(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_source(cx + w / 2.0, cy + h / 2.0);

        boxes.push(ScoredBox {
            rect: FaceRect::new(x1, y1, x2 - x1, y2 - y1),
            confidence: score,
        });
    }
    boxes
}

/// Highest-confidence box, clipped to the image. Boxes that vanish after
/// clipping are skipped.
pub(crate) fn best_face(boxes: &[ScoredBox], width: u32, height: u32) -> Option<ScoredBox> {
    boxes
        .iter()
        .filter_map(|b| {
            let x1 = b.rect.x.clamp(0.0, width as f32);
            let y1 = b.rect.y.clamp(0.0, height as f32);
            let x2 = (b.rect.x + b.rect.width).clamp(0.0, width as f32);
            let y2 = (b.rect.y + b.rect.height).clamp(0.0, height as f32);
            let rect = FaceRect::new(x1, y1, x2 - x1, y2 - y1);
            rect.is_valid().then_some(ScoredBox {
                rect,
                confidence: b.confidence,
            })
        })
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Non-Maximum Suppression: remove overlapping detections.
pub(crate) fn nms(mut detections: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i].rect, &detections[j].rect) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union between two rectangles.
fn iou(a: &FaceRect, b: &FaceRect) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
