//! ResNet-10 single-shot face detector (the OpenCV DNN face model, exported
//! to ONNX) via ONNX Runtime.

use super::yolo::{best_face, ScoredBox};
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

pub const MODEL_FILE: &str = "res10_300x300_ssd.onnx";
pub const SSD_ID: &str = "ssd";

const SSD_INPUT_SIZE: u32 = 300;
/// Per-channel means in BGR order, subtracted from raw 0..255 values.
const SSD_MEAN_BGR: [f32; 3] = [104.0, 177.0, 123.0];
/// `[image_id, label, confidence, x1, y1, x2, y2]`
const SSD_ROW_LEN: usize = 7;

/// SSD backend. Reports faces only.
pub struct SsdDetector {
    session: Arc<Mutex<Session>>,
    threshold: f32,
}

impl SsdDetector {
    pub fn load(model_path: &Path, threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::unavailable(
                SSD_ID,
                format!("model file not found: {}", model_path.display()),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded SSD face model");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            threshold,
        })
    }
}

#[async_trait]
impl FaceDetector for SsdDetector {
    fn id(&self) -> &str {
        SSD_ID
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
        return Ok(Landmarks::none(SSD_ID));
    }

    let input = preprocess(image);
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
    let (_, rows) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectorError::Inference(format!("ssd detections: {e}")))?;

    let candidates = decode_rows(rows, width, height, threshold);
    tracing::debug!(candidates = candidates.len(), "SSD detections above threshold");

    Ok(best_face(&candidates, width, height)
        .map(|b| Landmarks::face(SSD_ID, b.rect, b.confidence))
        .unwrap_or_else(|| Landmarks::none(SSD_ID)))
}

/// Stretch to 300×300 and lay out as mean-subtracted BGR NCHW.
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let resized = image::imageops::resize(image, SSD_INPUT_SIZE, SSD_INPUT_SIZE, FilterType::Triangle);
    let size = SSD_INPUT_SIZE as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[2] as f32 - SSD_MEAN_BGR[0];
        tensor[[0, 1, y, x]] = pixel[1] as f32 - SSD_MEAN_BGR[1];
        tensor[[0, 2, y, x]] = pixel[0] as f32 - SSD_MEAN_BGR[2];
    }
    tensor
}

/// Decode `[1, 1, N, 7]` rows with normalized corners into source boxes.
fn decode_rows(rows: &[f32], width: u32, height: u32, threshold: f32) -> Vec<ScoredBox> {
    let (w, h) = (width as f32, height as f32);
    rows.chunks_exact(SSD_ROW_LEN)
        .filter(|row| row[2] > threshold && row[2..].iter().all(|v| v.is_finite()))
        .map(|row| {
            let (x1, y1, x2, y2) = (row[3] * w, row[4] * h, row[5] * w, row[6] * h);
            ScoredBox {
                rect: FaceRect::new(x1, y1, x2 - x1, y2 - y1),
                confidence: row[2],
            }
        })
        .collect()
}
