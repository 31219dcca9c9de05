//! Vision-language model backend served by Ollama.
//!
//! The photo is sent as a downscaled JPEG together with a prompt asking for a
//! JSON answer with normalized face and eye coordinates. Network failures are
//! retried with linear backoff; answers below the confidence floor count as
//! "no face".

use super::{DetectorError, FaceDetector, DetectorSettings};
use crate::cancel::CancelHandle;
use crate::types::{DetectorCapabilities, FaceRect, Landmarks, Point};
use async_trait::async_trait;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Longest side of the image sent to the model.
const MAX_PAYLOAD_SIDE: u32 = 1024;
const PAYLOAD_JPEG_QUALITY: u8 = 85;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

const FACE_PROMPT: &str = "Locate the most prominent human face in this photo. \
Answer with JSON only, no prose, using this shape: \
{\"faceDetected\": true|false, \
\"face\": {\"x\": 0.0, \"y\": 0.0, \"width\": 0.0, \"height\": 0.0}, \
\"leftEye\": {\"x\": 0.0, \"y\": 0.0} or null, \
\"rightEye\": {\"x\": 0.0, \"y\": 0.0} or null, \
\"confidence\": 0.0}. \
All coordinates are fractions of the image width and height between 0 and 1, \
measured from the top-left corner. leftEye is the eye nearer the left edge of the image.";

/// Ollama-hosted vision model.
pub struct VisionDetector {
    client: reqwest::Client,
    base_url: String,
    model: String,
    id: String,
    timeout: Duration,
    retries: u32,
    confidence_floor: f32,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionAnswer {
    #[serde(default, alias = "face_detected")]
    face_detected: bool,
    #[serde(default)]
    face: Option<NormalizedRect>,
    #[serde(default, alias = "left_eye")]
    left_eye: Option<NormalizedPoint>,
    #[serde(default, alias = "right_eye")]
    right_eye: Option<NormalizedPoint>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct NormalizedRect {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct NormalizedPoint {
    x: f32,
    y: f32,
}

/// Outcome of one HTTP attempt that did not produce an answer.
enum AttemptError {
    /// Worth trying again (connection refused, timeout, 5xx).
    Transient(DetectorError),
    Fatal(DetectorError),
}

impl VisionDetector {
    /// Query the Ollama endpoint and verify that `model` has been pulled.
    pub async fn connect(model: &str, settings: &DetectorSettings) -> Result<Self, DetectorError> {
        let id = format!("ollama:{model}");
        let base_url = settings.ollama_url.trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(settings.vision_timeout)
            .build()
            .map_err(|e| DetectorError::unavailable(&id, format!("cannot build HTTP client: {e}")))?;

        let tags_url = format!("{base_url}/api/tags");
        let response = client.get(&tags_url).send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("Ollama at {base_url} did not answer within {}s", settings.vision_timeout.as_secs())
            } else {
                format!("cannot reach Ollama at {base_url}: {e}")
            };
            DetectorError::unavailable(&id, reason)
        })?;

        if !response.status().is_success() {
            return Err(DetectorError::unavailable(
                &id,
                format!("{tags_url} returned {}", response.status()),
            ));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::unavailable(&id, format!("unreadable model list: {e}")))?;

        if !tags.models.iter().any(|m| model_matches(&m.name, model)) {
            return Err(DetectorError::unavailable(
                &id,
                format!("model '{model}' is not pulled (run `ollama pull {model}`)"),
            ));
        }

        tracing::info!(url = %base_url, model, "vision model available");
        Ok(Self {
            client,
            base_url,
            model: model.to_string(),
            id,
            timeout: settings.vision_timeout,
            retries: settings.vision_retries,
            confidence_floor: settings.vision_confidence_floor,
        })
    }

    async fn attempt(&self, payload: &serde_json::Value) -> Result<String, AttemptError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = match self.client.post(&url).json(payload).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(AttemptError::Transient(DetectorError::Timeout {
                    backend: self.id.clone(),
                    secs: self.timeout.as_secs(),
                }))
            }
            Err(e) if e.is_connect() => {
                return Err(AttemptError::Transient(DetectorError::unavailable(
                    &self.id,
                    format!("lost connection to {}: {e}", self.base_url),
                )))
            }
            Err(e) => return Err(AttemptError::Fatal(DetectorError::Inference(e.to_string()))),
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(AttemptError::Transient(DetectorError::Transient {
                backend: self.id.clone(),
                reason: format!("{url} returned {status}"),
            }));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AttemptError::Fatal(DetectorError::unavailable(
                &self.id,
                format!("model '{}' is no longer available", self.model),
            )));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(DetectorError::Inference(format!(
                "{url} returned {status}"
            ))));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::Transient(DetectorError::Timeout {
                    backend: self.id.clone(),
                    secs: self.timeout.as_secs(),
                })
            } else {
                AttemptError::Fatal(DetectorError::Inference(format!("unreadable response: {e}")))
            }
        })?;
        Ok(body.response)
    }
}

#[async_trait]
impl FaceDetector for VisionDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            eyes: true,
            network: true,
        }
    }

    async fn detect(
        &self,
        image: Arc<RgbImage>,
        cancel: &CancelHandle,
    ) -> Result<Landmarks, DetectorError> {
        let cancelled = || DetectorError::Cancelled {
            backend: self.id.clone(),
        };
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Landmarks::none(self.id.clone()));
        }

        let encoded = tokio::task::spawn_blocking(move || encode_payload_image(&image))
            .await
            .map_err(|e| DetectorError::Inference(format!("payload task failed: {e}")))??;

        let payload = serde_json::json!({
            "model": self.model,
            "prompt": FACE_PROMPT,
            "images": [encoded],
            "stream": false,
            "format": "json",
            "options": { "temperature": 0 },
        });

        let mut attempt = 0u32;
        loop {
            let outcome = tokio::select! {
                outcome = self.attempt(&payload) => outcome,
                _ = cancel.cancelled() => return Err(cancelled()),
            };
            match outcome {
                Ok(text) => {
                    return parse_answer(&text, width, height, self.confidence_floor, &self.id);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => {
                    if attempt >= self.retries {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::warn!(backend = %self.id, attempt, error = %e, "retrying vision request");
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_BACKOFF * attempt) => {}
                        _ = cancel.cancelled() => return Err(cancelled()),
                    }
                }
            }
        }
    }
}

/// Ollama reports tags explicitly; a bare name means `:latest`.
fn model_matches(available: &str, wanted: &str) -> bool {
    available.eq_ignore_ascii_case(wanted)
        || (!wanted.contains(':') && available.eq_ignore_ascii_case(&format!("{wanted}:latest")))
}

/// Downscale so the longest side is at most [`MAX_PAYLOAD_SIDE`] and encode
/// as base64 JPEG.
fn encode_payload_image(image: &RgbImage) -> Result<String, DetectorError> {
    let (width, height) = image.dimensions();
    let longest = width.max(height);

    let scaled;
    let source = if longest > MAX_PAYLOAD_SIDE {
        let ratio = MAX_PAYLOAD_SIDE as f32 / longest as f32;
        let w = ((width as f32 * ratio).round() as u32).max(1);
        let h = ((height as f32 * ratio).round() as u32).max(1);
        scaled = image::imageops::resize(image, w, h, FilterType::Triangle);
        &scaled
    } else {
        image
    };

    let mut jpeg = Vec::new();
    source
        .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, PAYLOAD_JPEG_QUALITY))
        .map_err(|e| DetectorError::Inference(format!("cannot encode payload: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
}

/// Turn the model's text answer into landmarks in source pixel space.
fn parse_answer(
    text: &str,
    width: u32,
    height: u32,
    confidence_floor: f32,
    detector_id: &str,
) -> Result<Landmarks, DetectorError> {
    // Models sometimes wrap the object in prose or code fences.
    let json = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => {
            return Err(DetectorError::Inference(format!(
                "vision answer is not JSON: {}",
                text.chars().take(80).collect::<String>()
            )))
        }
    };
    let answer: VisionAnswer = serde_json::from_str(json)
        .map_err(|e| DetectorError::Inference(format!("malformed vision answer: {e}")))?;

    let Some(face) = answer.face.filter(|_| answer.face_detected) else {
        return Ok(Landmarks::none(detector_id));
    };
    let confidence = answer
        .confidence
        .filter(|c| c.is_finite())
        .unwrap_or(1.0)
        .clamp(0.0, 1.0);
    if confidence < confidence_floor {
        tracing::debug!(confidence, floor = confidence_floor, "vision answer below confidence floor");
        return Ok(Landmarks::none(detector_id));
    }

    let (iw, ih) = (width as f32, height as f32);
    // Some models ignore the instruction and answer in pixels.
    let normalized = [face.x, face.y, face.width, face.height]
        .iter()
        .all(|v| *v <= 1.0);
    let (sx, sy) = if normalized { (iw, ih) } else { (1.0, 1.0) };

    let x1 = (face.x * sx).clamp(0.0, iw);
    let y1 = (face.y * sy).clamp(0.0, ih);
    let x2 = ((face.x + face.width) * sx).clamp(0.0, iw);
    let y2 = ((face.y + face.height) * sy).clamp(0.0, ih);
    let rect = FaceRect::new(x1, y1, x2 - x1, y2 - y1);
    if !rect.is_valid() {
        return Ok(Landmarks::none(detector_id));
    }

    let to_pixels = |p: NormalizedPoint| Point::new(p.x * sx, p.y * sy);
    let inside = |p: Point| (p.x.is_finite() && p.y.is_finite() && rect.contains(&p)).then_some(p);
    let mut left = answer.left_eye.map(to_pixels).and_then(inside);
    let mut right = answer.right_eye.map(to_pixels).and_then(inside);

    // Keep image-left in `left_eye` even when the model uses the subject's side.
    if let (Some(l), Some(r)) = (left, right) {
        if l.x > r.x {
            std::mem::swap(&mut left, &mut right);
        }
    }

    Ok(Landmarks::with_eyes(detector_id, rect, left, right, confidence))
}
