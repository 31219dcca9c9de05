//! Face detector abstraction and backend selection.
//!
//! Every backend answers the same question: where is the face, and where are
//! the eyes if the backend can tell. "No face found" is a normal result
//! (`Landmarks::face_detected == false`); an `Err` means the backend could not
//! run at all or failed on one photo.

pub mod cascade;
pub mod center;
pub mod ssd;
pub mod vision;
pub mod yolo;

use crate::cancel::CancelHandle;
use crate::types::{DetectorCapabilities, Landmarks};
use async_trait::async_trait;
use image::RgbImage;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub use cascade::CascadeDetector;
pub use center::CenterDetector;
pub use ssd::SsdDetector;
pub use vision::VisionDetector;
pub use yolo::YoloFaceDetector;

/// Model families served by Ollama that can locate faces.
const VISION_FAMILIES: [&str; 6] = [
    "llava",
    "qwen",
    "gemma",
    "minicpm",
    "moondream",
    "llama3.2-vision",
];

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector '{backend}' unavailable: {reason}")]
    Unavailable { backend: String, reason: String },
    #[error("unknown detector '{0}' (expected center, cascade, ssd, yolo or ollama:<model>)")]
    UnknownBackend(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("detector '{backend}' timed out after {secs}s")]
    Timeout { backend: String, secs: u64 },
    #[error("detector '{backend}' temporarily failed: {reason}")]
    Transient { backend: String, reason: String },
    #[error("detection cancelled on '{backend}'")]
    Cancelled { backend: String },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl DetectorError {
    pub fn unavailable(backend: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// The backend can no longer run; the whole run must stop.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Whether repeating the same detection could give a different answer.
    /// Transient failures are never cached.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Transient { .. } | Self::Cancelled { .. }
        )
    }
}

/// A ready face detection backend.
///
/// Implementations are shared across workers, so `detect` takes `&self`;
/// backends that wrap a stateful session guard it internally.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Stable identifier, part of every detection cache key.
    fn id(&self) -> &str;

    fn capabilities(&self) -> DetectorCapabilities;

    /// Locate the face in `image`. Backends that wait on the network
    /// return [`DetectorError::Cancelled`] once `cancel` fires; local
    /// backends finish the call they started.
    async fn detect(&self, image: Arc<RgbImage>, cancel: &CancelHandle) -> Result<Landmarks, DetectorError>;
}

/// A parsed backend selection, before initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorKind {
    Center,
    Cascade,
    Ssd,
    Yolo,
    Vision { model: String },
}

impl FromStr for DetectorKind {
    type Err = DetectorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Keywords match case-insensitively; model tags keep their case.
        let raw = value.trim();
        let name = raw.to_ascii_lowercase();
        match name.as_str() {
            "center" | "none" => return Ok(Self::Center),
            "cascade" | "seeta" | "haar" => return Ok(Self::Cascade),
            "ssd" | "opencv-dnn" | "dnn" => return Ok(Self::Ssd),
            "yolo" | "yolov8" | "yolov8-face" => return Ok(Self::Yolo),
            _ => {}
        }

        if name.starts_with("ollama:") {
            let model = &raw["ollama:".len()..];
            if model.is_empty() {
                return Err(DetectorError::UnknownBackend(raw.to_string()));
            }
            return Ok(Self::Vision {
                model: model.to_string(),
            });
        }
        if name.contains(':') || VISION_FAMILIES.iter().any(|f| name.starts_with(f)) {
            return Ok(Self::Vision {
                model: raw.to_string(),
            });
        }

        Err(DetectorError::UnknownBackend(raw.to_string()))
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Center => f.write_str("center"),
            Self::Cascade => f.write_str("cascade"),
            Self::Ssd => f.write_str("ssd"),
            Self::Yolo => f.write_str("yolo"),
            Self::Vision { model } => write!(f, "ollama:{model}"),
        }
    }
}

/// Parse a comma-separated fallback chain such as `"llava:7b,qwen3-vl,center"`.
pub fn parse_chain(value: &str) -> Result<Vec<DetectorKind>, DetectorError> {
    let chain = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(DetectorKind::from_str)
        .collect::<Result<Vec<_>, _>>()?;

    if chain.is_empty() {
        return Err(DetectorError::UnknownBackend(value.to_string()));
    }
    Ok(chain)
}

/// Settings shared by all backends.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Directory holding model weights.
    pub model_dir: PathBuf,
    /// Score threshold for the ONNX detectors.
    pub min_face_confidence: f32,
    pub ollama_url: String,
    /// Per-call limit for vision model requests (and the startup model check).
    pub vision_timeout: Duration,
    /// Retries after a transient vision failure.
    pub vision_retries: u32,
    /// Vision results below this confidence count as "no face".
    pub vision_confidence_floor: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_dir: crate::default_model_dir(),
            min_face_confidence: 0.5,
            ollama_url: "http://localhost:11434".to_string(),
            vision_timeout: Duration::from_secs(60),
            vision_retries: 2,
            vision_confidence_floor: 0.5,
        }
    }
}

/// Initialize one backend. Any failure is reported as
/// [`DetectorError::Unavailable`] naming the backend.
pub async fn initialize(
    kind: &DetectorKind,
    settings: &DetectorSettings,
) -> Result<Arc<dyn FaceDetector>, DetectorError> {
    let label = kind.to_string();
    let result: Result<Arc<dyn FaceDetector>, DetectorError> = match kind {
        DetectorKind::Center => Ok(Arc::new(CenterDetector::new())),
        DetectorKind::Cascade => CascadeDetector::load(&settings.model_dir.join(cascade::MODEL_FILE))
            .map(|d| Arc::new(d) as Arc<dyn FaceDetector>),
        DetectorKind::Ssd => SsdDetector::load(
            &settings.model_dir.join(ssd::MODEL_FILE),
            settings.min_face_confidence,
        )
        .map(|d| Arc::new(d) as Arc<dyn FaceDetector>),
        DetectorKind::Yolo => YoloFaceDetector::load(
            &settings.model_dir.join(yolo::MODEL_FILE),
            settings.min_face_confidence,
        )
        .map(|d| Arc::new(d) as Arc<dyn FaceDetector>),
        DetectorKind::Vision { model } => VisionDetector::connect(model, settings)
            .await
            .map(|d| Arc::new(d) as Arc<dyn FaceDetector>),
    };

    match result {
        Ok(detector) => {
            tracing::info!(
                backend = detector.id(),
                eyes = detector.capabilities().eyes,
                network = detector.capabilities().network,
                "face detector ready"
            );
            Ok(detector)
        }
        Err(e @ DetectorError::Unavailable { .. }) => Err(e),
        Err(e) => Err(DetectorError::unavailable(label, e)),
    }
}

/// Try each backend in order and return the first one that initializes.
///
/// The choice is fixed for the run: later detection failures never move on
/// to the next entry.
pub async fn initialize_chain(
    chain: &[DetectorKind],
    settings: &DetectorSettings,
) -> Result<Arc<dyn FaceDetector>, DetectorError> {
    let mut attempts = Vec::with_capacity(chain.len());

    for kind in chain {
        match initialize(kind, settings).await {
            Ok(detector) => {
                if !attempts.is_empty() {
                    tracing::info!(backend = detector.id(), skipped = attempts.len(), "using fallback detector");
                }
                return Ok(detector);
            }
            Err(e) => {
                tracing::warn!(backend = %kind, error = %e, "detector failed to initialize");
                let reason = match e {
                    DetectorError::Unavailable { reason, .. } => reason,
                    other => other.to_string(),
                };
                attempts.push((kind.to_string(), reason));
            }
        }
    }

    Err(DetectorError::Unavailable {
        backend: attempts
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(","),
        reason: if attempts.is_empty() {
            "no detector configured".to_string()
        } else {
            attempts
                .iter()
                .map(|(name, reason)| format!("{name}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ")
        },
    })
}

/// Run a synchronous model call on the blocking pool with exclusive access
/// to the model.
pub(crate) async fn run_blocking<M, F>(model: &Arc<Mutex<M>>, f: F) -> Result<Landmarks, DetectorError>
where
    M: Send + 'static,
    F: FnOnce(&mut M) -> Result<Landmarks, DetectorError> + Send + 'static,
{
    let model = Arc::clone(model);
    tokio::task::spawn_blocking(move || {
        let mut guard = model
            .lock()
            .map_err(|_| DetectorError::Inference("model lock poisoned".into()))?;
        f(&mut guard)
    })
    .await
    .map_err(|e| DetectorError::Inference(format!("detector task failed: {e}")))?
}
