use portrait_core::detector::DetectorSettings;
use std::path::PathBuf;
use std::time::Duration;

/// CLI configuration, loaded from environment variables. Command-line flags
/// override individual fields.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing model weight files.
    pub model_dir: PathBuf,
    /// Detection cache file.
    pub cache_path: PathBuf,
    /// Detector chain, comma separated (e.g. `ollama:llava,yolo,center`).
    pub detector: String,
    /// Identities processed concurrently.
    pub workers: usize,
    pub ollama_url: String,
    pub vision_timeout_secs: u64,
    pub vision_retries: u32,
    pub vision_confidence_floor: f32,
    /// Score threshold for the local ONNX detectors.
    pub min_face_confidence: f32,
    pub jpeg_quality: u8,
}

impl Config {
    /// Load configuration from `PORTRAITGEN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let parse_or = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let workers = parse_or("PORTRAITGEN_WORKERS")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            });

        Self {
            model_dir: parse_or("PORTRAITGEN_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(portrait_core::default_model_dir),
            cache_path: parse_or("PORTRAITGEN_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(portrait_core::default_cache_path),
            detector: parse_or("PORTRAITGEN_DETECTOR").unwrap_or_else(|| "center".to_string()),
            workers,
            ollama_url: parse_or("PORTRAITGEN_OLLAMA_URL")
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            vision_timeout_secs: parsed(parse_or("PORTRAITGEN_VISION_TIMEOUT_SECS"), 60),
            vision_retries: parsed(parse_or("PORTRAITGEN_VISION_RETRIES"), 2),
            vision_confidence_floor: parsed(parse_or("PORTRAITGEN_VISION_CONFIDENCE_FLOOR"), 0.5),
            min_face_confidence: parsed(parse_or("PORTRAITGEN_MIN_FACE_CONFIDENCE"), 0.5),
            jpeg_quality: parsed::<u8>(parse_or("PORTRAITGEN_JPEG_QUALITY"), 90).clamp(1, 100),
        }
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            model_dir: self.model_dir.clone(),
            min_face_confidence: self.min_face_confidence,
            ollama_url: self.ollama_url.clone(),
            vision_timeout: Duration::from_secs(self.vision_timeout_secs),
            vision_retries: self.vision_retries,
            vision_confidence_floor: self.vision_confidence_floor,
        }
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
