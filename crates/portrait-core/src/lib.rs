//! portrait-core — Portrait generation engine.
//!
//! Detects faces (and eyes, where the backend can) in roster photos, computes
//! an aspect-correct head-and-shoulders crop, and renders one portrait per
//! identity per size variant. Detection results are cached per photo content
//! and backend so repeated runs skip the expensive step.

pub mod cache;
pub mod cancel;
pub mod crop;
pub mod detector;
pub mod generator;
pub mod profile;
pub mod render;
pub mod summary;
pub mod types;
pub mod variant;

pub use cache::{CacheKey, CachedDetection, DetectionCache, FileCache, MemoryCache};
pub use crop::{compute_crop, CropDecision, CropPolicy, CropRect, CropTier, NoFaceAnchor};
pub use detector::{DetectorError, DetectorKind, DetectorSettings, FaceDetector};
pub use cancel::CancelHandle;
pub use generator::{GenerateError, GenerateOptions, PortraitGenerator, RosterEntry, UnitFailure};
pub use profile::{ProfileError, SizeProfile, SizeVariant};
pub use render::{OutputFormat, RenderError};
pub use summary::{GenerationOutcome, OutcomeKind, RunSummary};
pub use types::{DetectorCapabilities, FaceRect, Landmarks, Point};
pub use variant::{resolve_variants, ProfileMode, SizeRequest, VariantPlan};

use std::path::PathBuf;

/// Default model directory: `$XDG_DATA_HOME/portraitgen/models`, falling back
/// to `~/.local/share/portraitgen/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("portraitgen").join("models")
}

/// Default detection cache file: `$XDG_CACHE_HOME/portraitgen/detections.json`.
pub fn default_cache_path() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| home().join(".cache"));
    base.join("portraitgen").join("detections.json")
}

fn data_home() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| home().join(".local").join("share"))
}

fn home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
