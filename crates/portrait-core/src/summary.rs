//! Per-unit outcomes and the machine-readable run summary.

use crate::crop::{CropRect, CropTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Final state of one identity × variant unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Generated,
    Placeholder,
    Failed,
    Skipped,
}

/// Result of one identity × variant unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub identity_id: String,
    pub variant_key: String,
    pub outcome: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropRect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_tier: Option<CropTier>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl GenerationOutcome {
    pub(crate) fn new(identity_id: &str, variant_key: &str, outcome: OutcomeKind) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            variant_key: variant_key.to_string(),
            outcome,
            crop: None,
            crop_tier: None,
            elapsed_ms: 0,
            error_detail: None,
            output_path: None,
        }
    }

    pub(crate) fn failed(identity_id: &str, variant_key: &str, detail: impl Into<String>) -> Self {
        Self {
            error_detail: Some(detail.into()),
            ..Self::new(identity_id, variant_key, OutcomeKind::Failed)
        }
    }
}

/// Outcome totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub generated: usize,
    pub placeholder: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    pub fn total(&self) -> usize {
        self.generated + self.placeholder + self.failed + self.skipped
    }
}

/// Aggregate of one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub detector_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    /// Identities never started because the run was cancelled or aborted.
    pub not_dispatched: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub counts: OutcomeCounts,
    pub outcomes: Vec<GenerationOutcome>,
}

impl RunSummary {
    pub(crate) fn new(detector_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            started_at,
            elapsed_ms: 0,
            cancelled: false,
            not_dispatched: 0,
            cache_hits: 0,
            cache_misses: 0,
            counts: OutcomeCounts::default(),
            outcomes: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, outcome: GenerationOutcome) {
        match outcome.outcome {
            OutcomeKind::Generated => self.counts.generated += 1,
            OutcomeKind::Placeholder => self.counts.placeholder += 1,
            OutcomeKind::Failed => self.counts.failed += 1,
            OutcomeKind::Skipped => self.counts.skipped += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn has_failures(&self) -> bool {
        self.counts.failed > 0
    }

    /// Outcomes for one identity, in variant order.
    pub fn outcomes_for<'a>(&'a self, identity_id: &'a str) -> impl Iterator<Item = &'a GenerationOutcome> + 'a {
        self.outcomes.iter().filter(move |o| o.identity_id == identity_id)
    }

    /// Write the summary as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
