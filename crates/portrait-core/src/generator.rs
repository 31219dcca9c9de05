//! Generation orchestrator.
//!
//! Drives every roster identity through
//! `photo → decode → (cache | detect) → crop → resize → encode` once per
//! variant plan, with bounded parallelism. Each identity is decoded, hashed
//! and detected once; all of its variants reuse the same landmarks.

use crate::cache::{content_fingerprint, CacheKey, CachedDetection, DetectionCache};
use crate::cancel::CancelHandle;
use crate::crop::{compute_crop, CropPolicy, NoFaceAnchor};
use crate::detector::center::CENTER_ID;
use crate::detector::{DetectorError, FaceDetector};
use crate::render::{self, OutputFormat, RenderError};
use crate::summary::{GenerationOutcome, OutcomeKind, RunSummary};
use crate::types::Landmarks;
use crate::variant::VariantPlan;
use chrono::Utc;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("no size variants to generate")]
    NoVariants,
    #[error("cannot load placeholder {path}: {source}")]
    Placeholder {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("detector '{backend}' became unavailable during the run: {reason}")]
    BackendLost {
        backend: String,
        reason: String,
        /// Outcomes of the units that finished before the run stopped.
        summary: Box<RunSummary>,
    },
}

/// Why one identity failed. Recorded as `errorDetail` on its outcomes.
#[derive(Error, Debug)]
pub enum UnitFailure {
    #[error("cannot read photo {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode photo {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("detection failed: {0}")]
    Detection(String),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("identity id '{0}' is not a plain file name")]
    InvalidIdentity(String),
    #[error("worker task failed: {0}")]
    Task(String),
}

/// One roster line: an identity and its resolved photo, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub identity_id: String,
    #[serde(default)]
    pub photo_path: Option<PathBuf>,
}

impl RosterEntry {
    pub fn new(identity_id: impl Into<String>, photo_path: Option<PathBuf>) -> Self {
        Self {
            identity_id: identity_id.into(),
            photo_path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub format: OutputFormat,
    pub jpeg_quality: u8,
    /// Identities processed concurrently.
    pub workers: usize,
    pub crop_policy: CropPolicy,
    /// Overrides the no-face anchor. When unset, runs with the `center`
    /// detector anchor on the upper body and all others on the image center.
    pub no_face_anchor: Option<NoFaceAnchor>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg,
            jpeg_quality: 90,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            crop_policy: CropPolicy::default(),
            no_face_anchor: None,
        }
    }
}

/// Generates portraits for a roster with a fixed detector and cache.
pub struct PortraitGenerator {
    detector: Arc<dyn FaceDetector>,
    cache: Option<Arc<dyn DetectionCache>>,
    options: GenerateOptions,
    cancel: CancelHandle,
}

impl PortraitGenerator {
    /// `cache = None` disables lookups and stores without touching any store.
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        cache: Option<Arc<dyn DetectionCache>>,
        options: GenerateOptions,
    ) -> Self {
        Self {
            detector,
            cache,
            options,
            cancel: CancelHandle::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn detector_id(&self) -> &str {
        self.detector.id()
    }

    /// Run every identity × plan unit.
    ///
    /// Per-unit problems become `Failed` outcomes and the batch continues.
    /// If the detector becomes unavailable, dispatch stops, in-flight
    /// identities finish and [`GenerateError::BackendLost`] carries the
    /// partial summary. Outcomes are reported in roster order.
    pub async fn run(&self, roster: &[RosterEntry], plans: &[VariantPlan]) -> Result<RunSummary, GenerateError> {
        if plans.is_empty() {
            return Err(GenerateError::NoVariants);
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let ctx = Arc::new(RunContext::prepare(
            Arc::clone(&self.detector),
            self.cache.clone(),
            self.cancel.clone(),
            plans,
            &self.options,
        )?);
        let workers = self.options.workers.max(1);

        tracing::info!(
            detector = self.detector.id(),
            identities = roster.len(),
            variants = plans.len(),
            workers,
            cache = self.cache.is_some(),
            "generation started"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut dispatched = 0usize;

        for (index, entry) in roster.iter().enumerate() {
            if self.cancel.is_cancelled() || ctx.stopped() {
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if self.cancel.is_cancelled() || ctx.stopped() {
                break;
            }

            let ctx = Arc::clone(&ctx);
            let entry = entry.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (index, process_identity(ctx, entry).await)
            });
            dispatched += 1;
        }

        let mut results: Vec<Option<Vec<GenerationOutcome>>> = vec![None; dispatched];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcomes)) => results[index] = Some(outcomes),
                Err(e) => tracing::error!(error = %e, "generation task failed"),
            }
        }

        let mut summary = RunSummary::new(self.detector.id(), started_at);
        for (index, outcomes) in results.into_iter().enumerate() {
            let outcomes = outcomes.unwrap_or_else(|| {
                ctx.fail_all(
                    &roster[index].identity_id,
                    &UnitFailure::Task("identity task panicked".into()),
                    clock,
                )
            });
            for outcome in outcomes {
                summary.record(outcome);
            }
        }
        summary.not_dispatched = roster.len() - dispatched;
        summary.cancelled = self.cancel.is_cancelled();
        summary.cache_hits = ctx.cache_hits.load(Ordering::Relaxed);
        summary.cache_misses = ctx.cache_misses.load(Ordering::Relaxed);
        summary.elapsed_ms = clock.elapsed().as_millis() as u64;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.flush() {
                tracing::warn!(error = %e, "failed to flush detection cache");
            }
        }

        tracing::info!(
            generated = summary.counts.generated,
            placeholder = summary.counts.placeholder,
            failed = summary.counts.failed,
            skipped = summary.counts.skipped,
            not_dispatched = summary.not_dispatched,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "generation finished"
        );

        match ctx.take_lost() {
            Some((backend, reason)) => Err(GenerateError::BackendLost {
                backend,
                reason,
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }
}

/// State shared by all identity tasks of one run.
struct RunContext {
    detector: Arc<dyn FaceDetector>,
    cache: Option<Arc<dyn DetectionCache>>,
    plans: Vec<VariantPlan>,
    placeholders: HashMap<PathBuf, Arc<DynamicImage>>,
    format: OutputFormat,
    jpeg_quality: u8,
    policy: CropPolicy,
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    lost: Mutex<Option<(String, String)>>,
    stop: AtomicBool,
    cancel: CancelHandle,
}

impl RunContext {
    /// Resolve the crop policy and decode every placeholder up front, so a
    /// broken placeholder fails the run before any output is written.
    fn prepare(
        detector: Arc<dyn FaceDetector>,
        cache: Option<Arc<dyn DetectionCache>>,
        cancel: CancelHandle,
        plans: &[VariantPlan],
        options: &GenerateOptions,
    ) -> Result<Self, GenerateError> {
        let mut placeholders = HashMap::new();
        for path in plans.iter().filter_map(|p| p.placeholder.as_ref()) {
            if placeholders.contains_key(path) {
                continue;
            }
            let image = image::open(path).map_err(|source| GenerateError::Placeholder {
                path: path.clone(),
                source,
            })?;
            placeholders.insert(path.clone(), Arc::new(image));
        }

        let mut policy = options.crop_policy;
        policy.no_face_anchor = options.no_face_anchor.unwrap_or(if detector.id() == CENTER_ID {
            NoFaceAnchor::Upper
        } else {
            NoFaceAnchor::Center
        });

        Ok(Self {
            detector,
            cache,
            plans: plans.to_vec(),
            placeholders,
            format: options.format,
            jpeg_quality: options.jpeg_quality,
            policy,
            cache_hits: AtomicUsize::new(0),
            cache_misses: AtomicUsize::new(0),
            lost: Mutex::new(None),
            stop: AtomicBool::new(false),
            cancel,
        })
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn mark_lost(&self, error: &DetectorError) {
        self.stop.store(true, Ordering::SeqCst);
        let mut lost = self.lost.lock().unwrap_or_else(|p| p.into_inner());
        if lost.is_none() {
            let (backend, reason) = match error {
                DetectorError::Unavailable { backend, reason } => (backend.clone(), reason.clone()),
                other => (self.detector.id().to_string(), other.to_string()),
            };
            tracing::error!(backend = %backend, reason = %reason, "detector lost, stopping dispatch");
            *lost = Some((backend, reason));
        }
    }

    fn take_lost(&self) -> Option<(String, String)> {
        self.lost.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn fail_all(&self, identity_id: &str, failure: &UnitFailure, clock: Instant) -> Vec<GenerationOutcome> {
        tracing::warn!(identity = identity_id, error = %failure, "identity failed");
        let elapsed_ms = clock.elapsed().as_millis() as u64;
        self.plans
            .iter()
            .map(|plan| GenerationOutcome {
                elapsed_ms,
                ..GenerationOutcome::failed(identity_id, &plan.key, failure.to_string())
            })
            .collect()
    }

    /// Cache lookup, falling back to the detector. Negative results and
    /// deterministic failures are stored; transient errors (timeouts, 5xx,
    /// cancellation) are not.
    async fn detect(&self, fingerprint: &str, image: Arc<RgbImage>) -> Result<Landmarks, UnitFailure> {
        let key = CacheKey::new(fingerprint, self.detector.id());

        if let Some(cache) = &self.cache {
            match cache.lookup(&key) {
                Some(CachedDetection::Detected { landmarks }) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key.encode(), face = landmarks.face_detected, "cache hit");
                    return Ok(landmarks);
                }
                Some(CachedDetection::Failed { reason }) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key.encode(), "cache hit (failed detection)");
                    return Err(UnitFailure::Detection(reason));
                }
                None => {
                    self.cache_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        match self.detector.detect(image, &self.cancel).await {
            Ok(landmarks) if landmarks.is_consistent() => {
                if let Some(cache) = &self.cache {
                    cache.store(
                        key,
                        CachedDetection::Detected {
                            landmarks: landmarks.clone(),
                        },
                    );
                }
                Ok(landmarks)
            }
            Ok(_) => Err(UnitFailure::Detection(
                "detector returned inconsistent landmarks".into(),
            )),
            Err(e) if e.is_unavailable() => {
                self.mark_lost(&e);
                Err(UnitFailure::Detection(e.to_string()))
            }
            Err(e) if e.is_transient() => Err(UnitFailure::Detection(e.to_string())),
            Err(e) => {
                let reason = e.to_string();
                if let Some(cache) = &self.cache {
                    cache.store(key, CachedDetection::Failed { reason: reason.clone() });
                }
                Err(UnitFailure::Detection(reason))
            }
        }
    }

    fn render_photo(
        &self,
        identity_id: &str,
        image: &DynamicImage,
        landmarks: &Landmarks,
        plan: &VariantPlan,
        clock: Instant,
    ) -> GenerationOutcome {
        let decision = compute_crop(
            image.width(),
            image.height(),
            landmarks,
            plan.width,
            plan.height,
            &self.policy,
        );
        let path = plan
            .output_dir
            .join(render::output_file_name(identity_id, self.format));

        let result = render::render_portrait(image, &decision.rect, plan.width, plan.height)
            .and_then(|portrait| render::save_portrait(&portrait, &path, self.format, self.jpeg_quality));

        let mut outcome = match result {
            Ok(()) => {
                tracing::debug!(
                    identity = identity_id,
                    variant = %plan.key,
                    tier = ?decision.tier,
                    "portrait generated"
                );
                GenerationOutcome {
                    output_path: Some(path),
                    ..GenerationOutcome::new(identity_id, &plan.key, OutcomeKind::Generated)
                }
            }
            Err(e) => {
                tracing::warn!(identity = identity_id, variant = %plan.key, error = %e, "portrait failed");
                GenerationOutcome::failed(identity_id, &plan.key, UnitFailure::from(e).to_string())
            }
        };
        outcome.crop = Some(decision.rect);
        outcome.crop_tier = Some(decision.tier);
        outcome.elapsed_ms = clock.elapsed().as_millis() as u64;
        outcome
    }

    /// Units for an identity without a photo: placeholder where configured,
    /// otherwise skipped.
    fn render_no_photo(&self, identity_id: &str, clock: Instant) -> Vec<GenerationOutcome> {
        self.plans
            .iter()
            .map(|plan| {
                let placeholder = plan
                    .placeholder
                    .as_ref()
                    .and_then(|p| self.placeholders.get(p));
                let Some(placeholder) = placeholder else {
                    return GenerationOutcome {
                        elapsed_ms: clock.elapsed().as_millis() as u64,
                        ..GenerationOutcome::new(identity_id, &plan.key, OutcomeKind::Skipped)
                    };
                };

                let path = plan
                    .output_dir
                    .join(render::output_file_name(identity_id, self.format));
                let result = render::render_full(placeholder, plan.width, plan.height)
                    .and_then(|img| render::save_portrait(&img, &path, self.format, self.jpeg_quality));

                let outcome = match result {
                    Ok(()) => GenerationOutcome {
                        output_path: Some(path),
                        ..GenerationOutcome::new(identity_id, &plan.key, OutcomeKind::Placeholder)
                    },
                    Err(e) => GenerationOutcome::failed(identity_id, &plan.key, e.to_string()),
                };
                GenerationOutcome {
                    elapsed_ms: clock.elapsed().as_millis() as u64,
                    ..outcome
                }
            })
            .collect()
    }
}

async fn process_identity(ctx: Arc<RunContext>, entry: RosterEntry) -> Vec<GenerationOutcome> {
    let clock = Instant::now();
    let RosterEntry {
        identity_id,
        photo_path,
    } = entry;

    // The id becomes the output file stem.
    if !render::is_safe_identity(&identity_id) {
        let failure = UnitFailure::InvalidIdentity(identity_id.clone());
        return ctx.fail_all(&identity_id, &failure, clock);
    }

    let Some(path) = photo_path else {
        let worker = Arc::clone(&ctx);
        let id = identity_id.clone();
        return tokio::task::spawn_blocking(move || worker.render_no_photo(&id, clock))
            .await
            .unwrap_or_else(|e| ctx.fail_all(&identity_id, &UnitFailure::Task(e.to_string()), clock));
    };

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(source) => return ctx.fail_all(&identity_id, &UnitFailure::Read { path, source }, clock),
    };

    let decode_path = path.clone();
    let decoded = tokio::task::spawn_blocking(move || {
        let fingerprint = content_fingerprint(&bytes);
        image::load_from_memory(&bytes)
            .map(|image| {
                let rgb = image.to_rgb8();
                (fingerprint, image, rgb)
            })
            .map_err(|source| UnitFailure::Decode {
                path: decode_path,
                source,
            })
    })
    .await
    .unwrap_or_else(|e| Err(UnitFailure::Task(e.to_string())));

    let (fingerprint, image, rgb) = match decoded {
        Ok(decoded) => decoded,
        Err(failure) => return ctx.fail_all(&identity_id, &failure, clock),
    };

    let landmarks = match ctx.detect(&fingerprint, Arc::new(rgb)).await {
        Ok(landmarks) => landmarks,
        Err(failure) => return ctx.fail_all(&identity_id, &failure, clock),
    };

    let worker = Arc::clone(&ctx);
    let id = identity_id.clone();
    tokio::task::spawn_blocking(move || {
        worker
            .plans
            .iter()
            .map(|plan| worker.render_photo(&id, &image, &landmarks, plan, clock))
            .collect::<Vec<_>>()
    })
    .await
    .unwrap_or_else(|e| ctx.fail_all(&identity_id, &UnitFailure::Task(e.to_string()), clock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::detector::CenterDetector;
    use crate::types::DetectorCapabilities;
    use async_trait::async_trait;

    struct FixedDetector(Landmarks);

    #[async_trait]
    impl FaceDetector for FixedDetector {
        fn id(&self) -> &str {
            "fixed"
        }

        fn capabilities(&self) -> DetectorCapabilities {
            DetectorCapabilities {
                eyes: true,
                network: false,
            }
        }

        async fn detect(&self, _image: Arc<RgbImage>, _cancel: &CancelHandle) -> Result<Landmarks, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Always fails with the error its function builds.
    struct FailingDetector(fn() -> DetectorError);

    #[async_trait]
    impl FaceDetector for FailingDetector {
        fn id(&self) -> &str {
            "failing"
        }

        fn capabilities(&self) -> DetectorCapabilities {
            DetectorCapabilities {
                eyes: false,
                network: false,
            }
        }

        async fn detect(&self, _image: Arc<RgbImage>, _cancel: &CancelHandle) -> Result<Landmarks, DetectorError> {
            Err((self.0)())
        }
    }

    fn plan(dir: &std::path::Path) -> VariantPlan {
        VariantPlan {
            key: "standard".into(),
            width: 20,
            height: 30,
            output_dir: dir.to_path_buf(),
            placeholder: None,
        }
    }

    #[test]
    fn test_center_detector_anchors_on_upper_body() {
        let options = GenerateOptions::default();
        let ctx = RunContext::prepare(Arc::new(CenterDetector::new()), None, CancelHandle::new(), &[], &options).unwrap();
        assert_eq!(ctx.policy.no_face_anchor, NoFaceAnchor::Upper);

        let options = GenerateOptions {
            no_face_anchor: Some(NoFaceAnchor::Center),
            ..Default::default()
        };
        let ctx = RunContext::prepare(Arc::new(CenterDetector::new()), None, CancelHandle::new(), &[], &options).unwrap();
        assert_eq!(ctx.policy.no_face_anchor, NoFaceAnchor::Center);
    }

    #[test]
    fn test_other_detectors_anchor_on_center() {
        let ctx = RunContext::prepare(
            Arc::new(FixedDetector(Landmarks::none("fixed"))),
            None,
            CancelHandle::new(),
            &[],
            &GenerateOptions::default(),
        )
        .unwrap();
        assert_eq!(ctx.policy.no_face_anchor, NoFaceAnchor::Center);
    }

    #[tokio::test]
    async fn test_empty_plans_rejected() {
        let generator = PortraitGenerator::new(Arc::new(CenterDetector::new()), None, GenerateOptions::default());
        let err = generator.run(&[], &[]).await.unwrap_err();
        assert!(matches!(err, GenerateError::NoVariants));
    }

    #[tokio::test]
    async fn test_missing_placeholder_fails_before_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = plan(dir.path());
        p.placeholder = Some(dir.path().join("missing.png"));

        let generator = PortraitGenerator::new(Arc::new(CenterDetector::new()), None, GenerateOptions::default());
        let roster = [RosterEntry::new("1", None)];
        let err = generator.run(&roster, &[p]).await.unwrap_err();
        assert!(matches!(err, GenerateError::Placeholder { .. }));
        assert!(!dir.path().join("1.jpg").exists());
    }

    #[tokio::test]
    async fn test_missing_photo_file_is_failed_not_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let generator = PortraitGenerator::new(Arc::new(CenterDetector::new()), None, GenerateOptions::default());
        let roster = [RosterEntry::new("1", Some(dir.path().join("nope.jpg")))];
        let summary = generator.run(&roster, &[plan(dir.path())]).await.unwrap();
        assert_eq!(summary.counts.failed, 1);
        assert!(summary.outcomes[0]
            .error_detail
            .as_deref()
            .unwrap()
            .contains("cannot read photo"));
    }

    #[tokio::test]
    async fn test_inconsistent_landmarks_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("p.png");
        RgbImage::new(40, 40).save(&photo).unwrap();

        let mut bad = Landmarks::none("fixed");
        bad.both_eyes_detected = true;
        let cache = Arc::new(MemoryCache::new());
        let generator = PortraitGenerator::new(
            Arc::new(FixedDetector(bad)),
            Some(cache.clone() as Arc<dyn DetectionCache>),
            GenerateOptions::default(),
        );
        let summary = generator
            .run(&[RosterEntry::new("1", Some(photo))], &[plan(dir.path())])
            .await
            .unwrap();
        assert_eq!(summary.counts.failed, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let generator = PortraitGenerator::new(Arc::new(CenterDetector::new()), None, GenerateOptions::default());
        let handle = generator.cancel_handle();
        assert!(!generator.cancel.is_cancelled());
        handle.cancel();
        assert!(generator.cancel.is_cancelled());
    }

    async fn run_failing(make: fn() -> DetectorError) -> (RunSummary, Arc<MemoryCache>) {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("p.png");
        RgbImage::new(40, 40).save(&photo).unwrap();

        let cache = Arc::new(MemoryCache::new());
        let generator = PortraitGenerator::new(
            Arc::new(FailingDetector(make)),
            Some(cache.clone() as Arc<dyn DetectionCache>),
            GenerateOptions::default(),
        );
        let summary = generator
            .run(&[RosterEntry::new("1", Some(photo))], &[plan(dir.path())])
            .await
            .unwrap();
        (summary, cache)
    }

    #[tokio::test]
    async fn test_transient_detector_errors_not_cached() {
        let (summary, cache) = run_failing(|| DetectorError::Transient {
            backend: "failing".into(),
            reason: "http://localhost/api/generate returned 503 Service Unavailable".into(),
        })
        .await;
        assert_eq!(summary.counts.failed, 1);
        assert!(cache.is_empty());

        let (summary, cache) = run_failing(|| DetectorError::Cancelled {
            backend: "failing".into(),
        })
        .await;
        assert_eq!(summary.counts.failed, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_inference_errors_cached_as_failed() {
        let (summary, cache) = run_failing(|| DetectorError::Inference("bad tensor".into())).await;
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_identity_escaping_output_dir_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let photo = dir.path().join("p.png");
        RgbImage::new(40, 40).save(&photo).unwrap();

        let generator = PortraitGenerator::new(Arc::new(CenterDetector::new()), None, GenerateOptions::default());
        let roster = [
            RosterEntry::new("../escaped", Some(photo.clone())),
            RosterEntry::new("/abs", None),
            RosterEntry::new("ok", Some(photo)),
        ];
        let summary = generator.run(&roster, &[plan(&out)]).await.unwrap();

        assert_eq!(summary.counts.failed, 2);
        assert_eq!(summary.counts.generated, 1);
        assert!(summary.outcomes[0]
            .error_detail
            .as_deref()
            .unwrap()
            .contains("not a plain file name"));
        assert!(!dir.path().join("escaped.jpg").exists());
        assert!(out.join("ok.jpg").exists());
    }
}
