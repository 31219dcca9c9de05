//! End-to-end runs of the generator with a scripted detector and the
//! in-memory cache. No model weights or network access needed.

use async_trait::async_trait;
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use portrait_core::{
    resolve_variants, CancelHandle, CropTier, DetectionCache, DetectorCapabilities, DetectorError,
    FaceDetector, FaceRect, GenerateError, GenerateOptions, Landmarks, MemoryCache, OutcomeKind,
    Point, PortraitGenerator, ProfileMode, RosterEntry, SizeProfile, SizeRequest, SizeVariant,
    VariantPlan,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

enum Script {
    Eyes,
    FaceOnly,
    Fail,
    Unavailable,
    /// Blocks until the run is cancelled.
    Hang,
}

/// Counts calls and answers according to its script.
struct ScriptedDetector {
    script: Script,
    calls: AtomicUsize,
    cancel_on_call: Mutex<Option<CancelHandle>>,
}

impl ScriptedDetector {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            cancel_on_call: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    fn id(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            eyes: true,
            network: false,
        }
    }

    async fn detect(&self, image: Arc<RgbImage>, cancel: &CancelHandle) -> Result<Landmarks, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.cancel_on_call.lock().unwrap().as_ref() {
            handle.cancel();
        }

        let (w, h) = (image.width() as f32, image.height() as f32);
        let face = FaceRect::new(w * 0.4, h * 0.25, w * 0.2, h * 0.2);
        match self.script {
            Script::Eyes => Ok(Landmarks::with_eyes(
                "scripted",
                face,
                Some(Point::new(w * 0.45, h * 0.32)),
                Some(Point::new(w * 0.55, h * 0.32)),
                0.9,
            )),
            Script::FaceOnly => Ok(Landmarks::face("scripted", face, 0.8)),
            Script::Fail => Err(DetectorError::Inference("tensor shape mismatch".into())),
            Script::Unavailable => Err(DetectorError::unavailable("scripted", "connection refused")),
            Script::Hang => {
                cancel.cancelled().await;
                Err(DetectorError::Cancelled {
                    backend: "scripted".into(),
                })
            }
        }
    }
}

fn write_photo(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_fn(400, 600, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]))
        .save(&path)
        .unwrap();
    path
}

fn single(dir: &Path, width: u32, height: u32) -> Vec<VariantPlan> {
    resolve_variants(
        &SizeRequest::Single {
            width,
            height,
            placeholder: None,
        },
        dir,
    )
    .unwrap()
}

fn options(workers: usize) -> GenerateOptions {
    GenerateOptions {
        workers,
        ..Default::default()
    }
}

fn variant(key: &str, width: u32, height: u32) -> SizeVariant {
    SizeVariant {
        key: key.into(),
        width,
        height,
        output_subfolder: None,
        placeholder_path: None,
    }
}

#[tokio::test]
async fn test_all_variants_writes_one_directory_per_variant() {
    let photos = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let roster = vec![
        RosterEntry::new("101", Some(write_photo(photos.path(), "a.png"))),
        RosterEntry::new("102", Some(write_photo(photos.path(), "b.png"))),
    ];
    let profile = SizeProfile {
        name: "league".into(),
        variants: vec![variant("small", 34, 50), variant("standard", 200, 300), variant("large", 400, 600)],
    };
    let plans = resolve_variants(
        &SizeRequest::Profile {
            profile,
            mode: ProfileMode::AllVariants,
        },
        out.path(),
    )
    .unwrap();

    let detector = ScriptedDetector::new(Script::Eyes);
    let generator = PortraitGenerator::new(detector.clone(), None, options(2));
    let summary = generator.run(&roster, &plans).await.unwrap();

    assert_eq!(summary.counts.generated, 6);
    assert!(!summary.has_failures());
    // one detection per identity, not per variant
    assert_eq!(detector.calls(), 2);

    for (key, w, h) in [("small", 34, 50), ("standard", 200, 300), ("large", 400, 600)] {
        for id in ["101", "102"] {
            let path = out.path().join(key).join(format!("{id}.jpg"));
            let img = image::open(&path).unwrap();
            assert_eq!((img.width(), img.height()), (w, h), "{}", path.display());
        }
    }

    let ids: Vec<_> = summary.outcomes.iter().map(|o| o.identity_id.as_str()).collect();
    assert_eq!(ids, ["101", "101", "101", "102", "102", "102"]);
    assert!(summary
        .outcomes
        .iter()
        .all(|o| o.crop_tier == Some(CropTier::BothEyes)));
}

#[tokio::test]
async fn test_placeholder_and_skip_for_missing_photos() {
    let out = tempfile::tempdir().unwrap();
    let placeholder = out.path().join("placeholder.png");
    RgbaImage::from_pixel(50, 50, Rgba([10, 20, 30, 0])).save(&placeholder).unwrap();

    let mut with_ph = variant("standard", 200, 300);
    with_ph.placeholder_path = Some(placeholder);
    let profile = SizeProfile {
        name: "p".into(),
        variants: vec![with_ph, variant("small", 34, 50)],
    };
    let plans = resolve_variants(
        &SizeRequest::Profile {
            profile,
            mode: ProfileMode::AllVariants,
        },
        out.path(),
    )
    .unwrap();

    let detector = ScriptedDetector::new(Script::Eyes);
    let generator = PortraitGenerator::new(detector.clone(), None, options(1));
    let summary = generator
        .run(&[RosterEntry::new("7", None)], &plans)
        .await
        .unwrap();

    assert_eq!(summary.counts.placeholder, 1);
    assert_eq!(summary.counts.skipped, 1);
    assert_eq!(detector.calls(), 0);

    let img = image::open(out.path().join("standard").join("7.jpg")).unwrap();
    assert_eq!((img.width(), img.height()), (200, 300));
    assert!(!out.path().join("small").join("7.jpg").exists());
}

#[tokio::test]
async fn test_decode_failure_does_not_stop_batch() {
    let photos = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let broken = photos.path().join("broken.jpg");
    std::fs::write(&broken, b"definitely not a jpeg").unwrap();

    let roster = vec![
        RosterEntry::new("1", Some(broken)),
        RosterEntry::new("2", Some(write_photo(photos.path(), "ok.png"))),
    ];
    let generator = PortraitGenerator::new(ScriptedDetector::new(Script::FaceOnly), None, options(2));
    let summary = generator.run(&roster, &single(out.path(), 200, 300)).await.unwrap();

    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.counts.generated, 1);
    assert_eq!(summary.outcomes[0].outcome, OutcomeKind::Failed);
    assert!(summary.outcomes[0]
        .error_detail
        .as_deref()
        .unwrap()
        .contains("cannot decode"));
    assert_eq!(summary.outcomes[1].crop_tier, Some(CropTier::FaceOnly));
    assert!(!out.path().join("1.jpg").exists());
    assert!(out.path().join("2.jpg").exists());
}

#[tokio::test]
async fn test_rerun_is_idempotent_and_served_from_cache() {
    let photos = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let roster = vec![
        RosterEntry::new("1", Some(write_photo(photos.path(), "a.png"))),
        RosterEntry::new("2", Some(write_photo(photos.path(), "b.png"))),
    ];
    let plans = single(out.path(), 200, 300);
    let detector = ScriptedDetector::new(Script::Eyes);
    let cache: Arc<dyn DetectionCache> = Arc::new(MemoryCache::new());

    let generator = PortraitGenerator::new(detector.clone(), Some(cache.clone()), options(1));
    let first = generator.run(&roster, &plans).await.unwrap();
    let first_bytes = std::fs::read(out.path().join("1.jpg")).unwrap();

    let second = generator.run(&roster, &plans).await.unwrap();
    let second_bytes = std::fs::read(out.path().join("1.jpg")).unwrap();

    // both photos share content, so the second identity already hits
    assert_eq!(detector.calls(), 1);
    assert_eq!(first.cache_misses, 1);
    assert_eq!(first.cache_hits, 1);
    assert_eq!(second.cache_hits, 2);
    assert_eq!(second.cache_misses, 0);
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.outcomes[0].crop, second.outcomes[0].crop);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_inference_failure_is_cached() {
    let photos = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let roster = vec![RosterEntry::new("1", Some(write_photo(photos.path(), "a.png")))];
    let plans = single(out.path(), 100, 150);
    let detector = ScriptedDetector::new(Script::Fail);
    let cache: Arc<dyn DetectionCache> = Arc::new(MemoryCache::new());

    let generator = PortraitGenerator::new(detector.clone(), Some(cache), options(1));
    let first = generator.run(&roster, &plans).await.unwrap();
    let second = generator.run(&roster, &plans).await.unwrap();

    assert_eq!(first.counts.failed, 1);
    assert_eq!(second.counts.failed, 1);
    assert_eq!(second.cache_hits, 1);
    assert_eq!(detector.calls(), 1);
    assert!(second.outcomes[0]
        .error_detail
        .as_deref()
        .unwrap()
        .contains("tensor shape mismatch"));
}

#[tokio::test]
async fn test_backend_lost_stops_dispatch() {
    let photos = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let roster: Vec<_> = (0..3)
        .map(|i| RosterEntry::new(i.to_string(), Some(write_photo(photos.path(), &format!("{i}.png")))))
        .collect();

    let detector = ScriptedDetector::new(Script::Unavailable);
    let generator = PortraitGenerator::new(detector.clone(), None, options(1));
    let err = generator
        .run(&roster, &single(out.path(), 200, 300))
        .await
        .unwrap_err();

    let (backend, summary) = match err {
        GenerateError::BackendLost { backend, summary, .. } => (backend, summary),
        other => panic!("expected BackendLost, got {other:?}"),
    };
    assert_eq!(backend, "scripted");
    assert_eq!(detector.calls(), 1);
    assert_eq!(summary.not_dispatched, 2);
    assert_eq!(summary.counts.generated, 0);
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_cancel_stops_new_work() {
    let photos = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let roster: Vec<_> = (0..4)
        .map(|i| RosterEntry::new(i.to_string(), Some(write_photo(photos.path(), &format!("{i}.png")))))
        .collect();

    let detector = ScriptedDetector::new(Script::FaceOnly);
    let generator = PortraitGenerator::new(detector.clone(), None, options(1));
    *detector.cancel_on_call.lock().unwrap() = Some(generator.cancel_handle());

    let summary = generator
        .run(&roster, &single(out.path(), 200, 300))
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.counts.generated, 1);
    assert_eq!(summary.not_dispatched, 3);
    assert!(out.path().join("0.jpg").exists());
    assert!(!out.path().join("1.jpg").exists());
}

#[tokio::test]
async fn test_cancel_reaches_in_flight_detection() {
    let photos = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let roster = [
        RosterEntry::new("1", Some(write_photo(photos.path(), "1.png"))),
        RosterEntry::new("2", Some(write_photo(photos.path(), "2.png"))),
    ];

    let detector = ScriptedDetector::new(Script::Hang);
    let cache = Arc::new(MemoryCache::new());
    let generator = PortraitGenerator::new(
        detector.clone(),
        Some(cache.clone() as Arc<dyn DetectionCache>),
        options(1),
    );
    let cancel = generator.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let summary = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        generator.run(&roster, &single(out.path(), 200, 300)),
    )
    .await
    .expect("run should stop once cancelled")
    .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.not_dispatched, 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_identity_outside_output_dir_rejected() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("portraits");
    let roster = [RosterEntry::new(
        "../escaped",
        Some(write_photo(photos.path(), "a.png")),
    )];

    let detector = ScriptedDetector::new(Script::Eyes);
    let generator = PortraitGenerator::new(detector.clone(), None, options(1));
    let summary = generator.run(&roster, &single(&out, 200, 300)).await.unwrap();

    assert_eq!(summary.counts.failed, 1);
    assert_eq!(detector.calls(), 0);
    assert!(!root.path().join("escaped.jpg").exists());
}
