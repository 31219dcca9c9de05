//! Detection result cache.
//!
//! Keys combine a content fingerprint of the photo (SHA-256 of its bytes) and
//! the detector id, so a renamed photo still hits and a different backend
//! never reuses another backend's answer. Values are either landmarks
//! (negative results included) or an explicit "detection failed" marker.
//!
//! The on-disk store is a single pretty-printed JSON document:
//!
//! ```json
//! { "version": 1,
//!   "entries": { "<sha256>@<detector>": { "status": "detected", "landmarks": { ... } } } }
//! ```

use crate::types::Landmarks;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

const STORE_VERSION: u32 = 1;
/// Writes between automatic flushes of a [`FileCache`].
pub const FLUSH_EVERY: usize = 16;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to access cache store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Cache key: photo content fingerprint plus detector id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub fingerprint: String,
    pub detector: String,
}

impl CacheKey {
    pub fn new(fingerprint: impl Into<String>, detector: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            detector: detector.into(),
        }
    }

    /// Key for photo bytes, fingerprinted with SHA-256.
    pub fn for_content(bytes: &[u8], detector: &str) -> Self {
        Self::new(content_fingerprint(bytes), detector)
    }

    /// Flat string form used in the store.
    pub fn encode(&self) -> String {
        format!("{}@{}", self.fingerprint, self.detector)
    }

    pub fn decode(value: &str) -> Option<Self> {
        let (fingerprint, detector) = value.split_once('@')?;
        (!fingerprint.is_empty() && !detector.is_empty()).then(|| Self::new(fingerprint, detector))
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// A cached detector answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CachedDetection {
    Detected { landmarks: Landmarks },
    Failed { reason: String },
}

impl CachedDetection {
    /// Only values that serialize and load back unchanged may be stored.
    pub fn is_storable(&self) -> bool {
        match self {
            Self::Detected { landmarks } => landmarks.is_consistent(),
            Self::Failed { .. } => true,
        }
    }
}

fn reject_unstorable(key: &CacheKey, value: &CachedDetection) -> bool {
    if value.is_storable() {
        return false;
    }
    tracing::warn!(key = %key.encode(), "refusing to cache inconsistent landmarks");
    true
}

/// Shared detection cache handle.
///
/// Reads may run concurrently; writes and flushes are serialized by the
/// implementation.
pub trait DetectionCache: Send + Sync {
    fn lookup(&self, key: &CacheKey) -> Option<CachedDetection>;

    fn store(&self, key: CacheKey, value: CachedDetection);

    /// Persist pending writes. A no-op for in-memory caches.
    fn flush(&self) -> Result<(), CacheError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process cache. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CachedDetection>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectionCache for MemoryCache {
    fn lookup(&self, key: &CacheKey) -> Option<CachedDetection> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn store(&self, key: CacheKey, value: CachedDetection) {
        if reject_unstorable(&key, &value) {
            return;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, value);
        }
    }

    fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Store {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, CachedDetection>,
}

/// JSON-file backed cache. Loaded once at open, written back on flush.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    entries: RwLock<HashMap<CacheKey, CachedDetection>>,
    pending: AtomicUsize,
    flush_lock: Mutex<()>,
}

impl FileCache {
    /// Open the store at `path`. A missing file starts empty; a corrupt or
    /// unreadable one is discarded with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load_store(&path) {
            Ok(entries) => {
                tracing::debug!(path = %path.display(), entries = entries.len(), "detection cache loaded");
                entries
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding detection cache");
                HashMap::new()
            }
        };

        Self {
            path,
            entries: RwLock::new(entries),
            pending: AtomicUsize::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DetectionCache for FileCache {
    fn lookup(&self, key: &CacheKey) -> Option<CachedDetection> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn store(&self, key: CacheKey, value: CachedDetection) {
        if reject_unstorable(&key, &value) {
            return;
        }
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(key, value);
            }
            Err(_) => return,
        }

        if self.pending.fetch_add(1, Ordering::AcqRel) + 1 >= FLUSH_EVERY {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "periodic cache flush failed");
            }
        }
    }

    fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.flush_lock.lock().unwrap_or_else(|p| p.into_inner());
        let written = self.pending.swap(0, Ordering::AcqRel);

        let store = Store {
            version: STORE_VERSION,
            entries: self
                .entries
                .read()
                .map(|entries| entries.iter().map(|(k, v)| (k.encode(), v.clone())).collect())
                .unwrap_or_default(),
        };
        let json = serde_json::to_vec_pretty(&store)?;

        let io_err = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        tracing::debug!(path = %self.path.display(), entries = store.entries.len(), written, "detection cache flushed");
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

fn load_store(path: &Path) -> Result<HashMap<CacheKey, CachedDetection>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(source) => {
            return Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let store: Store = serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if store.version != STORE_VERSION {
        return Err(CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("unsupported version {}", store.version),
        });
    }

    let total = store.entries.len();
    let entries: HashMap<_, _> = store
        .entries
        .into_iter()
        .filter_map(|(key, value)| {
            let key = CacheKey::decode(&key)?;
            match &value {
                CachedDetection::Detected { landmarks } if !landmarks.is_consistent() => None,
                _ => Some((key, value)),
            }
        })
        .collect();

    if entries.len() < total {
        tracing::warn!(
            path = %path.display(),
            dropped = total - entries.len(),
            "ignored malformed cache entries"
        );
    }
    Ok(entries)
}
