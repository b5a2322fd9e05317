//! Disk-resident mapping from [`EvalKey`] to [`EvaluationResult`] (§4.2).
//!
//! One file per key under a content-addressed path; writes land via
//! write-to-temp-then-rename so a crash never leaves a torn file behind, and
//! so two processes racing to write the same key converge on whichever
//! rename lands first. A corrupted file (`CacheCorruption`, §7) is treated
//! as a miss and silently overwritten on the next `put`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fingerprint::EvalKey;
use tracing::warn;
use types::EvaluationResult;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("put for {key} disagrees with existing value")]
    ValueMismatch { key: EvalKey },
}

/// Hit/miss/put counters, shared behind an `Arc` so every clone of [`Cache`]
/// observes the same totals. Feeds the `summary` event record's
/// `cache_hit_rate` field (§6); the bare cache contract never says how that
/// number reaches the orchestrator, so this accumulator is this crate's own
/// addition.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    rejections: AtomicU64,
}

impl CacheStats {
    pub fn warm_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub rejections: u64,
}

/// A content-addressed, file-per-key store. Cheap to clone: state lives
/// behind `Arc<CacheStats>` and a `PathBuf` root.
#[derive(Clone)]
pub struct Cache {
    root: PathBuf,
    stats: Arc<CacheStats>,
}

impl Cache {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            stats: Arc::new(CacheStats::default()),
        })
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn warm_rate(&self) -> f64 {
        self.stats.warm_rate()
    }

    fn path_for(&self, key: &EvalKey) -> PathBuf {
        let hex = key.to_string();
        let mut path = self.root.clone();
        path.push(&hex[0..2]);
        path.push(format!("{hex}.json"));
        path
    }

    /// Pure lookup beyond the backing store's own I/O. A file that fails to
    /// parse is logged and treated as a miss (`CacheCorruption`, §7) rather
    /// than surfaced as an error.
    pub fn get(&self, key: &EvalKey) -> Option<EvaluationResult> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        match serde_json::from_slice::<EvaluationResult>(&bytes) {
            Ok(result) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache entry failed to parse, treating as miss");
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Writes exactly once per key. An equal re-put is a no-op; an unequal
    /// re-put is rejected and logged (§4.2 monotonicity). Equality is judged
    /// on the serialized form, since `EvaluationResult` carries no `PartialEq`.
    pub fn put(&self, key: &EvalKey, result: &EvaluationResult) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let new_bytes = serde_json::to_vec(result).expect("EvaluationResult always serializes");

        if let Ok(existing) = std::fs::read(&path) {
            if existing == new_bytes {
                return Ok(());
            }
            match serde_json::from_slice::<EvaluationResult>(&existing) {
                Ok(_) => {
                    self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, "rejecting put: existing cache value differs");
                    return Err(CacheError::ValueMismatch { key: *key });
                }
                Err(_) => {
                    // Existing file is corrupt; fall through and overwrite it.
                }
            }
        }

        self.write_atomic(&path, &new_bytes)?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let dir = path.parent().expect("path_for always nests one directory deep");
        std::fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        use std::io::Write;
        tmp.write_all(bytes).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tmp.persist(path).map_err(|err| CacheError::Io {
            path: path.to_path_buf(),
            source: err.error,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key(n: u8) -> EvalKey {
        let candidate = fingerprint::Fingerprint::of_text(&format!("candidate-{n}"));
        EvalKey::new(candidate, "example-0", 1)
    }

    fn result(quality: f64) -> EvaluationResult {
        let mut objectives = BTreeMap::new();
        objectives.insert("quality".to_string(), quality);
        EvaluationResult {
            objectives,
            trace: None,
            failure: false,
        }
    }

    #[test]
    fn miss_then_put_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let k = key(1);
        assert!(cache.get(&k).is_none());
        cache.put(&k, &result(0.8)).unwrap();
        let got = cache.get(&k).unwrap();
        assert_eq!(got.quality(), 0.8);
        assert_eq!(cache.stats().snapshot().puts, 1);
        assert_eq!(cache.stats().snapshot().hits, 1);
        assert_eq!(cache.stats().snapshot().misses, 1);
    }

    #[test]
    fn equal_reput_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let k = key(2);
        cache.put(&k, &result(0.5)).unwrap();
        cache.put(&k, &result(0.5)).unwrap();
        assert_eq!(cache.stats().snapshot().rejections, 0);
    }

    #[test]
    fn unequal_reput_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let k = key(3);
        cache.put(&k, &result(0.5)).unwrap();
        let err = cache.put(&k, &result(0.9)).unwrap_err();
        assert!(matches!(err, CacheError::ValueMismatch { .. }));
        assert_eq!(cache.get(&k).unwrap().quality(), 0.5);
    }

    #[test]
    fn warm_rate_tracks_hits_over_total() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let k = key(4);
        cache.get(&k);
        cache.put(&k, &result(1.0)).unwrap();
        cache.get(&k);
        cache.get(&k);
        assert!((cache.warm_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn corrupted_entry_is_treated_as_a_miss_and_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let k = key(5);
        let path = cache.path_for(&k);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();

        assert!(cache.get(&k).is_none());
        cache.put(&k, &result(0.3)).unwrap();
        assert_eq!(cache.get(&k).unwrap().quality(), 0.3);
    }
}
