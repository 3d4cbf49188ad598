//! Target-level build cache
//!
//! Answers one question: was this target already built from these exact
//! inputs? Validation is two-tier per source (metadata hash first, content
//! hash only on metadata change) plus a dependency-hash check, so an
//! untouched tree validates without reading file contents.
//!
//! The check-then-hash pattern here is deliberate: a file racing the check
//! costs at worst an unnecessary rebuild. Integrity validation elsewhere
//! must use `hash_file_complete` and never this path.

use crate::cache::envelope;
use crate::cache::eviction::{plan_evictions, EvictionLimits, EvictionPolicy};
use crate::config::cache_dir;
use crate::error::{BuildError, BuildResult};
use crate::events::CacheStats;
use crate::graph::TargetId;
use crate::hash::{self, HashMemo};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name of the binary cache blob
const CACHE_FILE: &str = "cache.bin";
/// File name of the legacy JSON cache, accepted once and migrated
const LEGACY_FILE: &str = "cache.json";

/// Last-known-good record for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCacheEntry {
    /// The target this entry describes
    pub target_id: TargetId,
    /// Hex hash of the last successful build output
    pub build_hash: String,
    /// Source path -> content hash at build time
    pub source_content_hashes: HashMap<String, String>,
    /// Source path -> metadata hash at build time
    pub source_metadata_hashes: HashMap<String, String>,
    /// Dependency id -> its build hash at build time
    pub dep_hashes: HashMap<TargetId, String>,
    /// Unix seconds when the entry was created
    pub created_at: i64,
    /// Unix seconds of the last lookup or update
    pub last_access_at: i64,
}

impl TargetCacheEntry {
    /// Serialized-size estimate used by the byte-budget eviction pass
    pub fn approx_size(&self) -> u64 {
        let strings = self.target_id.len()
            + self.build_hash.len()
            + self
                .source_content_hashes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + self
                .source_metadata_hashes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + self
                .dep_hashes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>();
        strings as u64 + 64
    }
}

/// Tunables for the target cache
#[derive(Debug, Clone)]
pub struct TargetCacheConfig {
    /// Size, count, and age caps applied at flush time
    pub limits: EvictionLimits,
    /// Ordering applied when a cap is exceeded
    pub policy: EvictionPolicy,
    /// Source-count threshold above which update hashes in parallel
    pub parallel_hash_threshold: usize,
}

impl Default for TargetCacheConfig {
    fn default() -> Self {
        Self {
            limits: EvictionLimits::default(),
            policy: EvictionPolicy::default(),
            parallel_hash_threshold: 4,
        }
    }
}

impl TargetCacheConfig {
    /// Defaults overridden by the `BUILDER_CACHE_*` environment variables
    pub fn from_environment() -> Self {
        Self {
            limits: EvictionLimits::from_environment(),
            ..Self::default()
        }
    }
}

struct Inner {
    entries: HashMap<TargetId, TargetCacheEntry>,
    dirty: bool,
    closed: bool,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Two-tier cache of last-known-good builds, persisted as a signed blob
pub struct TargetCache {
    workspace_root: PathBuf,
    path: PathBuf,
    config: TargetCacheConfig,
    memo: Arc<HashMemo>,
    inner: Mutex<Inner>,
}

impl TargetCache {
    /// Open the cache for a workspace, loading any existing blob
    ///
    /// Load failures never propagate: a bad signature, stale blob, or
    /// undecodable file resets the cache to empty with a log note.
    pub fn open(workspace_root: impl Into<PathBuf>, config: TargetCacheConfig) -> Self {
        let workspace_root = workspace_root.into();
        let dir = cache_dir(&workspace_root);
        let path = dir.join(CACHE_FILE);
        let legacy = dir.join(LEGACY_FILE);

        let (entries, dirty) = Self::load_entries(&workspace_root, &path, &legacy, &config);
        Self {
            workspace_root,
            path,
            config,
            memo: Arc::new(HashMemo::new()),
            inner: Mutex::new(Inner {
                entries,
                dirty,
                closed: false,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    fn load_entries(
        workspace_root: &Path,
        path: &Path,
        legacy: &Path,
        config: &TargetCacheConfig,
    ) -> (HashMap<TargetId, TargetCacheEntry>, bool) {
        if path.exists() {
            let loaded = std::fs::read(path)
                .map_err(BuildError::from)
                .and_then(|bytes| envelope::open(&bytes, workspace_root, config.limits.max_age))
                .and_then(|data| {
                    bincode::deserialize::<HashMap<TargetId, TargetCacheEntry>>(&data)
                        .map_err(|e| BuildError::CacheCorrupted(e.to_string()))
                });
            match loaded {
                Ok(entries) => {
                    debug!(entries = entries.len(), "target cache loaded");
                    return (entries, false);
                }
                Err(BuildError::SignatureVerification) => {
                    warn!("target cache signature verification failed; starting empty");
                    return (HashMap::new(), false);
                }
                Err(e) => {
                    warn!(error = %e, "target cache unusable; starting empty");
                    return (HashMap::new(), false);
                }
            }
        }

        if legacy.exists() {
            let migrated = std::fs::read(legacy).ok().and_then(|bytes| {
                serde_json::from_slice::<HashMap<TargetId, TargetCacheEntry>>(&bytes).ok()
            });
            if let Some(entries) = migrated {
                info!(
                    entries = entries.len(),
                    "migrated legacy JSON cache to binary format"
                );
                let _ = std::fs::remove_file(legacy);
                return (entries, true);
            }
            warn!("legacy JSON cache unreadable; starting empty");
            let _ = std::fs::remove_file(legacy);
        }

        (HashMap::new(), false)
    }

    /// The hash memoization map shared with the executor for this build
    pub fn memo(&self) -> Arc<HashMemo> {
        self.memo.clone()
    }

    /// Forget memoized hashes; called at the start of every build
    pub fn reset_memo(&self) {
        self.memo.clear();
    }

    fn resolve(&self, source: &Path) -> PathBuf {
        if source.is_absolute() {
            source.to_path_buf()
        } else {
            self.workspace_root.join(source)
        }
    }

    fn source_key(source: &Path) -> String {
        source.to_string_lossy().into_owned()
    }

    /// Whether the target's last build is still valid for these inputs
    pub fn is_cached(&self, target_id: &str, sources: &[PathBuf], deps: &[TargetId]) -> bool {
        let now = chrono::Utc::now().timestamp();

        // Snapshot the entry and current dep hashes under the lock; the
        // filesystem work below runs without it.
        let (meta_hashes, content_hashes, dep_hashes, dep_current) = {
            let mut inner = self.inner.lock();
            let snapshot = match inner.entries.get_mut(target_id) {
                Some(entry) => {
                    entry.last_access_at = now;
                    Some((
                        entry.source_metadata_hashes.clone(),
                        entry.source_content_hashes.clone(),
                        entry.dep_hashes.clone(),
                    ))
                }
                None => None,
            };
            match snapshot {
                Some((meta, content, dep)) => {
                    let current: Vec<Option<String>> = deps
                        .iter()
                        .map(|d| inner.entries.get(d).map(|e| e.build_hash.clone()))
                        .collect();
                    (meta, content, dep, current)
                }
                None => {
                    inner.misses += 1;
                    return false;
                }
            }
        };

        let valid = self.validate_sources(sources, &meta_hashes, &content_hashes)
            && Self::validate_deps(deps, &dep_hashes, &dep_current);

        let mut inner = self.inner.lock();
        if valid {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        valid
    }

    fn validate_sources(
        &self,
        sources: &[PathBuf],
        meta_hashes: &HashMap<String, String>,
        content_hashes: &HashMap<String, String>,
    ) -> bool {
        for source in sources {
            let full = self.resolve(source);
            if !full.exists() {
                debug!(source = %source.display(), "cache miss: source removed");
                return false;
            }

            let key = Self::source_key(source);
            let old_meta = meta_hashes.get(&key).map(String::as_str).unwrap_or("");
            let two_tier = hash::hash_file_two_tier(&full, old_meta);
            if !two_tier.content_was_hashed {
                continue;
            }

            let matches = content_hashes
                .get(&key)
                .map(|stored| hash::digest_eq(stored, &two_tier.content_hex))
                .unwrap_or(false);
            if !matches || two_tier.content_hex.is_empty() {
                debug!(source = %source.display(), "cache miss: content changed");
                return false;
            }
        }
        true
    }

    fn validate_deps(
        deps: &[TargetId],
        recorded: &HashMap<TargetId, String>,
        current: &[Option<String>],
    ) -> bool {
        for (dep, current_hash) in deps.iter().zip(current) {
            let stored = match recorded.get(dep) {
                Some(h) => h,
                None => {
                    debug!(dep = %dep, "cache miss: dependency not recorded");
                    return false;
                }
            };
            match current_hash {
                Some(now) if hash::digest_eq(stored, now) => {}
                _ => {
                    debug!(dep = %dep, "cache miss: dependency hash changed");
                    return false;
                }
            }
        }
        true
    }

    /// The recorded build hash for a target, if one exists
    pub fn build_hash(&self, target_id: &str) -> Option<String> {
        self.inner
            .lock()
            .entries
            .get(target_id)
            .map(|e| e.build_hash.clone())
    }

    /// A copy of the full entry, if one exists
    pub fn lookup(&self, target_id: &str) -> Option<TargetCacheEntry> {
        self.inner.lock().entries.get(target_id).cloned()
    }

    /// Record a successful build
    ///
    /// Hashing runs in parallel for targets with many sources and shares
    /// the build-wide memo map. The write is deferred until `flush`.
    pub fn update(
        &self,
        target_id: &str,
        sources: &[PathBuf],
        deps: &[TargetId],
        output_hash: &str,
    ) {
        let hash_one = |source: &PathBuf| {
            let full = self.resolve(source);
            (
                Self::source_key(source),
                hash::hash_metadata(&full),
                self.memo.hash_file(&full),
            )
        };

        let hashed: Vec<(String, String, String)> =
            if sources.len() > self.config.parallel_hash_threshold {
                sources.par_iter().map(hash_one).collect()
            } else {
                sources.iter().map(hash_one).collect()
            };

        let mut source_metadata_hashes = HashMap::with_capacity(hashed.len());
        let mut source_content_hashes = HashMap::with_capacity(hashed.len());
        for (key, meta, content) in hashed {
            source_metadata_hashes.insert(key.clone(), meta);
            source_content_hashes.insert(key, content);
        }

        let now = chrono::Utc::now().timestamp();
        let mut inner = self.inner.lock();
        let dep_hashes: HashMap<TargetId, String> = deps
            .iter()
            .filter_map(|d| {
                inner
                    .entries
                    .get(d)
                    .map(|e| (d.clone(), e.build_hash.clone()))
            })
            .collect();

        inner.entries.insert(
            target_id.to_string(),
            TargetCacheEntry {
                target_id: target_id.to_string(),
                build_hash: output_hash.to_string(),
                source_content_hashes,
                source_metadata_hashes,
                dep_hashes,
                created_at: now,
                last_access_at: now,
            },
        );
        inner.dirty = true;
    }

    /// Drop one entry, if present
    pub fn invalidate(&self, target_id: &str) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(target_id).is_some() {
            inner.dirty = true;
        }
    }

    /// Persist the entry map if anything changed
    ///
    /// Eviction runs first when requested; the blob is then signed and
    /// atomically swapped into place.
    pub fn flush(&self, run_eviction: bool) -> BuildResult<()> {
        let mut inner = self.inner.lock();
        if !inner.dirty {
            return Ok(());
        }

        if run_eviction {
            let now = chrono::Utc::now().timestamp();
            let doomed = plan_evictions(&inner.entries, self.config.policy, &self.config.limits, now);
            if !doomed.is_empty() {
                info!(evicted = doomed.len(), "target cache eviction");
            }
            for id in doomed {
                inner.entries.remove(&id);
                inner.evictions += 1;
            }
        }

        let data = bincode::serialize(&inner.entries)
            .map_err(|e| BuildError::CacheCorrupted(format!("serialize failed: {e}")))?;
        let blob = envelope::seal(&self.workspace_root, data)?;

        let dir = cache_dir(&self.workspace_root);
        std::fs::create_dir_all(&dir)?;
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, &blob)?;
        std::fs::rename(&tmp, &self.path)?;

        inner.dirty = false;
        debug!(entries = inner.entries.len(), "target cache flushed");
        Ok(())
    }

    /// Current counters and an approximate byte total
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size_bytes: inner.entries.values().map(|e| e.approx_size()).sum(),
        }
    }

    /// Number of entries currently held
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Flush and mark closed; safe to call more than once
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        if let Err(e) = self.flush(true) {
            warn!(error = %e, "target cache flush on close failed");
        }
    }
}

impl Drop for TargetCache {
    fn drop(&mut self) {
        // Best-effort fallback; explicit close() is the supported path.
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_source(root: &Path, rel: &str, contents: &[u8]) -> PathBuf {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        file.sync_all().unwrap();
        PathBuf::from(rel)
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let src = write_source(dir.path(), "a.c", b"int a;");
        let cache = TargetCache::open(dir.path(), TargetCacheConfig::default());

        assert!(!cache.is_cached("//a:a", &[src.clone()], &[]));
        cache.update("//a:a", &[src.clone()], &[], "hash-a");
        cache.reset_memo();
        assert!(cache.is_cached("//a:a", &[src], &[]));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_source_change_invalidates() {
        let dir = TempDir::new().unwrap();
        let src = write_source(dir.path(), "a.c", b"int a;");
        let cache = TargetCache::open(dir.path(), TargetCacheConfig::default());

        cache.update("//a:a", &[src.clone()], &[], "hash-a");
        write_source(dir.path(), "a.c", b"int a_changed;");
        cache.reset_memo();
        assert!(!cache.is_cached("//a:a", &[src], &[]));
    }

    #[test]
    fn test_missing_source_invalidates() {
        let dir = TempDir::new().unwrap();
        let src = write_source(dir.path(), "a.c", b"int a;");
        let cache = TargetCache::open(dir.path(), TargetCacheConfig::default());

        cache.update("//a:a", &[src.clone()], &[], "hash-a");
        std::fs::remove_file(dir.path().join("a.c")).unwrap();
        cache.reset_memo();
        assert!(!cache.is_cached("//a:a", &[src], &[]));
    }

    #[test]
    fn test_dep_hash_change_invalidates() {
        let dir = TempDir::new().unwrap();
        let a = write_source(dir.path(), "a.c", b"int a;");
        let b = write_source(dir.path(), "b.c", b"int b;");
        let cache = TargetCache::open(dir.path(), TargetCacheConfig::default());

        cache.update("//a:a", &[a.clone()], &[], "hash-a-1");
        cache.update("//b:b", &[b.clone()], &["//a:a".to_string()], "hash-b-1");
        cache.reset_memo();
        assert!(cache.is_cached("//b:b", &[b.clone()], &["//a:a".to_string()]));

        // A rebuilt with a new output hash: B must invalidate.
        cache.update("//a:a", &[a], &[], "hash-a-2");
        cache.reset_memo();
        assert!(!cache.is_cached("//b:b", &[b], &["//a:a".to_string()]));
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let src = write_source(dir.path(), "a.c", b"int a;");
        {
            let cache = TargetCache::open(dir.path(), TargetCacheConfig::default());
            cache.update("//a:a", &[src.clone()], &[], "hash-a");
            cache.flush(true).unwrap();
            cache.close();
        }

        let reopened = TargetCache::open(dir.path(), TargetCacheConfig::default());
        let entry = reopened.lookup("//a:a").expect("entry survives reopen");
        assert_eq!(entry.build_hash, "hash-a");
        assert!(reopened.is_cached("//a:a", &[src], &[]));
        reopened.close();
    }

    #[test]
    fn test_corrupt_blob_starts_empty() {
        let dir = TempDir::new().unwrap();
        let cache_file = cache_dir(dir.path()).join(CACHE_FILE);
        std::fs::create_dir_all(cache_file.parent().unwrap()).unwrap();
        std::fs::write(&cache_file, b"definitely not an envelope").unwrap();

        let cache = TargetCache::open(dir.path(), TargetCacheConfig::default());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_legacy_json_migrates() {
        let dir = TempDir::new().unwrap();
        let src = write_source(dir.path(), "a.c", b"int a;");

        let mut entries: HashMap<TargetId, TargetCacheEntry> = HashMap::new();
        entries.insert(
            "//a:a".to_string(),
            TargetCacheEntry {
                target_id: "//a:a".to_string(),
                build_hash: "legacy-hash".to_string(),
                source_content_hashes: HashMap::new(),
                source_metadata_hashes: HashMap::new(),
                dep_hashes: HashMap::new(),
                created_at: chrono::Utc::now().timestamp(),
                last_access_at: chrono::Utc::now().timestamp(),
            },
        );
        let legacy = cache_dir(dir.path()).join(LEGACY_FILE);
        std::fs::create_dir_all(legacy.parent().unwrap()).unwrap();
        std::fs::write(&legacy, serde_json::to_vec(&entries).unwrap()).unwrap();

        let cache = TargetCache::open(dir.path(), TargetCacheConfig::default());
        assert_eq!(cache.build_hash("//a:a").unwrap(), "legacy-hash");
        assert!(!legacy.exists(), "legacy file consumed");

        // Migrated state persists as the binary format.
        cache.flush(true).unwrap();
        cache.close();
        assert!(cache_dir(dir.path()).join(CACHE_FILE).exists());
        drop(src);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = TargetCache::open(dir.path(), TargetCacheConfig::default());
        cache.close();
        cache.close();
    }
}
