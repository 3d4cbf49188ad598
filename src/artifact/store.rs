//! Content-addressed artifact storage
//!
//! Bytes live at `<root>/<hex[0:2]>/<hex[2:4]>/<full-hex>` so no single
//! directory grows unbounded. Reads try local first and fall back to the
//! remote store when one is configured; remote hits are written back
//! locally on a best-effort basis. Uploads verify the content address
//! before anything touches disk or the network.

use crate::artifact::http::{HttpClient, ParsedUrl};
use crate::artifact::ArtifactId;
use crate::config::{env_parse, env_string};
use crate::error::{BuildError, BuildResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fraction of the byte budget eviction shrinks to
const EVICTION_TARGET: f64 = 0.8;

/// Tunables for the artifact store
#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    /// Local storage root
    pub root: PathBuf,
    /// Byte budget for the local store
    pub max_size_bytes: u64,
    /// Remote store base URL, when replication is on
    pub remote_url: Option<String>,
    /// Socket read timeout for remote calls
    pub read_timeout: Duration,
    /// Socket write timeout for remote calls
    pub write_timeout: Duration,
}

impl ArtifactStoreConfig {
    /// Local-only store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_size_bytes: 5 * 1024 * 1024 * 1024,
            remote_url: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }

    /// Defaults overridden by `BUILDER_ARTIFACT_REMOTE_URL` and
    /// `BUILDER_ARTIFACT_MAX_SIZE`
    pub fn from_environment(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(root);
        config.remote_url = env_string("BUILDER_ARTIFACT_REMOTE_URL");
        if let Some(bytes) = env_parse::<u64>("BUILDER_ARTIFACT_MAX_SIZE") {
            config.max_size_bytes = bytes;
        }
        config
    }
}

/// Local CAS with optional HTTP read-through/write-through
pub struct ArtifactStore {
    config: ArtifactStoreConfig,
    remote: Option<ParsedUrl>,
    client: HttpClient,
}

impl ArtifactStore {
    /// Open a store; the remote URL is validated now, not at first use
    pub fn new(config: ArtifactStoreConfig) -> BuildResult<Self> {
        let remote = match &config.remote_url {
            Some(url) => Some(ParsedUrl::parse(url)?),
            None => None,
        };
        let client = HttpClient::new(config.read_timeout, config.write_timeout);
        Ok(Self {
            config,
            remote,
            client,
        })
    }

    /// Where an artifact lives locally
    pub fn local_path(&self, id: &ArtifactId) -> PathBuf {
        let hex = id.to_hex();
        self.config
            .root
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex)
    }

    /// Whether the artifact is present locally
    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.local_path(id).exists()
    }

    /// Fetch bytes, local first, then the remote store
    ///
    /// # Errors
    ///
    /// `ArtifactNotFound` when neither side has the blob; `Network` or
    /// `Timeout` for remote failures; `ArtifactHashMismatch` when a remote
    /// returns bytes that do not match the requested address.
    pub fn fetch(&self, id: &ArtifactId) -> BuildResult<Vec<u8>> {
        let path = self.local_path(id);
        match std::fs::read(&path) {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let remote = match &self.remote {
            Some(remote) => remote,
            None => return Err(BuildError::ArtifactNotFound(id.to_hex())),
        };

        let bytes = self.client.get(&remote.join(&id.to_hex()))?;
        let computed = ArtifactId::from_content(&bytes);
        if computed != *id {
            return Err(BuildError::ArtifactHashMismatch {
                expected: id.to_hex(),
                actual: computed.to_hex(),
            });
        }

        // Best effort: a failed backfill never fails the fetch.
        if let Err(e) = self.store_local(id, &bytes) {
            debug!(error = %e, artifact = %id, "local backfill failed");
        }
        Ok(bytes)
    }

    /// Store bytes under their claimed address, then replicate
    ///
    /// # Errors
    ///
    /// `ArtifactHashMismatch` when the bytes do not hash to `id`; this is
    /// a hard error and nothing is stored. The remote PUT runs on its own
    /// thread and only logs on failure.
    pub fn upload(&self, id: &ArtifactId, bytes: &[u8]) -> BuildResult<()> {
        let computed = ArtifactId::from_content(bytes);
        if computed != *id {
            return Err(BuildError::ArtifactHashMismatch {
                expected: id.to_hex(),
                actual: computed.to_hex(),
            });
        }

        self.store_local(id, bytes)?;
        if self.total_size() > self.config.max_size_bytes {
            let freed = self.evict_to_budget()?;
            info!(freed, "artifact store eviction");
        }

        if let Some(remote) = &self.remote {
            let url = remote.join(&id.to_hex());
            let client = self.client.clone();
            let body = bytes.to_vec();
            let hex = id.to_hex();
            std::thread::spawn(move || {
                if let Err(e) = client.put(&url, &body) {
                    warn!(artifact = %hex, error = %e, "remote artifact upload failed");
                }
            });
        }
        Ok(())
    }

    fn store_local(&self, id: &ArtifactId, bytes: &[u8]) -> BuildResult<()> {
        let path = self.local_path(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Total bytes currently stored locally
    pub fn total_size(&self) -> u64 {
        self.walk()
            .map(|entries| entries.iter().map(|(_, _, size)| size).sum())
            .unwrap_or(0)
    }

    /// Delete oldest-mtime artifacts until the store fits 80% of budget
    pub fn evict_to_budget(&self) -> BuildResult<u64> {
        let mut entries = self.walk()?;
        let mut total: u64 = entries.iter().map(|(_, _, size)| size).sum();
        let target = (self.config.max_size_bytes as f64 * EVICTION_TARGET) as u64;
        if total <= target {
            return Ok(0);
        }

        entries.sort_by_key(|(_, mtime, _)| *mtime);
        let mut freed = 0u64;
        for (path, _, size) in entries {
            if total <= target {
                break;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    total = total.saturating_sub(size);
                    freed += size;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "artifact eviction failed"),
            }
        }
        Ok(freed)
    }

    fn walk(&self) -> BuildResult<Vec<(PathBuf, std::time::SystemTime, u64)>> {
        let mut entries = Vec::new();
        let root = &self.config.root;
        if !root.exists() {
            return Ok(entries);
        }
        for level1 in std::fs::read_dir(root)? {
            let level1 = level1?.path();
            if !level1.is_dir() {
                continue;
            }
            for level2 in std::fs::read_dir(&level1)? {
                let level2 = level2?.path();
                if !level2.is_dir() {
                    continue;
                }
                for file in std::fs::read_dir(&level2)? {
                    let file = file?;
                    let metadata = file.metadata()?;
                    if metadata.is_file() {
                        let mtime = metadata
                            .modified()
                            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                        entries.push((file.path(), mtime, metadata.len()));
                    }
                }
            }
        }
        Ok(entries)
    }

    /// The local storage root
    pub fn root(&self) -> &Path {
        &self.config.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local_store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(ArtifactStoreConfig::new(dir.path().join("cas"))).unwrap()
    }

    #[test]
    fn test_upload_then_fetch() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir);

        let bytes = b"compiled object bytes".to_vec();
        let id = ArtifactId::from_content(&bytes);
        store.upload(&id, &bytes).unwrap();

        assert!(store.contains(&id));
        assert_eq!(store.fetch(&id).unwrap(), bytes);
    }

    #[test]
    fn test_layout_shards_by_hex_prefix() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir);

        let bytes = b"x".to_vec();
        let id = ArtifactId::from_content(&bytes);
        store.upload(&id, &bytes).unwrap();

        let hex = id.to_hex();
        let expected = dir
            .path()
            .join("cas")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex);
        assert!(expected.exists());
    }

    #[test]
    fn test_upload_rejects_wrong_hash() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir);

        let id = ArtifactId::from_content(b"the real bytes");
        let result = store.upload(&id, b"imposter bytes");
        assert!(matches!(
            result,
            Err(BuildError::ArtifactHashMismatch { .. })
        ));
        assert!(!store.contains(&id), "nothing stored on mismatch");
    }

    #[test]
    fn test_fetch_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir);
        let id = ArtifactId::from_content(b"never stored");
        assert!(matches!(
            store.fetch(&id),
            Err(BuildError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_eviction_drops_oldest_first() {
        let dir = TempDir::new().unwrap();
        let mut config = ArtifactStoreConfig::new(dir.path().join("cas"));
        config.max_size_bytes = 3000;
        let store = ArtifactStore::new(config).unwrap();

        let old = vec![1u8; 1500];
        let old_id = ArtifactId::from_content(&old);
        store.upload(&old_id, &old).unwrap();

        // Ensure distinct mtimes on filesystems with coarse timestamps.
        let old_path = store.local_path(&old_id);
        let backdated = filetime_backdate(&old_path);

        let new = vec![2u8; 1500];
        let new_id = ArtifactId::from_content(&new);
        store.upload(&new_id, &new).unwrap();

        let big = vec![3u8; 1500];
        let big_id = ArtifactId::from_content(&big);
        store.upload(&big_id, &big).unwrap();

        assert!(store.total_size() <= 2400, "evicted below 80% of budget");
        if backdated {
            assert!(!store.contains(&old_id), "oldest artifact went first");
        }
    }

    fn filetime_backdate(path: &Path) -> bool {
        // Rewrite mtime via the file's own handle; falls back to a sleep
        // when the platform refuses.
        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(old).is_ok()
    }
}
