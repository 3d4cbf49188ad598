//! Cross-thread hash memoization
//!
//! One build hashes the same source files from many places: the target
//! cache validation path, the update path, and any action-level hashing.
//! `HashMemo` deduplicates that work for the lifetime of a build. It is
//! never persisted; staleness across builds is impossible by construction.

use crate::hash::content;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

/// Shared content-hash memoization map for a single build
#[derive(Default)]
pub struct HashMemo {
    entries: DashMap<PathBuf, String>,
}

impl HashMemo {
    /// Create an empty memo
    pub fn new() -> Self {
        Self::default()
    }

    /// Tiered-hash a file, reusing a previous result for the same path
    ///
    /// The missing-file sentinel is memoized too: within one build a file
    /// that was absent stays absent for cache purposes.
    pub fn hash_file(&self, path: &Path) -> String {
        if let Some(hit) = self.entries.get(path) {
            return hit.clone();
        }
        let computed = content::hash_file(path);
        self.entries.insert(path.to_path_buf(), computed.clone());
        computed
    }

    /// Number of memoized paths
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been memoized yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all memoized hashes
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_memo_returns_stable_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.c");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"int a;")
            .unwrap();

        let memo = HashMemo::new();
        let first = memo.hash_file(&path);
        assert_eq!(first.len(), 64);

        // A rewrite after memoization is invisible within the same build.
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"int b;")
            .unwrap();
        assert_eq!(memo.hash_file(&path), first);
        assert_eq!(memo.len(), 1);

        memo.clear();
        assert_ne!(memo.hash_file(&path), first);
    }
}
