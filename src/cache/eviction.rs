//! Cache eviction policies
//!
//! Eviction is a strategy value over the entry map, so the cache itself
//! never hard-codes an ordering. Limits cover total bytes, entry count, and
//! entry age; all three are enforced on every eviction pass.

use crate::cache::target::TargetCacheEntry;
use crate::config::env_parse;
use crate::graph::TargetId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default byte budget: 1 GiB
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024 * 1024;
/// Default entry budget
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
/// Default age budget: 30 days
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Which entries go first when a limit is exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least recently accessed first (the default)
    Lru,
    /// Oldest created first
    OldestCreated,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

/// Size, count, and age caps for a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionLimits {
    /// Total serialized size cap, in bytes
    pub max_bytes: u64,
    /// Entry count cap
    pub max_entries: usize,
    /// Per-entry lifetime cap, measured from creation
    pub max_age: Duration,
}

impl Default for EvictionLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

impl EvictionLimits {
    /// Read limits from `BUILDER_CACHE_MAX_SIZE`, `BUILDER_CACHE_MAX_ENTRIES`
    /// and `BUILDER_CACHE_MAX_AGE_DAYS`, falling back to defaults
    pub fn from_environment() -> Self {
        let mut limits = Self::default();
        if let Some(bytes) = env_parse::<u64>("BUILDER_CACHE_MAX_SIZE") {
            limits.max_bytes = bytes;
        }
        if let Some(entries) = env_parse::<usize>("BUILDER_CACHE_MAX_ENTRIES") {
            limits.max_entries = entries;
        }
        if let Some(days) = env_parse::<u64>("BUILDER_CACHE_MAX_AGE_DAYS") {
            limits.max_age = Duration::from_secs(days * 24 * 60 * 60);
        }
        limits
    }
}

/// Decide which entries to drop so the map fits the limits
///
/// Age violations go unconditionally; then the policy ordering is applied
/// until both the entry count and the byte total are within bounds. The
/// returned ids are not yet removed from the map.
pub fn plan_evictions(
    entries: &HashMap<TargetId, TargetCacheEntry>,
    policy: EvictionPolicy,
    limits: &EvictionLimits,
    now_unix: i64,
) -> Vec<TargetId> {
    let mut doomed: Vec<TargetId> = Vec::new();
    let max_age_secs = limits.max_age.as_secs() as i64;

    let mut survivors: Vec<&TargetCacheEntry> = Vec::with_capacity(entries.len());
    for entry in entries.values() {
        if now_unix - entry.created_at > max_age_secs {
            doomed.push(entry.target_id.clone());
        } else {
            survivors.push(entry);
        }
    }

    match policy {
        EvictionPolicy::Lru => survivors.sort_by_key(|e| e.last_access_at),
        EvictionPolicy::OldestCreated => survivors.sort_by_key(|e| e.created_at),
    }

    let mut count = survivors.len();
    let mut bytes: u64 = survivors.iter().map(|e| e.approx_size()).sum();
    let mut victims = survivors.into_iter();
    while count > limits.max_entries || bytes > limits.max_bytes {
        match victims.next() {
            Some(entry) => {
                count -= 1;
                bytes = bytes.saturating_sub(entry.approx_size());
                doomed.push(entry.target_id.clone());
            }
            None => break,
        }
    }

    doomed
}
