//! Build lifecycle event bus
//!
//! Publishers hand an event to `publish`; subscribers run synchronously in
//! subscription order. Subscribers must be non-blocking: anything slow
//! (rendering, uploads) belongs on the subscriber's own queue, not this one.
//! The core emits user-facing information exclusively through this bus.

use crate::graph::TargetId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Severity of a diagnostic message event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Developer diagnostics
    Debug,
    /// Routine information
    Info,
    /// Something suspicious but recoverable
    Warning,
    /// A per-target or per-subsystem failure
    Error,
    /// The build itself cannot continue
    Critical,
}

/// Counters describing one build run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildStats {
    /// Targets in the graph
    pub total: usize,
    /// Targets built by a handler
    pub built: usize,
    /// Targets satisfied from cache
    pub cached: usize,
    /// Targets failed, including cascades
    pub failed: usize,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

/// Counters describing cache behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held
    pub entries: usize,
    /// Lookup hits
    pub hits: u64,
    /// Lookup misses (including invalidated entries)
    pub misses: u64,
    /// Entries removed by eviction
    pub evictions: u64,
    /// Approximate bytes of cached state
    pub size_bytes: u64,
}

/// Everything the core tells the outside world about a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildEvent {
    /// A build run began
    BuildStarted {
        /// Targets scheduled
        total_targets: usize,
    },
    /// A build run finished with no failures
    BuildCompleted {
        /// Final counters
        stats: BuildStats,
    },
    /// A build run finished with at least one failure
    BuildFailed {
        /// Final counters
        stats: BuildStats,
    },
    /// A target was handed to a handler or the cache
    TargetStarted {
        /// The target
        target_id: TargetId,
    },
    /// A handler built a target
    TargetCompleted {
        /// The target
        target_id: TargetId,
        /// Hash of the produced output
        output_hash: String,
        /// Handler wall-clock time
        duration: Duration,
    },
    /// A target failed terminally (after retries, or by cascade)
    TargetFailed {
        /// The target
        target_id: TargetId,
        /// Rendered error
        error: String,
    },
    /// A target was satisfied from the target cache
    TargetCached {
        /// The target
        target_id: TargetId,
    },
    /// Progress tick for renderers
    TargetProgress {
        /// Targets finished so far
        completed: usize,
        /// Targets scheduled in total
        total: usize,
    },
    /// A free-form diagnostic for the user
    Message {
        /// How loud to be
        severity: Severity,
        /// The text
        text: String,
    },
    /// Periodic statistics snapshot
    Statistics {
        /// Build counters
        build: BuildStats,
        /// Target-cache counters
        cache: CacheStats,
    },
}

type Subscriber = Box<dyn Fn(&BuildEvent) + Send + Sync>;

/// Synchronous publish/subscribe bus for build events
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared bus handle
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subscriber; delivery order follows subscription order
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&BuildEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Box::new(subscriber));
    }

    /// Deliver one event to every subscriber, synchronously
    pub fn publish(&self, event: &BuildEvent) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            subscriber(event);
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
