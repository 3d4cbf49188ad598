//! Build nodes
//!
//! A node pairs one immutable target with the mutable state the executor
//! drives through the build. Edges are stored as target-id lists in both
//! directions, so the graph never forms ownership cycles.

use crate::error::BuildError;
use crate::graph::{Target, TargetId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lifecycle state of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    /// Not yet scheduled
    Pending,
    /// Handed to a worker
    Building,
    /// Built by a handler this run
    Success,
    /// Satisfied from the target cache
    Cached,
    /// Handler failed, or a dependency failed
    Failed,
}

impl BuildStatus {
    /// Whether this status counts as "done and usable by dependents"
    pub fn is_complete(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Cached)
    }
}

/// One target plus its mutable build state
#[derive(Debug)]
pub struct BuildNode {
    /// The immutable target
    pub target: Target,
    /// Current lifecycle state
    pub status: BuildStatus,
    /// Hex hash of the built output; empty until Success or Cached
    pub output_hash: String,
    /// Dependencies not yet Success or Cached
    pub pending_deps: AtomicUsize,
    /// Handler invocations consumed by the retry orchestrator
    pub retry_attempts: u32,
    /// The error that put this node into Failed, if any
    pub last_error: Option<BuildError>,
    /// Ids of nodes that depend on this one (back edges)
    pub dependents: Vec<TargetId>,
    /// Critical-path priority; higher schedules first on ties
    pub priority: f64,
}

impl BuildNode {
    /// Wrap a target in a fresh Pending node
    pub fn new(target: Target) -> Self {
        Self {
            target,
            status: BuildStatus::Pending,
            output_hash: String::new(),
            pending_deps: AtomicUsize::new(0),
            retry_attempts: 0,
            last_error: None,
            dependents: Vec::new(),
            priority: 0.0,
        }
    }

    /// The node's target id
    pub fn id(&self) -> &TargetId {
        &self.target.id
    }

    /// Whether every dependency has completed
    pub fn is_ready(&self) -> bool {
        self.status == BuildStatus::Pending && self.pending_deps.load(Ordering::SeqCst) == 0
    }

    /// Atomically record one dependency completion; true when that was the
    /// last outstanding dependency
    pub fn complete_one_dep(&self) -> bool {
        self.pending_deps.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Record a successful build
    pub fn mark_success(&mut self, output_hash: String) {
        self.status = BuildStatus::Success;
        self.output_hash = output_hash;
        self.retry_attempts = 0;
        self.last_error = None;
    }

    /// Record a cache hit
    pub fn mark_cached(&mut self, output_hash: String) {
        self.status = BuildStatus::Cached;
        self.output_hash = output_hash;
        self.retry_attempts = 0;
        self.last_error = None;
    }

    /// Record a terminal failure
    pub fn mark_failed(&mut self, error: BuildError) {
        self.status = BuildStatus::Failed;
        self.last_error = Some(error);
    }
}
