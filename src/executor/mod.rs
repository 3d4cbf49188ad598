//! Parallel build executor
//!
//! This module provides:
//! - The batch-dispatch main loop over a lock-free ready queue
//! - A persistent OS-thread worker pool (no async runtime)
//! - An optional work-stealing dispatch mode
//! - Cascading failure and checkpointed resume
//! - Retry orchestration around every handler call
//!
//! Concurrency shape: the main thread owns the graph and is the single
//! writer for node state transitions; workers receive cloned targets and
//! report outcomes over a channel. A node leaves Pending only after every
//! dependency is Success or Cached, reaches Failed at most once, and never
//! starts Building once a dependency has failed.

mod queue;
mod retry;
mod steal;

pub use queue::ReadyQueue;
pub use retry::{RetryOrchestrator, RetryPolicy};
pub use steal::{steal_scheduler, StealScheduler, WorkerQueue};

use crate::cache::TargetCache;
use crate::checkpoint::CheckpointManager;
use crate::config::env_parse;
use crate::error::{BuildError, BuildResult};
use crate::events::{BuildEvent, BuildStats, EventBus, Severity};
use crate::graph::{BuildGraph, BuildStatus, Target, TargetId};
use crate::handler::HandlerRegistry;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long the main loop waits for a result when it has nothing to
/// dispatch but work is still in flight
const IDLE_WAIT: Duration = Duration::from_millis(1);
/// Patience for in-flight results during the post-loop drain
const DRAIN_WAIT: Duration = Duration::from_millis(100);
/// Give up on a wedged worker after this many empty drain waits
const DRAIN_LIMIT: u32 = 300;

/// Executor tunables
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker threads; defaults to the CPU count
    pub parallelism: Option<usize>,
    /// Fast-path bound of the ready queue
    pub queue_capacity: usize,
    /// Builds above this node count pre-size their bookkeeping
    pub large_build_threshold: usize,
    /// Dispatch through per-worker stealing deques instead of a channel
    pub work_stealing: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            queue_capacity: queue::DEFAULT_CAPACITY,
            large_build_threshold: 100,
            work_stealing: false,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `BUILDER_WORKERS`
    pub fn from_environment() -> Self {
        let mut config = Self::default();
        if let Some(workers) = env_parse::<usize>("BUILDER_WORKERS") {
            config.parallelism = Some(workers.max(1));
        }
        config
    }
}

/// What a finished build reports back
#[derive(Debug, Clone)]
pub struct BuildSummary {
    /// Final counters
    pub stats: BuildStats,
    /// Ids of every node that ended Failed
    pub failed_targets: Vec<TargetId>,
}

impl BuildSummary {
    /// Whether the build finished with zero failures
    pub fn succeeded(&self) -> bool {
        self.stats.failed == 0
    }
}

struct Job {
    target: Target,
    priority: f64,
}

struct Outcome {
    target_id: TargetId,
    /// `(output_hash, was_cached)` on the happy path
    result: BuildResult<(String, bool)>,
    attempts: u32,
}

/// Drives one build over a graph, a cache, and a set of handlers
pub struct Executor {
    config: ExecutorConfig,
    workspace: PathBuf,
    cache: Arc<TargetCache>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    retry: RetryOrchestrator,
    checkpoints: Option<CheckpointManager>,
}

impl Executor {
    /// Create an executor with default config, events, and retry policy
    pub fn new(
        workspace: impl Into<PathBuf>,
        cache: Arc<TargetCache>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            config: ExecutorConfig::default(),
            workspace: workspace.into(),
            cache,
            handlers,
            events: EventBus::shared(),
            retry: RetryOrchestrator::default(),
            checkpoints: None,
        }
    }

    /// Replace the config
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an event bus with the caller
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Replace the retry orchestrator
    pub fn with_retry(mut self, retry: RetryOrchestrator) -> Self {
        self.retry = retry;
        self
    }

    /// Enable checkpoint/resume through the given manager
    pub fn with_checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// The event bus this executor publishes to
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    fn worker_count(&self) -> usize {
        self.config.parallelism.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Run the build to completion
    ///
    /// # Errors
    ///
    /// Only graph-invalid conditions (a cycle) surface as `Err`; per-target
    /// failures are recorded on their nodes, published as events, and
    /// summarized in the returned counts.
    pub fn execute(&self, graph: &mut BuildGraph) -> BuildResult<BuildSummary> {
        graph.topological_sort()?;
        let started = Instant::now();
        self.cache.reset_memo();

        let resumed = self
            .checkpoints
            .as_ref()
            .map(|manager| manager.restore(graph))
            .unwrap_or(0);
        graph.reset_pending_counts();

        let total = graph.len();
        self.events
            .publish(&BuildEvent::BuildStarted { total_targets: total });

        // Large builds widen the ready queue's fast path to the node count
        // up front, so the mutex-guarded spillover never engages.
        let queue_capacity = if total > self.config.large_build_threshold {
            debug!(total, "large build: pre-sizing ready queue");
            self.config.queue_capacity.max(total)
        } else {
            self.config.queue_capacity
        };
        let ready = ReadyQueue::new(queue_capacity);
        for id in graph.ready_nodes() {
            ready.push(id);
        }

        let active = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let (outcome_tx, outcome_rx) = unbounded::<Outcome>();
        let workers = self.worker_count();

        let mut stats = BuildStats {
            total,
            ..BuildStats::default()
        };
        let mut completed = resumed;

        if self.config.work_stealing {
            self.run_stealing(
                graph,
                &ready,
                &active,
                &failed,
                workers,
                outcome_tx,
                &outcome_rx,
                &mut stats,
                &mut completed,
            );
        } else {
            self.run_pool(
                graph,
                &ready,
                &active,
                &failed,
                workers,
                outcome_tx,
                &outcome_rx,
                &mut stats,
                &mut completed,
            );
        }

        stats.elapsed = started.elapsed();
        if let Err(e) = self.cache.flush(true) {
            warn!(error = %e, "cache flush after build failed");
            self.events.publish(&BuildEvent::Message {
                severity: Severity::Warning,
                text: format!("cache flush failed, next build may rebuild more: {e}"),
            });
        }

        self.events.publish(&BuildEvent::Statistics {
            build: stats.clone(),
            cache: self.cache.stats(),
        });
        if stats.failed == 0 {
            self.events.publish(&BuildEvent::BuildCompleted {
                stats: stats.clone(),
            });
            if let Some(manager) = &self.checkpoints {
                manager.finish_clean();
            }
        } else {
            self.events.publish(&BuildEvent::BuildFailed {
                stats: stats.clone(),
            });
            if let Some(manager) = &self.checkpoints {
                if let Err(e) = manager.save_now(graph) {
                    warn!(error = %e, "checkpoint save after failed build");
                }
            }
        }

        let mut failed_targets: Vec<TargetId> = graph
            .nodes()
            .filter(|n| n.status == BuildStatus::Failed)
            .map(|n| n.target.id.clone())
            .collect();
        failed_targets.sort_unstable();

        Ok(BuildSummary {
            stats,
            failed_targets,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pool(
        &self,
        graph: &mut BuildGraph,
        ready: &ReadyQueue,
        active: &AtomicUsize,
        failed: &AtomicUsize,
        workers: usize,
        outcome_tx: Sender<Outcome>,
        outcome_rx: &Receiver<Outcome>,
        stats: &mut BuildStats,
        completed: &mut usize,
    ) {
        let (job_tx, job_rx) = unbounded::<Job>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let outcome_tx = outcome_tx.clone();
                scope.spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let outcome = self.run_job(&job);
                        if outcome_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(outcome_tx);
            drop(job_rx);

            self.drive(
                graph,
                ready,
                active,
                failed,
                workers,
                outcome_rx,
                stats,
                completed,
                |job| {
                    let _ = job_tx.send(job);
                },
            );
            drop(job_tx);
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stealing(
        &self,
        graph: &mut BuildGraph,
        ready: &ReadyQueue,
        active: &AtomicUsize,
        failed: &AtomicUsize,
        workers: usize,
        outcome_tx: Sender<Outcome>,
        outcome_rx: &Receiver<Outcome>,
        stats: &mut BuildStats,
        completed: &mut usize,
    ) {
        let (scheduler, queues) = steal_scheduler::<Job>(workers);
        let shutdown = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for queue in queues {
                let outcome_tx = outcome_tx.clone();
                let shutdown = &shutdown;
                scope.spawn(move || loop {
                    match queue.next() {
                        Some(job) => {
                            let outcome = self.run_job(&job);
                            if outcome_tx.send(outcome).is_err() {
                                break;
                            }
                        }
                        None => {
                            if shutdown.load(Ordering::SeqCst) {
                                break;
                            }
                            std::thread::sleep(Duration::from_micros(200));
                        }
                    }
                });
            }
            drop(outcome_tx);

            self.drive(
                graph,
                ready,
                active,
                failed,
                workers,
                outcome_rx,
                stats,
                completed,
                |job| scheduler.inject(job),
            );
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    /// The outer loop of §executor: batch, dispatch, apply, repeat
    #[allow(clippy::too_many_arguments)]
    fn drive<D: FnMut(Job)>(
        &self,
        graph: &mut BuildGraph,
        ready: &ReadyQueue,
        active: &AtomicUsize,
        failed: &AtomicUsize,
        workers: usize,
        outcome_rx: &Receiver<Outcome>,
        stats: &mut BuildStats,
        completed: &mut usize,
        mut dispatch: D,
    ) {
        while failed.load(Ordering::SeqCst) == 0 {
            let mut batch: Vec<TargetId> = Vec::with_capacity(workers);
            while batch.len() < workers {
                match ready.pop() {
                    Some(id) => batch.push(id),
                    None => break,
                }
            }
            if batch.is_empty() && active.load(Ordering::SeqCst) == 0 {
                break;
            }

            // Critical-path first within the batch.
            batch.sort_by(|a, b| {
                let pa = graph.node(a).map(|n| n.priority).unwrap_or(0.0);
                let pb = graph.node(b).map(|n| n.priority).unwrap_or(0.0);
                pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
            });

            for id in batch {
                if let Some(node) = graph.node_mut(&id) {
                    node.status = BuildStatus::Building;
                    let job = Job {
                        target: node.target.clone(),
                        priority: node.priority,
                    };
                    active.fetch_add(1, Ordering::SeqCst);
                    dispatch(job);
                }
            }

            let mut applied = false;
            while let Ok(outcome) = outcome_rx.try_recv() {
                self.apply_outcome(graph, ready, active, failed, stats, completed, outcome);
                applied = true;
            }
            if !applied && ready.is_empty() && active.load(Ordering::SeqCst) > 0 {
                match outcome_rx.recv_timeout(IDLE_WAIT) {
                    Ok(outcome) => {
                        self.apply_outcome(graph, ready, active, failed, stats, completed, outcome)
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        // In-flight work runs to completion and its results are applied,
        // even when a failure has already gated the loop.
        let mut patience = 0u32;
        while active.load(Ordering::SeqCst) > 0 {
            match outcome_rx.recv_timeout(DRAIN_WAIT) {
                Ok(outcome) => {
                    patience = 0;
                    self.apply_outcome(graph, ready, active, failed, stats, completed, outcome);
                }
                Err(RecvTimeoutError::Timeout) => {
                    patience += 1;
                    if patience > DRAIN_LIMIT {
                        warn!("abandoning in-flight work after drain timeout");
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// One worker's handling of one node; never panics outward
    fn run_job(&self, job: &Job) -> Outcome {
        let target_id = job.target.id.clone();
        let result = catch_unwind(AssertUnwindSafe(|| self.build_node(&job.target)));
        match result {
            Ok((result, attempts)) => Outcome {
                target_id,
                result,
                attempts,
            },
            Err(_) => {
                let error = BuildError::CompileFailure {
                    target_id: target_id.clone(),
                    stderr: "language handler panicked".to_string(),
                };
                self.events.publish(&BuildEvent::TargetFailed {
                    target_id: target_id.clone(),
                    error: error.to_string(),
                });
                Outcome {
                    target_id,
                    result: Err(error),
                    attempts: 0,
                }
            }
        }
    }

    /// Cache check, handler dispatch, retry, cache update, events
    fn build_node(&self, target: &Target) -> (BuildResult<(String, bool)>, u32) {
        self.events.publish(&BuildEvent::TargetStarted {
            target_id: target.id.clone(),
        });

        if self.cache.is_cached(&target.id, &target.sources, &target.deps) {
            let hash = self.cache.build_hash(&target.id).unwrap_or_default();
            self.events.publish(&BuildEvent::TargetCached {
                target_id: target.id.clone(),
            });
            return (Ok((hash, true)), 0);
        }

        let handler = match self.handlers.get(target.language) {
            Some(handler) => handler,
            None => {
                let error = BuildError::HandlerNotFound {
                    language: target.language.to_string(),
                };
                self.events.publish(&BuildEvent::TargetFailed {
                    target_id: target.id.clone(),
                    error: error.to_string(),
                });
                return (Err(error), 0);
            }
        };

        let started = Instant::now();
        let mut attempts = 0u32;
        let built = self
            .retry
            .execute(&mut attempts, || handler.build(target, &self.workspace));

        match built {
            Ok(hash) => {
                self.cache
                    .update(&target.id, &target.sources, &target.deps, &hash);
                self.events.publish(&BuildEvent::TargetCompleted {
                    target_id: target.id.clone(),
                    output_hash: hash.clone(),
                    duration: started.elapsed(),
                });
                (Ok((hash, false)), attempts)
            }
            Err(error) => {
                self.events.publish(&BuildEvent::TargetFailed {
                    target_id: target.id.clone(),
                    error: error.to_string(),
                });
                (Err(error), attempts)
            }
        }
    }

    /// Single-writer application of one outcome to the graph
    #[allow(clippy::too_many_arguments)]
    fn apply_outcome(
        &self,
        graph: &mut BuildGraph,
        ready: &ReadyQueue,
        active: &AtomicUsize,
        failed: &AtomicUsize,
        stats: &mut BuildStats,
        completed: &mut usize,
        outcome: Outcome,
    ) {
        active.fetch_sub(1, Ordering::SeqCst);
        let id = outcome.target_id;

        match outcome.result {
            Ok((hash, was_cached)) => {
                if let Some(node) = graph.node_mut(&id) {
                    if was_cached {
                        node.mark_cached(hash);
                        stats.cached += 1;
                    } else {
                        node.mark_success(hash);
                        stats.built += 1;
                    }
                }
                *completed += 1;
                self.events.publish(&BuildEvent::TargetProgress {
                    completed: *completed,
                    total: stats.total,
                });

                let dependents = graph
                    .node(&id)
                    .map(|n| n.dependents.clone())
                    .unwrap_or_default();
                for dependent in dependents {
                    if let Some(node) = graph.node(&dependent) {
                        if node.complete_one_dep() && node.status == BuildStatus::Pending {
                            ready.push(dependent);
                        }
                    }
                }

                if let Some(manager) = &self.checkpoints {
                    if let Err(e) = manager.save(graph) {
                        debug!(error = %e, "incremental checkpoint save failed");
                    }
                }
            }
            Err(error) => {
                warn!(target = %id, error = %error, "target failed");
                if let Some(node) = graph.node_mut(&id) {
                    node.retry_attempts = outcome.attempts;
                    node.mark_failed(error);
                }
                *completed += 1;
                stats.failed += 1;
                failed.fetch_add(1, Ordering::SeqCst);
                self.cascade_failure(graph, &id, stats, completed, failed);
            }
        }
    }

    /// Mark every transitive dependent Failed before any can start
    fn cascade_failure(
        &self,
        graph: &mut BuildGraph,
        origin: &str,
        stats: &mut BuildStats,
        completed: &mut usize,
        failed: &AtomicUsize,
    ) {
        let mut frontier: Vec<TargetId> = graph
            .node(origin)
            .map(|n| n.dependents.clone())
            .unwrap_or_default();

        while let Some(id) = frontier.pop() {
            let already_failed = graph
                .node(&id)
                .map(|n| n.status == BuildStatus::Failed)
                .unwrap_or(true);
            if already_failed {
                continue;
            }

            let error = BuildError::DependencyFailed {
                target_id: id.clone(),
                dep_id: origin.to_string(),
            };
            if let Some(node) = graph.node_mut(&id) {
                node.mark_failed(error.clone());
                frontier.extend(node.dependents.iter().cloned());
            }
            stats.failed += 1;
            *completed += 1;
            failed.fetch_add(1, Ordering::SeqCst);
            self.events.publish(&BuildEvent::TargetFailed {
                target_id: id,
                error: error.to_string(),
            });
        }
    }
}
