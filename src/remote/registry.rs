//! Worker registry and capability-aware dispatch
//!
//! The coordinator tracks every worker it has seen: state, last heartbeat,
//! load metrics, and the actions it currently holds. Selection filters to
//! healthy workers whose metrics do not contradict the action's declared
//! capabilities, then picks the least loaded with a deterministic
//! tie-break. A worker that misses its heartbeat window is failed and its
//! in-flight actions are handed back for re-dispatch.

use crate::cache::ActionId;
use crate::config::env_parse;
use crate::error::{BuildError, BuildResult};
use crate::remote::message::{SystemMetrics, WorkerId};
use crate::remote::Capabilities;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Memory utilization above which memory-bound actions are not dispatched
const MEMORY_PRESSURE: f64 = 0.85;
/// CPU utilization above which CPU-bound actions are not dispatched
const CPU_PRESSURE: f64 = 0.90;
/// Disk utilization above which nothing is dispatched
const DISK_PRESSURE: f64 = 0.95;
/// Queue-depth weight in the load score
const LOAD_QUEUE_WEIGHT: f64 = 0.6;
/// CPU weight in the load score
const LOAD_CPU_WEIGHT: f64 = 0.4;

/// Lifecycle state of a remote worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Registered, no work assigned
    Idle,
    /// Executing at least one action
    Executing,
    /// Raiding a peer's queue
    Stealing,
    /// Pushing outputs to the artifact store
    Uploading,
    /// Unresponsive or crashed; never selected
    Failed,
    /// Finishing in-progress work, taking nothing new
    Draining,
}

/// Everything the coordinator knows about one worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Registry-assigned id; never 0
    pub id: WorkerId,
    /// Where the worker listens
    pub address: String,
    /// Current lifecycle state
    pub state: WorkerState,
    /// When we last heard from it
    pub last_seen: Instant,
    /// Its latest load snapshot
    pub metrics: SystemMetrics,
    /// Actions dispatched and not yet resolved
    pub in_progress: Vec<ActionId>,
    /// Actions completed successfully, cumulative
    pub completed: u64,
    /// Actions failed, cumulative
    pub failed: u64,
    /// Total execution wall-clock across completed actions
    pub execution_time: Duration,
}

/// Registry tunables
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A worker silent for longer than this is marked Failed
    pub heartbeat_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

impl RegistryConfig {
    /// Defaults overridden by `BUILDER_HEARTBEAT_TIMEOUT_SECS`
    pub fn from_environment() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_parse::<u64>("BUILDER_HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout = Duration::from_secs(secs.max(1));
        }
        config
    }
}

/// Coordinator-side map of every known worker
pub struct WorkerRegistry {
    config: RegistryConfig,
    workers: Mutex<HashMap<WorkerId, WorkerInfo>>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
            // 0 is the broadcast id and never assigned.
            next_id: AtomicU64::new(1),
        }
    }

    /// Admit a worker and assign its id
    pub fn register(&self, address: impl Into<String>, metrics: SystemMetrics) -> WorkerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = WorkerInfo {
            id,
            address: address.into(),
            state: WorkerState::Idle,
            last_seen: Instant::now(),
            metrics,
            in_progress: Vec::new(),
            completed: 0,
            failed: 0,
            execution_time: Duration::ZERO,
        };
        info!(worker = id, address = %info.address, "worker registered");
        self.workers.lock().insert(id, info);
        id
    }

    /// Record a heartbeat with a fresh metrics snapshot
    pub fn heartbeat(&self, id: WorkerId, metrics: SystemMetrics) -> BuildResult<()> {
        let mut workers = self.workers.lock();
        let info = workers.get_mut(&id).ok_or(BuildError::Worker {
            id,
            reason: "heartbeat from unknown worker".to_string(),
        })?;
        info.last_seen = Instant::now();
        info.metrics = metrics;
        Ok(())
    }

    /// Refresh metrics without touching liveness (PeerMetricsUpdate)
    pub fn update_metrics(&self, id: WorkerId, metrics: SystemMetrics) {
        if let Some(info) = self.workers.lock().get_mut(&id) {
            info.metrics = metrics;
        }
    }

    fn is_healthy(&self, info: &WorkerInfo) -> bool {
        info.state != WorkerState::Failed && info.last_seen.elapsed() < self.config.heartbeat_timeout
    }

    /// Pick the worker to run an action with these capabilities
    ///
    /// Healthy workers whose metrics contradict the capabilities are
    /// filtered out; the survivor with the lowest load wins, ties broken
    /// by id so selection is deterministic.
    ///
    /// # Errors
    ///
    /// `Worker` when no eligible worker exists.
    pub fn select_worker(&self, capabilities: &Capabilities) -> BuildResult<WorkerId> {
        let workers = self.workers.lock();
        let mut best: Option<(f64, WorkerId)> = None;

        for info in workers.values() {
            if !self.is_healthy(info) {
                continue;
            }
            // Draining workers finish what they hold; nothing new.
            if info.state == WorkerState::Draining {
                continue;
            }
            if info.metrics.disk > DISK_PRESSURE {
                continue;
            }
            if capabilities.is_memory_bound() && info.metrics.memory > MEMORY_PRESSURE {
                continue;
            }
            if capabilities.is_cpu_bound() && info.metrics.cpu > CPU_PRESSURE {
                continue;
            }

            let load = LOAD_QUEUE_WEIGHT * info.metrics.queue_depth as f64
                + LOAD_CPU_WEIGHT * info.metrics.cpu;
            let candidate = (load, info.id);
            let better = match best {
                None => true,
                Some((best_load, best_id)) => {
                    load < best_load || (load == best_load && info.id < best_id)
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        best.map(|(_, id)| id).ok_or(BuildError::Worker {
            id: 0,
            reason: "no eligible worker for action capabilities".to_string(),
        })
    }

    /// Record an action dispatched to a worker
    pub fn assign(&self, id: WorkerId, action: ActionId) -> BuildResult<()> {
        let mut workers = self.workers.lock();
        let info = workers.get_mut(&id).ok_or(BuildError::Worker {
            id,
            reason: "assignment to unknown worker".to_string(),
        })?;
        info.in_progress.push(action);
        if info.state == WorkerState::Idle {
            info.state = WorkerState::Executing;
        }
        Ok(())
    }

    /// Record an action's completion and update cumulative counters
    pub fn complete(&self, id: WorkerId, action: &ActionId, success: bool, duration: Duration) {
        let mut workers = self.workers.lock();
        if let Some(info) = workers.get_mut(&id) {
            info.in_progress.retain(|a| a != action);
            if success {
                info.completed += 1;
            } else {
                info.failed += 1;
            }
            info.execution_time += duration;
            if info.in_progress.is_empty() && info.state == WorkerState::Executing {
                info.state = WorkerState::Idle;
            }
        }
    }

    /// Fail a worker now; returns its in-flight actions for re-dispatch
    pub fn mark_failed(&self, id: WorkerId, reason: &str) -> Vec<ActionId> {
        let mut workers = self.workers.lock();
        match workers.get_mut(&id) {
            Some(info) => {
                warn!(worker = id, reason, "worker marked failed");
                info.state = WorkerState::Failed;
                std::mem::take(&mut info.in_progress)
            }
            None => Vec::new(),
        }
    }

    /// Fail every worker past the heartbeat window; returns all orphaned
    /// actions for re-dispatch
    pub fn reap_expired(&self) -> Vec<ActionId> {
        let mut workers = self.workers.lock();
        let mut orphaned = Vec::new();
        for info in workers.values_mut() {
            if info.state != WorkerState::Failed
                && info.last_seen.elapsed() >= self.config.heartbeat_timeout
            {
                warn!(worker = info.id, "worker missed heartbeat window");
                info.state = WorkerState::Failed;
                orphaned.append(&mut info.in_progress);
            }
        }
        orphaned
    }

    /// Move a worker into Draining so it takes no new work
    pub fn begin_drain(&self, id: WorkerId) {
        if let Some(info) = self.workers.lock().get_mut(&id) {
            info.state = WorkerState::Draining;
        }
    }

    /// Forget a worker entirely
    pub fn remove(&self, id: WorkerId) -> Option<WorkerInfo> {
        self.workers.lock().remove(&id)
    }

    /// A copy of one worker's record
    pub fn get(&self, id: WorkerId) -> Option<WorkerInfo> {
        self.workers.lock().get(&id).cloned()
    }

    /// Ids of all currently healthy workers
    pub fn healthy_workers(&self) -> Vec<WorkerId> {
        let workers = self.workers.lock();
        let mut ids: Vec<WorkerId> = workers
            .values()
            .filter(|info| self.is_healthy(info))
            .map(|info| info.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of known workers, any state
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    /// Whether no workers are known
    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(cpu: f64, memory: f64, queue_depth: u32) -> SystemMetrics {
        SystemMetrics {
            cpu,
            memory,
            disk: 0.2,
            queue_depth,
            active_actions: 0,
        }
    }

    fn action(tag: &str) -> ActionId {
        ActionId::from_content(tag.as_bytes())
    }

    #[test]
    fn test_register_assigns_unique_nonzero_ids() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let a = registry.register("10.0.0.1:7400", metrics(0.1, 0.1, 0));
        let b = registry.register("10.0.0.2:7400", metrics(0.1, 0.1, 0));
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_memory_bound_avoids_pressured_worker() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let hot = registry.register("hot:1", metrics(0.1, 0.90, 0));
        let cool = registry.register("cool:1", metrics(0.1, 0.20, 0));

        let caps = Capabilities {
            max_memory: 1,
            ..Capabilities::default()
        };
        assert_eq!(registry.select_worker(&caps).unwrap(), cool);

        // Without a memory bound, the lower-load worker wins regardless.
        let unbounded = Capabilities::default();
        let selected = registry.select_worker(&unbounded).unwrap();
        assert!(selected == hot || selected == cool);
    }

    #[test]
    fn test_cpu_bound_avoids_pressured_worker() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let _busy = registry.register("busy:1", metrics(0.95, 0.1, 0));
        let free = registry.register("free:1", metrics(0.10, 0.1, 5));

        let caps = Capabilities {
            max_cpu: 2000,
            ..Capabilities::default()
        };
        assert_eq!(registry.select_worker(&caps).unwrap(), free);
    }

    #[test]
    fn test_disk_pressure_disqualifies_everything() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let mut full = metrics(0.1, 0.1, 0);
        full.disk = 0.99;
        registry.register("full:1", full);
        assert!(registry.select_worker(&Capabilities::default()).is_err());
    }

    #[test]
    fn test_lowest_load_wins() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let _loaded = registry.register("loaded:1", metrics(0.5, 0.1, 10));
        let light = registry.register("light:1", metrics(0.5, 0.1, 1));
        assert_eq!(
            registry.select_worker(&Capabilities::default()).unwrap(),
            light
        );
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let first = registry.register("a:1", metrics(0.3, 0.1, 2));
        let _second = registry.register("b:1", metrics(0.3, 0.1, 2));
        for _ in 0..10 {
            assert_eq!(
                registry.select_worker(&Capabilities::default()).unwrap(),
                first
            );
        }
    }

    #[test]
    fn test_failed_worker_never_selected() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let only = registry.register("only:1", metrics(0.1, 0.1, 0));
        registry.mark_failed(only, "test");
        assert!(registry.select_worker(&Capabilities::default()).is_err());
    }

    #[test]
    fn test_mark_failed_returns_in_flight() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let id = registry.register("w:1", metrics(0.1, 0.1, 0));
        registry.assign(id, action("a")).unwrap();
        registry.assign(id, action("b")).unwrap();

        let orphaned = registry.mark_failed(id, "crashed");
        assert_eq!(orphaned.len(), 2);
        assert!(orphaned.contains(&action("a")));
    }

    #[test]
    fn test_reap_expired_fails_silent_workers() {
        let config = RegistryConfig {
            heartbeat_timeout: Duration::from_millis(10),
        };
        let registry = WorkerRegistry::new(config);
        let id = registry.register("w:1", metrics(0.1, 0.1, 0));
        registry.assign(id, action("inflight")).unwrap();

        std::thread::sleep(Duration::from_millis(25));
        let orphaned = registry.reap_expired();
        assert_eq!(orphaned, vec![action("inflight")]);
        assert_eq!(registry.get(id).unwrap().state, WorkerState::Failed);
    }

    #[test]
    fn test_complete_updates_counters_and_state() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let id = registry.register("w:1", metrics(0.1, 0.1, 0));
        let a = action("a");
        registry.assign(id, a).unwrap();
        assert_eq!(registry.get(id).unwrap().state, WorkerState::Executing);

        registry.complete(id, &a, true, Duration::from_millis(400));
        let info = registry.get(id).unwrap();
        assert_eq!(info.state, WorkerState::Idle);
        assert_eq!(info.completed, 1);
        assert_eq!(info.execution_time, Duration::from_millis(400));
        assert!(info.in_progress.is_empty());
    }

    #[test]
    fn test_draining_worker_takes_no_new_work() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let id = registry.register("w:1", metrics(0.1, 0.1, 0));
        registry.begin_drain(id);
        assert!(registry.select_worker(&Capabilities::default()).is_err());
    }
}
