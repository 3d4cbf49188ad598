//! Checkpoint and resume
//!
//! The executor snapshots per-node status as a build progresses; a later
//! run adopts every node the snapshot proves finished and schedules only
//! the rest. A checkpoint is only trusted when its node set matches the
//! graph exactly and it is younger than the staleness window.

use crate::config::{cache_dir, env_parse, env_string};
use crate::error::BuildResult;
use crate::graph::{BuildGraph, BuildStatus, TargetId};
use crate::remote::wire::{self, WireError, WireResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// File magic for checkpoint blobs
const MAGIC: &[u8; 4] = b"CKPT";
/// Current format version
const VERSION: u8 = 1;
/// File name under the workspace cache directory
const CHECKPOINT_FILE: &str = "checkpoint.bin";
/// Checkpoints older than this are ignored on load
const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

fn status_to_u8(status: BuildStatus) -> u8 {
    match status {
        BuildStatus::Pending => 0,
        BuildStatus::Building => 1,
        BuildStatus::Success => 2,
        BuildStatus::Cached => 3,
        BuildStatus::Failed => 4,
    }
}

fn status_from_u8(value: u8) -> WireResult<BuildStatus> {
    match value {
        0 => Ok(BuildStatus::Pending),
        1 => Ok(BuildStatus::Building),
        2 => Ok(BuildStatus::Success),
        3 => Ok(BuildStatus::Cached),
        4 => Ok(BuildStatus::Failed),
        other => Err(WireError::Io(format!("unknown node status byte {other}"))),
    }
}

/// A persisted snapshot of per-node build state
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Workspace the snapshot belongs to
    pub workspace_root: String,
    /// Unix seconds at capture time
    pub timestamp: i64,
    /// Nodes in the graph at capture time
    pub total_targets: u32,
    /// Nodes that had reached Success or Cached
    pub completed_targets: u32,
    /// Nodes that had reached Failed
    pub failed_targets: u32,
    /// Ids of the failed nodes
    pub failed_target_ids: Vec<TargetId>,
    /// Status of every node
    pub node_states: HashMap<TargetId, BuildStatus>,
    /// Output hash of every node that had one
    pub node_hashes: HashMap<TargetId, String>,
}

impl Checkpoint {
    /// Snapshot the current state of a graph
    pub fn capture(workspace_root: &Path, graph: &BuildGraph) -> Self {
        let mut node_states = HashMap::with_capacity(graph.len());
        let mut node_hashes = HashMap::new();
        let mut failed_target_ids = Vec::new();
        let mut completed = 0u32;
        let mut failed = 0u32;

        for node in graph.nodes() {
            node_states.insert(node.target.id.clone(), node.status);
            if !node.output_hash.is_empty() {
                node_hashes.insert(node.target.id.clone(), node.output_hash.clone());
            }
            match node.status {
                BuildStatus::Success | BuildStatus::Cached => completed += 1,
                BuildStatus::Failed => {
                    failed += 1;
                    failed_target_ids.push(node.target.id.clone());
                }
                _ => {}
            }
        }
        failed_target_ids.sort_unstable();

        Self {
            workspace_root: workspace_root.to_string_lossy().into_owned(),
            timestamp: chrono::Utc::now().timestamp(),
            total_targets: graph.len() as u32,
            completed_targets: completed,
            failed_targets: failed,
            failed_target_ids,
            node_states,
            node_hashes,
        }
    }

    /// Whether this snapshot is past the 24-hour trust window
    pub fn is_stale(&self) -> bool {
        let age = chrono::Utc::now().timestamp() - self.timestamp;
        age > STALE_AFTER.as_secs() as i64
    }

    /// Whether the snapshot covers exactly the nodes of this graph
    pub fn matches(&self, graph: &BuildGraph) -> bool {
        if self.node_states.len() != graph.len() {
            return false;
        }
        graph.ids().all(|id| self.node_states.contains_key(id))
    }

    /// Adopt finished nodes into the graph; everything else stays Pending
    ///
    /// Returns the number of nodes adopted. Pending counters must be
    /// recomputed by the caller (the manager does this).
    pub fn merge_into(&self, graph: &mut BuildGraph) -> usize {
        let mut adopted = 0;
        for (id, status) in &self.node_states {
            if !status.is_complete() {
                continue;
            }
            if let Some(node) = graph.node_mut(id) {
                let hash = self.node_hashes.get(id).cloned().unwrap_or_default();
                match status {
                    BuildStatus::Success => node.mark_success(hash),
                    BuildStatus::Cached => node.mark_cached(hash),
                    _ => unreachable!("is_complete covers Success and Cached"),
                }
                adopted += 1;
            }
        }
        adopted
    }

    /// Serialize as a `CKPT` v1 blob
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_all(MAGIC)?;
        buf.write_u8(VERSION)?;
        wire::write_string(&mut buf, &self.workspace_root)?;
        buf.write_i64::<BigEndian>(self.timestamp)?;
        buf.write_u32::<BigEndian>(self.total_targets)?;
        buf.write_u32::<BigEndian>(self.completed_targets)?;
        buf.write_u32::<BigEndian>(self.failed_targets)?;

        let mut state_ids: Vec<&TargetId> = self.node_states.keys().collect();
        state_ids.sort_unstable();
        buf.write_u32::<BigEndian>(state_ids.len() as u32)?;
        for id in state_ids {
            wire::write_string(&mut buf, id)?;
            buf.write_u8(status_to_u8(self.node_states[id]))?;
        }

        let mut hash_ids: Vec<&TargetId> = self.node_hashes.keys().collect();
        hash_ids.sort_unstable();
        buf.write_u32::<BigEndian>(hash_ids.len() as u32)?;
        for id in hash_ids {
            wire::write_string(&mut buf, id)?;
            wire::write_string(&mut buf, &self.node_hashes[id])?;
        }

        wire::write_string_list(&mut buf, &self.failed_target_ids)?;
        Ok(buf)
    }

    /// Parse a `CKPT` v1 blob
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        let mut r = std::io::Cursor::new(bytes);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(WireError::BadMagic { expected: "CKPT" });
        }
        let version = r.read_u8()?;
        if version != VERSION {
            return Err(WireError::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }

        let workspace_root = wire::read_string(&mut r)?;
        let timestamp = r.read_i64::<BigEndian>()?;
        let total_targets = r.read_u32::<BigEndian>()?;
        let completed_targets = r.read_u32::<BigEndian>()?;
        let failed_targets = r.read_u32::<BigEndian>()?;

        let state_count = r.read_u32::<BigEndian>()?;
        let mut node_states = HashMap::with_capacity(state_count as usize);
        for _ in 0..state_count {
            let id = wire::read_string(&mut r)?;
            let status = status_from_u8(r.read_u8()?)?;
            node_states.insert(id, status);
        }

        let hash_count = r.read_u32::<BigEndian>()?;
        let mut node_hashes = HashMap::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            let id = wire::read_string(&mut r)?;
            let hash = wire::read_string(&mut r)?;
            node_hashes.insert(id, hash);
        }

        let failed_target_ids = wire::read_string_list(&mut r)?;

        Ok(Self {
            workspace_root,
            timestamp,
            total_targets,
            completed_targets,
            failed_targets,
            failed_target_ids,
            node_states,
            node_hashes,
        })
    }
}

/// Tunables for checkpoint persistence
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Override for the checkpoint file location
    pub path: Option<PathBuf>,
    /// Minimum interval between saves during a build
    pub min_interval: Duration,
    /// Keep the checkpoint after a clean success
    pub retain_on_success: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: None,
            min_interval: Duration::from_millis(1000),
            retain_on_success: false,
        }
    }
}

impl CheckpointConfig {
    /// Defaults overridden by `BUILDER_CHECKPOINT_PATH` and
    /// `BUILDER_CHECKPOINT_INTERVAL_MS`
    pub fn from_environment() -> Self {
        let mut config = Self::default();
        if let Some(path) = env_string("BUILDER_CHECKPOINT_PATH") {
            config.path = Some(PathBuf::from(path));
        }
        if let Some(ms) = env_parse::<u64>("BUILDER_CHECKPOINT_INTERVAL_MS") {
            config.min_interval = Duration::from_millis(ms);
        }
        config
    }
}

/// Owns the checkpoint file for one workspace
pub struct CheckpointManager {
    workspace_root: PathBuf,
    path: PathBuf,
    config: CheckpointConfig,
    last_save: Mutex<Option<Instant>>,
}

impl CheckpointManager {
    /// Create a manager for a workspace
    pub fn new(workspace_root: impl Into<PathBuf>, config: CheckpointConfig) -> Self {
        let workspace_root = workspace_root.into();
        let path = config
            .path
            .clone()
            .unwrap_or_else(|| cache_dir(&workspace_root).join(CHECKPOINT_FILE));
        Self {
            workspace_root,
            path,
            config,
            last_save: Mutex::new(None),
        }
    }

    /// Load the checkpoint file, if one exists and decodes
    pub fn load(&self) -> Option<Checkpoint> {
        let bytes = std::fs::read(&self.path).ok()?;
        match Checkpoint::decode(&bytes) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(error = %e, "checkpoint unreadable; ignoring");
                None
            }
        }
    }

    /// Adopt a prior run's finished nodes into the graph
    ///
    /// Returns the number of adopted nodes; zero when no usable checkpoint
    /// exists, the node set changed, or the snapshot is stale.
    pub fn restore(&self, graph: &mut BuildGraph) -> usize {
        let checkpoint = match self.load() {
            Some(c) => c,
            None => return 0,
        };
        if checkpoint.is_stale() {
            info!("checkpoint is stale; starting fresh");
            return 0;
        }
        if !checkpoint.matches(graph) {
            info!("checkpoint node set differs from graph; starting fresh");
            return 0;
        }

        let adopted = checkpoint.merge_into(graph);
        graph.reset_pending_counts();
        if adopted > 0 {
            info!(adopted, "resumed from checkpoint");
        }
        adopted
    }

    /// Save a snapshot, honoring the rate limit
    pub fn save(&self, graph: &BuildGraph) -> BuildResult<()> {
        {
            let last = self.last_save.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.config.min_interval {
                    return Ok(());
                }
            }
        }
        self.save_now(graph)
    }

    /// Save a snapshot immediately, ignoring the rate limit
    pub fn save_now(&self, graph: &BuildGraph) -> BuildResult<()> {
        let checkpoint = Checkpoint::capture(&self.workspace_root, graph);
        let bytes = checkpoint.encode()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        *self.last_save.lock() = Some(Instant::now());
        debug!(
            completed = checkpoint.completed_targets,
            total = checkpoint.total_targets,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Remove the checkpoint after a clean success, unless retained
    pub fn finish_clean(&self) {
        if self.config.retain_on_success {
            return;
        }
        let _ = std::fs::remove_file(&self.path);
    }

    /// The file this manager reads and writes
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Target, TargetType};
    use crate::handler::Language;
    use tempfile::TempDir;

    fn two_node_graph() -> BuildGraph {
        BuildGraph::from_targets(vec![
            Target::new("//a:a", TargetType::Library, Language::Go),
            Target::new("//b:b", TargetType::Library, Language::Go)
                .with_deps(vec!["//a:a".to_string()]),
        ])
        .unwrap()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut graph = two_node_graph();
        graph.node_mut("//a:a").unwrap().mark_success("hash-a".into());
        let checkpoint = Checkpoint::capture(Path::new("/workspace"), &graph);

        let bytes = checkpoint.encode().unwrap();
        assert_eq!(&bytes[..4], b"CKPT");
        assert_eq!(bytes[4], VERSION);
        let back = Checkpoint::decode(&bytes).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_restore_adopts_finished_nodes() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), CheckpointConfig::default());

        let mut first = two_node_graph();
        first.node_mut("//a:a").unwrap().mark_success("hash-a".into());
        manager.save_now(&first).unwrap();

        let mut second = two_node_graph();
        let adopted = manager.restore(&mut second);
        assert_eq!(adopted, 1);

        let a = second.node("//a:a").unwrap();
        assert_eq!(a.status, BuildStatus::Success);
        assert_eq!(a.output_hash, "hash-a");

        // B's only dep is adopted, so B is immediately ready.
        assert_eq!(second.ready_nodes(), vec!["//b:b".to_string()]);
    }

    #[test]
    fn test_restore_leaves_failed_as_pending() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), CheckpointConfig::default());

        let mut first = two_node_graph();
        first.node_mut("//a:a").unwrap().mark_failed(
            crate::error::BuildError::CompileFailure {
                target_id: "//a:a".to_string(),
                stderr: String::new(),
            },
        );
        manager.save_now(&first).unwrap();

        let mut second = two_node_graph();
        assert_eq!(manager.restore(&mut second), 0);
        assert_eq!(
            second.node("//a:a").unwrap().status,
            BuildStatus::Pending,
            "failed nodes retry on resume"
        );
    }

    #[test]
    fn test_restore_rejects_changed_node_set() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), CheckpointConfig::default());

        let mut first = two_node_graph();
        first.node_mut("//a:a").unwrap().mark_success("hash-a".into());
        manager.save_now(&first).unwrap();

        let mut different = BuildGraph::from_targets(vec![Target::new(
            "//c:c",
            TargetType::Library,
            Language::Go,
        )])
        .unwrap();
        assert_eq!(manager.restore(&mut different), 0);
    }

    #[test]
    fn test_stale_checkpoint_ignored() {
        let graph = two_node_graph();
        let mut checkpoint = Checkpoint::capture(Path::new("/w"), &graph);
        checkpoint.timestamp -= 25 * 60 * 60;
        assert!(checkpoint.is_stale());
    }

    #[test]
    fn test_rate_limit_skips_back_to_back_saves() {
        let dir = TempDir::new().unwrap();
        let config = CheckpointConfig {
            min_interval: Duration::from_secs(3600),
            ..CheckpointConfig::default()
        };
        let manager = CheckpointManager::new(dir.path(), config);
        let graph = two_node_graph();

        manager.save_now(&graph).unwrap();
        let mtime_before = std::fs::metadata(manager.path()).unwrap().modified().unwrap();
        manager.save(&graph).unwrap();
        let mtime_after = std::fs::metadata(manager.path()).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after, "rate-limited save must not rewrite");
    }

    #[test]
    fn test_finish_clean_removes_file() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), CheckpointConfig::default());
        manager.save_now(&two_node_graph()).unwrap();
        assert!(manager.path().exists());
        manager.finish_clean();
        assert!(!manager.path().exists());
    }
}
