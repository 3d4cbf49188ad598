//! Action-level build cache
//!
//! Finer-grained than the target cache: one entry per content-addressed
//! action (compile one translation unit, link one binary). The key is the
//! BLAKE3 of everything that determines the action's output: command,
//! environment, input hashes, and capabilities.

use crate::config::cache_dir;
use crate::error::BuildResult;
use crate::remote::wire::{self, WireError, WireResult};
use crate::remote::Capabilities;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File magic for the action cache blob
const MAGIC: &[u8; 4] = b"ACTC";
/// Current format version
const VERSION: u8 = 1;
/// File name under the workspace cache directory
const ACTION_FILE: &str = "actions.bin";

/// Content address of one action: 32 raw BLAKE3 bytes
///
/// Equality is byte-wise over all 32 bytes; the `Hash` impl uses only the
/// first 8 bytes, which is collision-safe enough for in-memory maps.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ActionId([u8; 32]);

impl ActionId {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Address an action by everything that determines its output
    pub fn compute(
        command: &str,
        env: &HashMap<String, String>,
        input_hashes: &[String],
        capabilities: &Capabilities,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(command.len() as u64).to_be_bytes());
        hasher.update(command.as_bytes());

        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort_unstable();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(env[key].as_bytes());
            hasher.update(b"\0");
        }

        for input in input_hashes {
            hasher.update(input.as_bytes());
            hasher.update(b"\0");
        }

        hasher.update(&capabilities.to_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Address a blob by its content; the artifact store shares this
    /// address space
    pub fn from_content(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Lowercase hex rendering, used for paths and logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex rendering
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::hash::Hash for ActionId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let prefix: [u8; 8] = self.0[..8].try_into().expect("8-byte prefix");
        state.write_u64(u64::from_be_bytes(prefix));
    }
}

impl std::fmt::Debug for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActionId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// What kind of sub-step an action is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    /// Compile one translation unit or module
    Compile,
    /// Link objects into an output
    Link,
    /// Generate sources or metadata
    Codegen,
    /// Run a test binary
    Test,
    /// Anything rule-defined
    Custom,
}

impl ActionType {
    fn to_u8(self) -> u8 {
        match self {
            ActionType::Compile => 0,
            ActionType::Link => 1,
            ActionType::Codegen => 2,
            ActionType::Test => 3,
            ActionType::Custom => 4,
        }
    }

    fn from_u8(value: u8) -> WireResult<Self> {
        match value {
            0 => Ok(ActionType::Compile),
            1 => Ok(ActionType::Link),
            2 => Ok(ActionType::Codegen),
            3 => Ok(ActionType::Test),
            4 => Ok(ActionType::Custom),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// One recorded action execution
#[derive(Debug, Clone, PartialEq)]
pub struct ActionEntry {
    /// Target the action belongs to
    pub target_id: String,
    /// Sub-step identifier within the target (e.g. a source path)
    pub sub_id: String,
    /// Kind of sub-step
    pub action_type: ActionType,
    /// Content address of the action
    pub id: ActionId,
    /// Declared input paths
    pub inputs: Vec<String>,
    /// Produced output paths
    pub outputs: Vec<String>,
    /// Input path -> content hash
    pub input_hashes: HashMap<String, String>,
    /// Output path -> content hash
    pub output_hashes: HashMap<String, String>,
    /// Free-form handler metadata
    pub metadata: HashMap<String, String>,
    /// Unix seconds when the action ran
    pub timestamp: i64,
    /// Unix seconds of the last cache hit
    pub last_access: i64,
    /// Hash of the execution transcript (command, env, exit)
    pub execution_hash: String,
    /// Whether the action succeeded
    pub success: bool,
}

impl ActionEntry {
    fn encode<W: Write>(&self, w: &mut W) -> WireResult<()> {
        wire::write_string(w, &self.target_id)?;
        wire::write_string(w, &self.sub_id)?;
        w.write_u8(self.action_type.to_u8())?;
        wire::write_string(w, &self.id.to_hex())?;
        wire::write_string_list(w, &self.inputs)?;
        wire::write_string_list(w, &self.outputs)?;
        wire::write_string_map(w, &self.input_hashes)?;
        wire::write_string_map(w, &self.output_hashes)?;
        wire::write_string_map(w, &self.metadata)?;
        w.write_i64::<BigEndian>(self.timestamp)?;
        w.write_i64::<BigEndian>(self.last_access)?;
        wire::write_string(w, &self.execution_hash)?;
        w.write_u8(u8::from(self.success))?;
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> WireResult<Self> {
        let target_id = wire::read_string(r)?;
        let sub_id = wire::read_string(r)?;
        let action_type = ActionType::from_u8(r.read_u8()?)?;
        let id_hex = wire::read_string(r)?;
        let id = ActionId::from_hex(&id_hex)
            .ok_or_else(|| WireError::Io(format!("malformed action id '{id_hex}'")))?;
        let inputs = wire::read_string_list(r)?;
        let outputs = wire::read_string_list(r)?;
        let input_hashes = wire::read_string_map(r)?;
        let output_hashes = wire::read_string_map(r)?;
        let metadata = wire::read_string_map(r)?;
        let timestamp = r.read_i64::<BigEndian>()?;
        let last_access = r.read_i64::<BigEndian>()?;
        let execution_hash = wire::read_string(r)?;
        let success = r.read_u8()? != 0;
        Ok(Self {
            target_id,
            sub_id,
            action_type,
            id,
            inputs,
            outputs,
            input_hashes,
            output_hashes,
            metadata,
            timestamp,
            last_access,
            execution_hash,
            success,
        })
    }
}

struct Inner {
    entries: HashMap<ActionId, ActionEntry>,
    dirty: bool,
    closed: bool,
}

/// Persistent cache of action executions, keyed by content address
pub struct ActionCache {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ActionCache {
    /// Open the action cache for a workspace
    ///
    /// Undecodable files reset the cache to empty with a log note, the
    /// same recovery the target cache applies.
    pub fn open(workspace_root: &Path) -> Self {
        let path = cache_dir(workspace_root).join(ACTION_FILE);
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match Self::decode_all(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "action cache unusable; starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(entries = entries.len(), "action cache opened");
        Self {
            path,
            inner: Mutex::new(Inner {
                entries,
                dirty: false,
                closed: false,
            }),
        }
    }

    fn decode_all(bytes: &[u8]) -> WireResult<HashMap<ActionId, ActionEntry>> {
        let mut r = std::io::Cursor::new(bytes);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(WireError::BadMagic { expected: "ACTC" });
        }
        let version = r.read_u8()?;
        if version != VERSION {
            return Err(WireError::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }
        let count = r.read_u32::<BigEndian>()?;
        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let entry = ActionEntry::decode(&mut r)?;
            entries.insert(entry.id, entry);
        }
        Ok(entries)
    }

    fn encode_all(entries: &HashMap<ActionId, ActionEntry>) -> WireResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_all(MAGIC)?;
        buf.write_u8(VERSION)?;
        buf.write_u32::<BigEndian>(entries.len() as u32)?;
        let mut ordered: Vec<&ActionEntry> = entries.values().collect();
        ordered.sort_by(|a, b| a.id.as_bytes().cmp(b.id.as_bytes()));
        for entry in ordered {
            entry.encode(&mut buf)?;
        }
        Ok(buf)
    }

    /// Fetch one entry, refreshing its access time
    pub fn get(&self, id: &ActionId) -> Option<ActionEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(id)?;
        entry.last_access = chrono::Utc::now().timestamp();
        Some(entry.clone())
    }

    /// Whether an entry exists for this id
    pub fn contains(&self, id: &ActionId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Insert or replace an entry; the write is deferred until `flush`
    pub fn put(&self, entry: ActionEntry) {
        let mut inner = self.inner.lock();
        inner.entries.insert(entry.id, entry);
        inner.dirty = true;
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Persist the entry map if anything changed
    pub fn flush(&self) -> BuildResult<()> {
        let mut inner = self.inner.lock();
        if !inner.dirty {
            return Ok(());
        }
        let bytes = Self::encode_all(&inner.entries)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        inner.dirty = false;
        Ok(())
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
        if let Err(e) = self.flush() {
            warn!(error = %e, "action cache flush on close failed");
        }
    }
}

impl Drop for ActionCache {
    fn drop(&mut self) {
        self.close();
    }
}
