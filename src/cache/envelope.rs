//! Signed on-disk envelope for the target cache
//!
//! The cache blob is wrapped in `{version, created_at, data, signature}`
//! where the signature is a keyed BLAKE3 MAC with a key derived from the
//! workspace root path. This catches accidental corruption and blobs moved
//! between workspaces; it is not a defense against an attacker who can
//! write the workspace, who could rewrite sources anyway.

use crate::error::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENVELOPE_VERSION: u8 = 1;
const KEY_CONTEXT: &str = "forge 2024-01-09 target cache signing";

/// The serialized wrapper around the cache entry map
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Format version
    pub version: u8,
    /// Unix seconds at seal time
    pub created_at: i64,
    /// The bincode-serialized entry map
    pub data: Vec<u8>,
    /// Keyed BLAKE3 of `data`
    pub signature: Vec<u8>,
}

fn signing_key(workspace_root: &Path) -> [u8; 32] {
    blake3::derive_key(KEY_CONTEXT, workspace_root.to_string_lossy().as_bytes())
}

fn sign(workspace_root: &Path, data: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(&signing_key(workspace_root), data).as_bytes()
}

/// Wrap and sign a serialized entry map
pub fn seal(workspace_root: &Path, data: Vec<u8>) -> BuildResult<Vec<u8>> {
    let signature = sign(workspace_root, &data).to_vec();
    let envelope = SignedEnvelope {
        version: ENVELOPE_VERSION,
        created_at: chrono::Utc::now().timestamp(),
        data,
        signature,
    };
    bincode::serialize(&envelope).map_err(|e| BuildError::CacheLoad(format!("seal failed: {e}")))
}

/// Verify and unwrap a sealed blob
///
/// # Errors
///
/// `SignatureVerification` when the MAC does not match (callers reset the
/// cache and log a corruption note); `CacheLoad` for version, decode, or
/// age failures.
pub fn open(bytes: &[u8], workspace_root: &Path, max_age: Duration) -> BuildResult<Vec<u8>> {
    let envelope: SignedEnvelope = bincode::deserialize(bytes)
        .map_err(|e| BuildError::CacheLoad(format!("envelope decode failed: {e}")))?;

    if envelope.version != ENVELOPE_VERSION {
        return Err(BuildError::CacheLoad(format!(
            "unsupported cache version {}",
            envelope.version
        )));
    }

    let expected = blake3::keyed_hash(&signing_key(workspace_root), &envelope.data);
    if envelope.signature.len() != 32 {
        return Err(BuildError::SignatureVerification);
    }
    let mut provided = [0u8; 32];
    provided.copy_from_slice(&envelope.signature);
    // blake3::Hash equality is constant-time.
    if expected != blake3::Hash::from(provided) {
        return Err(BuildError::SignatureVerification);
    }

    let age = chrono::Utc::now().timestamp() - envelope.created_at;
    if age > max_age.as_secs() as i64 {
        return Err(BuildError::CacheLoad(format!(
            "cache blob is {age}s old, past the {}s limit",
            max_age.as_secs()
        )));
    }

    Ok(envelope.data)
}
