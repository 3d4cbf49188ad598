//! Crate-wide error taxonomy
//!
//! Every failure the core can surface is one of the kinds below. The
//! executor never propagates these as panics or aborts: per-target failures
//! are recorded on the node and published as `TargetFailed` events, while
//! environmental failures (corrupt cache, bad signature) are recovered
//! locally and logged.

use thiserror::Error;

/// Result type for core build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// Error kinds produced by the build core
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The target graph contains a dependency cycle
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Every target on the cycle, in edge order
        path: Vec<String>,
    },

    /// No handler is registered for the target's language
    #[error("no handler registered for language '{language}'")]
    HandlerNotFound {
        /// The unhandled language name
        language: String,
    },

    /// The language handler reported a compilation failure
    #[error("compilation of '{target_id}' failed")]
    CompileFailure {
        /// Target that failed to compile
        target_id: String,
        /// Captured compiler diagnostics
        stderr: String,
    },

    /// A transient filesystem failure
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// A network-level failure (HTTP, sockets)
    #[error("network failure: {0}")]
    Network(String),

    /// An operation exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The cache file could not be read or decoded
    #[error("cache load failed: {0}")]
    CacheLoad(String),

    /// The cache file decoded but its contents are inconsistent
    #[error("cache corrupted: {0}")]
    CacheCorrupted(String),

    /// Uploaded bytes do not hash to the claimed artifact id
    #[error("artifact hash mismatch: expected {expected}, computed {actual}")]
    ArtifactHashMismatch {
        /// The id the caller claimed
        expected: String,
        /// The hash actually computed over the bytes
        actual: String,
    },

    /// The requested artifact exists neither locally nor remotely
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// A build-description parse error surfaced from the frontend
    #[error("{file}:{line}:{col}: {message}")]
    Parse {
        /// File containing the error
        file: String,
        /// 1-based line
        line: u32,
        /// 1-based column
        col: u32,
        /// Human-readable description
        message: String,
    },

    /// The cache signature did not verify; contents are untrusted
    #[error("cache signature verification failed")]
    SignatureVerification,

    /// A remote worker failed or was removed from the registry
    #[error("worker {id} failed: {reason}")]
    Worker {
        /// Registry id of the worker
        id: u64,
        /// Why it was marked failed
        reason: String,
    },

    /// A wire-level framing or codec failure
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A query-language parse or evaluation failure
    #[error("query error: {0}")]
    Query(String),

    /// A target id or attribute was malformed
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// A dependency failed, so this target was never started
    #[error("'{target_id}' not built: dependency '{dep_id}' failed")]
    DependencyFailed {
        /// The target that was cascaded into failure
        target_id: String,
        /// The dependency whose failure caused the cascade
        dep_id: String,
    },
}

/// Retry-relevant classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely to succeed on retry (I/O, network, resource pressure)
    Transient,
    /// Caused by user input; retrying is pointless
    User,
    /// Cause unknown; a single retry is worthwhile
    Unknown,
}

impl BuildError {
    /// Classify this error for the retry orchestrator
    pub fn classify(&self) -> ErrorClass {
        match self {
            BuildError::TransientIo(_) | BuildError::Network(_) | BuildError::Timeout(_) => {
                ErrorClass::Transient
            }
            BuildError::Cycle { .. }
            | BuildError::HandlerNotFound { .. }
            | BuildError::CompileFailure { .. }
            | BuildError::Parse { .. }
            | BuildError::InvalidTarget(_)
            | BuildError::DependencyFailed { .. } => ErrorClass::User,
            _ => ErrorClass::Unknown,
        }
    }

    /// Stable machine-readable code for renderers and logs
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::Cycle { .. } => "E0001",
            BuildError::HandlerNotFound { .. } => "E0002",
            BuildError::CompileFailure { .. } => "E0003",
            BuildError::TransientIo(_) => "E0004",
            BuildError::Network(_) => "E0005",
            BuildError::Timeout(_) => "E0006",
            BuildError::CacheLoad(_) => "E0007",
            BuildError::CacheCorrupted(_) => "E0008",
            BuildError::ArtifactHashMismatch { .. } => "E0009",
            BuildError::ArtifactNotFound(_) => "E0010",
            BuildError::Parse { .. } => "E0011",
            BuildError::SignatureVerification => "E0012",
            BuildError::Worker { .. } => "E0013",
            BuildError::Protocol(_) => "E0014",
            BuildError::Query(_) => "E0015",
            BuildError::InvalidTarget(_) => "E0016",
            BuildError::DependencyFailed { .. } => "E0017",
        }
    }

    /// Actionable suggestions for the user, when any exist
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            BuildError::Cycle { path } => vec![format!(
                "break the cycle by removing one of the edges between: {}",
                path.join(", ")
            )],
            BuildError::HandlerNotFound { language } => vec![
                format!("register a handler for '{language}' before building"),
                "check the 'language' attribute of the failing target".to_string(),
            ],
            BuildError::CompileFailure { target_id, .. } => {
                vec![format!("inspect the compiler output for '{target_id}'")]
            }
            BuildError::SignatureVerification | BuildError::CacheCorrupted(_) => {
                vec!["delete the .builder-cache directory to force a clean rebuild".to_string()]
            }
            _ => Vec::new(),
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                BuildError::Timeout(err.to_string())
            }
            _ => BuildError::TransientIo(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let cycle = BuildError::Cycle {
            path: vec!["//a:a".to_string(), "//b:b".to_string()],
        };
        assert_eq!(cycle.classify(), ErrorClass::User);

        let io = BuildError::TransientIo("disk hiccup".to_string());
        assert_eq!(io.classify(), ErrorClass::Transient);

        let corrupt = BuildError::CacheCorrupted("truncated".to_string());
        assert_eq!(corrupt.classify(), ErrorClass::Unknown);
    }

    #[test]
    fn test_codes_are_unique() {
        let errors = vec![
            BuildError::Cycle { path: vec![] },
            BuildError::HandlerNotFound {
                language: "zig".to_string(),
            },
            BuildError::CompileFailure {
                target_id: "//a:a".to_string(),
                stderr: String::new(),
            },
            BuildError::TransientIo(String::new()),
            BuildError::Network(String::new()),
            BuildError::Timeout(String::new()),
            BuildError::CacheLoad(String::new()),
            BuildError::CacheCorrupted(String::new()),
            BuildError::ArtifactHashMismatch {
                expected: String::new(),
                actual: String::new(),
            },
            BuildError::ArtifactNotFound(String::new()),
            BuildError::Parse {
                file: String::new(),
                line: 0,
                col: 0,
                message: String::new(),
            },
            BuildError::SignatureVerification,
            BuildError::Worker {
                id: 1,
                reason: String::new(),
            },
            BuildError::Protocol(String::new()),
            BuildError::Query(String::new()),
            BuildError::InvalidTarget(String::new()),
            BuildError::DependencyFailed {
                target_id: String::new(),
                dep_id: String::new(),
            },
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_timeout_io_maps_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err: BuildError = io.into();
        assert!(matches!(err, BuildError::Timeout(_)));
    }

    #[test]
    fn test_cycle_message_names_every_node() {
        let err = BuildError::Cycle {
            path: vec!["//a:a".into(), "//b:b".into(), "//c:c".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("//a:a") && msg.contains("//b:b") && msg.contains("//c:c"));
    }
}
