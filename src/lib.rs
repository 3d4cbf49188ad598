//! # FORGE - High-Performance Polyglot Build System
//!
//! The build execution core for a polyglot monorepo: a dependency graph,
//! a truly parallel scheduler, content-addressed caches, resume machinery,
//! and the framing for distributed work dispatch. Language toolchains are
//! external collaborators behind a single `build` contract; parsing, CLI,
//! and rendering live in the application shell, not here.
//!
//! ## Architecture
//!
//! - `hash`: BLAKE3 content hashing with size-tiered strategies
//! - `graph`: targets, build nodes, topological ordering, critical paths
//! - `cache`: target-level and action-level build caches
//! - `executor`: lock-free ready queue, worker pool, work stealing, retry
//! - `checkpoint`: per-node state snapshots for resume
//! - `events`: the lifecycle event bus consumed by renderers
//! - `artifact`: content-addressed storage with HTTP replication
//! - `remote`: wire protocol, capabilities, and the worker registry
//! - `query`: `deps`/`rdeps`/`allpaths`/`kind`/`attr` over the graph
//! - `trace`: span trees with W3C context propagation

#![warn(missing_docs)]
#![warn(clippy::all)]

// Crate-wide error taxonomy
pub mod error;

// Environment-driven configuration helpers
pub mod config;

// Language handler contract
pub mod handler;

// Content hashing
pub mod hash;

// Dependency graph
pub mod graph;

// Target and action caches
pub mod cache;

// Parallel executor and retry orchestration
pub mod executor;

// Checkpoint/resume
pub mod checkpoint;

// Lifecycle event bus
pub mod events;

// Content-addressed artifact storage
pub mod artifact;

// Distributed work dispatch
pub mod remote;

// Graph queries
pub mod query;

// Span tracing
pub mod trace;

// Re-export the types nearly every embedder touches
pub use cache::{ActionCache, ActionId, TargetCache, TargetCacheConfig};
pub use error::{BuildError, BuildResult};
pub use events::{BuildEvent, BuildStats, EventBus};
pub use executor::{BuildSummary, Executor, ExecutorConfig};
pub use graph::{BuildGraph, BuildNode, BuildStatus, Target, TargetId, TargetType};
pub use handler::{HandlerRegistry, Language, LanguageHandler};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
