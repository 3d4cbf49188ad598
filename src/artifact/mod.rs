//! Content-addressed artifact storage
//!
//! The store answers for bytes only: caches decide *whether* something is
//! reusable, the store holds *what* was produced. Addresses are 32-byte
//! BLAKE3 digests shared with the action cache, so an action's recorded
//! output hash is directly fetchable here.

mod http;
mod store;

pub use http::{HttpClient, ParsedUrl};
pub use store::{ArtifactStore, ArtifactStoreConfig};

/// Artifacts and actions share one content-address space
pub type ArtifactId = crate::cache::ActionId;
