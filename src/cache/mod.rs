//! Build caches
//!
//! Two caches with distinct questions and a shared discipline:
//! - Target cache: "was this target built from these exact inputs?"
//! - Action cache: "did this command, with these inputs and capabilities,
//!   already produce an output?"
//!
//! Both serialize mutation behind an internal mutex, defer writes until an
//! explicit `flush`, recover from any on-disk damage by starting empty, and
//! support an idempotent `close`. Content-addressed bytes themselves live
//! in the artifact store, not here.

mod action;
mod envelope;
mod eviction;
mod target;

pub use action::{ActionCache, ActionEntry, ActionId, ActionType};
pub use envelope::SignedEnvelope;
pub use eviction::{EvictionLimits, EvictionPolicy};
pub use target::{TargetCache, TargetCacheConfig, TargetCacheEntry};
