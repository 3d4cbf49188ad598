//! Distributed work dispatch
//!
//! This module provides:
//! - `wire`: the big-endian codec primitives shared by every binary format
//! - `Capabilities`: the sandbox contract an action executes under
//! - `Envelope` and the message set: framing for coordinator/worker traffic
//! - `WorkerRegistry`: health tracking and capability-aware selection
//!
//! Only framing and semantics live here. Socket accept loops and transport
//! choice belong to the application shell; everything in this module is
//! exercised the same way in-process and over a stream.

pub mod wire;

mod capabilities;
mod message;
mod registry;

pub use capabilities::Capabilities;
pub use message::{
    ActionSpec, Compression, Envelope, Message, MessageId, PeerInfo, SystemMetrics, WorkerId,
    BROADCAST, PROTOCOL_VERSION,
};
pub use registry::{RegistryConfig, WorkerInfo, WorkerRegistry, WorkerState};
pub use wire::WireError;
