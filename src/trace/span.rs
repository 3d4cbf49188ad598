//! Spans and the build tracer
//!
//! A trace is a 128-bit id; spans carry 64-bit ids with parent id 0
//! meaning root. Context crosses process boundaries in the W3C
//! trace-context format. The tracer is an explicit object handed down by
//! the application; a scoped global installation exists for code that has
//! no context parameter to thread through.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::trace::exporter::SpanExporter;

/// Parent span id of a root span
pub const ROOT_PARENT: SpanId = 0;

/// 64-bit span identifier; 0 is reserved for "no parent"
pub type SpanId = u64;

/// Tracing failures (context parsing, export)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// A traceparent header did not parse
    #[error("invalid trace context: {0}")]
    InvalidContext(String),
}

/// 128-bit trace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(u128);

impl TraceId {
    /// Generate a fresh random trace id
    pub fn new() -> Self {
        Self(Uuid::new_v4().as_u128())
    }

    /// 32-character lowercase hex
    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    /// Parse 32 hex characters
    pub fn from_hex(hex: &str) -> Result<Self, TraceError> {
        if hex.len() != 32 {
            return Err(TraceError::InvalidContext(format!(
                "trace id must be 32 hex chars, got {}",
                hex.len()
            )));
        }
        u128::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| TraceError::InvalidContext("non-hex trace id".to_string()))
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The role a span plays in a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// In-process work
    Internal,
    /// Calling out (HTTP fetch, worker dispatch)
    Client,
    /// Serving a request (worker executing an action)
    Server,
    /// Emitting to a queue
    Producer,
    /// Consuming from a queue
    Consumer,
}

/// Outcome recorded on a finished span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Not set
    Unset,
    /// Finished cleanly
    Ok,
    /// Finished with an error
    Error,
}

/// A timestamped event inside a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    /// Event name
    pub name: String,
    /// When it happened
    pub timestamp: SystemTime,
    /// Event attributes
    pub attributes: HashMap<String, String>,
}

/// One unit of traced work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// The trace this span belongs to
    pub trace_id: TraceId,
    /// This span's id
    pub span_id: SpanId,
    /// Parent span id, `ROOT_PARENT` for roots
    pub parent_id: SpanId,
    /// Operation name
    pub name: String,
    /// Role in the trace
    pub kind: SpanKind,
    /// Start time
    pub start: SystemTime,
    /// End time, `None` while active
    pub end: Option<SystemTime>,
    /// String attributes
    pub attributes: HashMap<String, String>,
    /// Timestamped events
    pub events: Vec<SpanEvent>,
    /// Outcome
    pub status: SpanStatus,
}

impl Span {
    /// Wall-clock duration, if finished
    pub fn duration(&self) -> Option<Duration> {
        self.end.and_then(|end| end.duration_since(self.start).ok())
    }

    /// Whether the span has ended
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }
}

/// A lightweight reference to an active span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanRef {
    /// The owning trace
    pub trace_id: TraceId,
    /// The span
    pub span_id: SpanId,
}

impl SpanRef {
    /// Render as a W3C `traceparent` header
    pub fn to_traceparent(&self, sampled: bool) -> String {
        format!(
            "00-{}-{:016x}-{:02x}",
            self.trace_id.to_hex(),
            self.span_id,
            u8::from(sampled)
        )
    }

    /// Parse a W3C `traceparent` header; returns the ref and sampled flag
    pub fn from_traceparent(header: &str) -> Result<(Self, bool), TraceError> {
        let parts: Vec<&str> = header.split('-').collect();
        if parts.len() != 4 || parts[0] != "00" {
            return Err(TraceError::InvalidContext(format!(
                "bad traceparent '{header}'"
            )));
        }
        let trace_id = TraceId::from_hex(parts[1])?;
        if parts[2].len() != 16 {
            return Err(TraceError::InvalidContext(
                "span id must be 16 hex chars".to_string(),
            ));
        }
        let span_id = u64::from_str_radix(parts[2], 16)
            .map_err(|_| TraceError::InvalidContext("non-hex span id".to_string()))?;
        let flags = u8::from_str_radix(parts[3], 16)
            .map_err(|_| TraceError::InvalidContext("non-hex flags".to_string()))?;
        Ok((Self { trace_id, span_id }, flags & 0x01 != 0))
    }
}

fn fresh_span_id() -> SpanId {
    loop {
        let id: u64 = rand::thread_rng().gen();
        if id != ROOT_PARENT {
            return id;
        }
    }
}

/// Thread-safe span-tree tracer for one service
pub struct Tracer {
    service: String,
    active: Mutex<HashMap<SpanId, Span>>,
    finished: Mutex<Vec<Span>>,
    exporters: Mutex<Vec<Box<dyn SpanExporter>>>,
}

impl Tracer {
    /// Create a tracer for a named service
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(Vec::new()),
            exporters: Mutex::new(Vec::new()),
        }
    }

    /// The service name spans are exported under
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Attach an exporter; finished spans reach it at every `flush`
    pub fn add_exporter(&self, exporter: Box<dyn SpanExporter>) {
        self.exporters.lock().push(exporter);
    }

    /// Start a root span in a fresh trace
    pub fn start_root(&self, name: impl Into<String>) -> SpanRef {
        self.start(TraceId::new(), ROOT_PARENT, name, SpanKind::Internal)
    }

    /// Start a child of an existing span
    pub fn start_child(&self, parent: SpanRef, name: impl Into<String>) -> SpanRef {
        self.start(parent.trace_id, parent.span_id, name, SpanKind::Internal)
    }

    /// Start a span continuing a remote context (e.g. from a traceparent)
    pub fn start_with_kind(
        &self,
        parent: SpanRef,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> SpanRef {
        self.start(parent.trace_id, parent.span_id, name, kind)
    }

    fn start(
        &self,
        trace_id: TraceId,
        parent_id: SpanId,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> SpanRef {
        let span_id = fresh_span_id();
        let span = Span {
            trace_id,
            span_id,
            parent_id,
            name: name.into(),
            kind,
            start: SystemTime::now(),
            end: None,
            attributes: HashMap::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
        };
        self.active.lock().insert(span_id, span);
        SpanRef { trace_id, span_id }
    }

    /// Set an attribute on an active span
    pub fn set_attribute(&self, span: SpanRef, key: impl Into<String>, value: impl Into<String>) {
        if let Some(active) = self.active.lock().get_mut(&span.span_id) {
            active.attributes.insert(key.into(), value.into());
        }
    }

    /// Add a timestamped event to an active span
    pub fn add_event(&self, span: SpanRef, name: impl Into<String>) {
        if let Some(active) = self.active.lock().get_mut(&span.span_id) {
            active.events.push(SpanEvent {
                name: name.into(),
                timestamp: SystemTime::now(),
                attributes: HashMap::new(),
            });
        }
    }

    /// Set the outcome of an active span
    pub fn set_status(&self, span: SpanRef, status: SpanStatus) {
        if let Some(active) = self.active.lock().get_mut(&span.span_id) {
            active.status = status;
        }
    }

    /// End a span and queue it for export
    pub fn end_span(&self, span: SpanRef) {
        let ended = {
            let mut active = self.active.lock();
            active.remove(&span.span_id)
        };
        if let Some(mut ended) = ended {
            ended.end = Some(SystemTime::now());
            if ended.status == SpanStatus::Unset {
                ended.status = SpanStatus::Ok;
            }
            self.finished.lock().push(ended);
        }
    }

    /// Spans still open
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Finished spans not yet exported
    pub fn pending_count(&self) -> usize {
        self.finished.lock().len()
    }

    /// Push every finished span through every exporter
    pub fn flush(&self) {
        let batch: Vec<Span> = {
            let mut finished = self.finished.lock();
            std::mem::take(&mut *finished)
        };
        if batch.is_empty() {
            return;
        }
        let exporters = self.exporters.lock();
        for exporter in exporters.iter() {
            if let Err(e) = exporter.export(&batch) {
                warn!(error = %e, "span export failed");
            }
        }
    }
}

static GLOBAL_TRACER: Lazy<RwLock<Option<Arc<Tracer>>>> = Lazy::new(|| RwLock::new(None));

/// Restores the previously installed tracer on drop
pub struct GlobalTracerGuard {
    previous: Option<Arc<Tracer>>,
}

impl Drop for GlobalTracerGuard {
    fn drop(&mut self) {
        *GLOBAL_TRACER.write() = self.previous.take();
    }
}

/// Install a tracer as the process-wide default, scoped to the guard
///
/// Application-level code installs once near its entry point; libraries
/// take a `&Tracer` parameter instead of reaching for the global.
pub fn install_global(tracer: Arc<Tracer>) -> GlobalTracerGuard {
    let mut slot = GLOBAL_TRACER.write();
    let previous = slot.replace(tracer);
    GlobalTracerGuard { previous }
}

/// The currently installed global tracer, if any
pub fn global_tracer() -> Option<Arc<Tracer>> {
    GLOBAL_TRACER.read().clone()
}
