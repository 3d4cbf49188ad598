//! Build tracing
//!
//! Span trees with W3C trace-context propagation. The executor and the
//! distributed layer observe builds through spans without participating in
//! dispatch; exporters turn finished spans into console lines or a Jaeger
//! JSON file.

mod exporter;
mod span;

pub use exporter::{ConsoleExporter, ExportError, JaegerJsonExporter, SpanExporter};
pub use span::{
    global_tracer, install_global, GlobalTracerGuard, Span, SpanEvent, SpanId, SpanKind, SpanRef,
    SpanStatus, TraceError, TraceId, Tracer, ROOT_PARENT,
};
