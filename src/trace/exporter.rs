//! Span exporters
//!
//! Exporters receive finished spans at flush time. Console output is for
//! humans watching a build; the Jaeger JSON file can be loaded straight
//! into the Jaeger UI for span-tree inspection.

use crate::trace::span::{Span, SpanStatus, ROOT_PARENT};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// Export failures
#[derive(Debug, Error)]
pub enum ExportError {
    /// Writing the export target failed
    #[error("export I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Spans did not serialize
    #[error("export serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receives batches of finished spans
pub trait SpanExporter: Send + Sync {
    /// Export one batch
    ///
    /// # Errors
    ///
    /// Failures are logged by the tracer and never fail the build.
    fn export(&self, spans: &[Span]) -> Result<(), ExportError>;
}

/// Writes one compact line per span to stderr
#[derive(Debug, Default)]
pub struct ConsoleExporter;

impl ConsoleExporter {
    /// Create a console exporter
    pub fn new() -> Self {
        Self
    }
}

impl SpanExporter for ConsoleExporter {
    fn export(&self, spans: &[Span]) -> Result<(), ExportError> {
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        for span in spans {
            let duration_us = span
                .duration()
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0);
            let marker = match span.status {
                SpanStatus::Error => "ERROR",
                _ => "ok",
            };
            let parent = if span.parent_id == ROOT_PARENT {
                "root".to_string()
            } else {
                format!("{:016x}", span.parent_id)
            };
            writeln!(
                out,
                "[trace {}] {:016x} <- {} {} {}us {}",
                span.trace_id, span.span_id, parent, span.name, duration_us, marker
            )?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JaegerTag {
    key: String,
    #[serde(rename = "type")]
    tag_type: String,
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JaegerReference {
    ref_type: String,
    #[serde(rename = "traceID")]
    trace_id: String,
    #[serde(rename = "spanID")]
    span_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JaegerLog {
    timestamp: u64,
    fields: Vec<JaegerTag>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JaegerSpan {
    #[serde(rename = "traceID")]
    trace_id: String,
    #[serde(rename = "spanID")]
    span_id: String,
    operation_name: String,
    references: Vec<JaegerReference>,
    start_time: u64,
    duration: u64,
    tags: Vec<JaegerTag>,
    logs: Vec<JaegerLog>,
    process_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JaegerProcess {
    service_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JaegerTrace {
    #[serde(rename = "traceID")]
    trace_id: String,
    spans: Vec<JaegerSpan>,
    processes: std::collections::HashMap<String, JaegerProcess>,
}

#[derive(Serialize)]
struct JaegerFile {
    data: Vec<JaegerTrace>,
}

/// Accumulates spans and writes a Jaeger-UI-compatible JSON file
pub struct JaegerJsonExporter {
    path: PathBuf,
    service: String,
    seen: Mutex<Vec<Span>>,
}

impl JaegerJsonExporter {
    /// Export to `path` under the given service name
    pub fn new(path: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            service: service.into(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn micros(time: std::time::SystemTime) -> u64 {
        time.duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn to_jaeger(&self, spans: &[Span]) -> JaegerFile {
        let mut traces: std::collections::HashMap<String, Vec<JaegerSpan>> =
            std::collections::HashMap::new();

        for span in spans {
            let trace_hex = span.trace_id.to_hex();
            let references = if span.parent_id == ROOT_PARENT {
                Vec::new()
            } else {
                vec![JaegerReference {
                    ref_type: "CHILD_OF".to_string(),
                    trace_id: trace_hex.clone(),
                    span_id: format!("{:016x}", span.parent_id),
                }]
            };

            let mut tags: Vec<JaegerTag> = span
                .attributes
                .iter()
                .map(|(k, v)| JaegerTag {
                    key: k.clone(),
                    tag_type: "string".to_string(),
                    value: v.clone(),
                })
                .collect();
            tags.sort_by(|a, b| a.key.cmp(&b.key));
            if span.status == SpanStatus::Error {
                tags.push(JaegerTag {
                    key: "error".to_string(),
                    tag_type: "bool".to_string(),
                    value: "true".to_string(),
                });
            }

            let logs = span
                .events
                .iter()
                .map(|event| JaegerLog {
                    timestamp: Self::micros(event.timestamp),
                    fields: vec![JaegerTag {
                        key: "event".to_string(),
                        tag_type: "string".to_string(),
                        value: event.name.clone(),
                    }],
                })
                .collect();

            traces.entry(trace_hex.clone()).or_default().push(JaegerSpan {
                trace_id: trace_hex,
                span_id: format!("{:016x}", span.span_id),
                operation_name: span.name.clone(),
                references,
                start_time: Self::micros(span.start),
                duration: span.duration().map(|d| d.as_micros() as u64).unwrap_or(0),
                tags,
                logs,
                process_id: "p1".to_string(),
            });
        }

        let data = traces
            .into_iter()
            .map(|(trace_id, spans)| {
                let mut processes = std::collections::HashMap::new();
                processes.insert(
                    "p1".to_string(),
                    JaegerProcess {
                        service_name: self.service.clone(),
                    },
                );
                JaegerTrace {
                    trace_id,
                    spans,
                    processes,
                }
            })
            .collect();
        JaegerFile { data }
    }
}

impl SpanExporter for JaegerJsonExporter {
    fn export(&self, spans: &[Span]) -> Result<(), ExportError> {
        let mut seen = self.seen.lock();
        seen.extend_from_slice(spans);
        let file = self.to_jaeger(&seen);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::span::Tracer;
    use tempfile::TempDir;

    #[test]
    fn test_jaeger_export_writes_span_tree() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.json");

        let tracer = Tracer::new("forge");
        tracer.add_exporter(Box::new(JaegerJsonExporter::new(&path, "forge")));

        let root = tracer.start_root("build");
        let child = tracer.start_child(root, "target //a:a");
        tracer.set_attribute(child, "language", "rust");
        tracer.end_span(child);
        tracer.end_span(root);
        tracer.flush();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let trace = &parsed["data"][0];
        assert_eq!(trace["spans"].as_array().unwrap().len(), 2);
        assert_eq!(
            trace["processes"]["p1"]["serviceName"],
            serde_json::json!("forge")
        );

        let spans = trace["spans"].as_array().unwrap();
        let child_span = spans
            .iter()
            .find(|s| s["operationName"] == "target //a:a")
            .unwrap();
        assert_eq!(child_span["references"][0]["refType"], "CHILD_OF");
        assert_eq!(child_span["tags"][0]["key"], "language");
    }

    #[test]
    fn test_flush_drains_pending() {
        let tracer = Tracer::new("forge");
        tracer.add_exporter(Box::new(ConsoleExporter::new()));
        let span = tracer.start_root("short");
        tracer.end_span(span);
        assert_eq!(tracer.pending_count(), 1);
        tracer.flush();
        assert_eq!(tracer.pending_count(), 0);
    }
}
