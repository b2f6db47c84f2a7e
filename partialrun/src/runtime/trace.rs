use std::fmt;
use std::time::Duration;

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use uuid::Uuid;

/// Kind of trace event emitted during a partial run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceEventKind {
    OpExecute,
    Skipped,
    Yield,
    Wait,
    CacheRead,
    CacheWrite,
    Release,
    Transfer,
}

impl fmt::Display for TraceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEventKind::OpExecute => write!(f, "OpExecute"),
            TraceEventKind::Skipped => write!(f, "Skipped"),
            TraceEventKind::Yield => write!(f, "Yield"),
            TraceEventKind::Wait => write!(f, "Wait"),
            TraceEventKind::CacheRead => write!(f, "CacheRead"),
            TraceEventKind::CacheWrite => write!(f, "CacheWrite"),
            TraceEventKind::Release => write!(f, "Release"),
            TraceEventKind::Transfer => write!(f, "Transfer"),
        }
    }
}

/// Execution trace record.
///
/// Value-level events (cache traffic, releases, transfers) carry the value
/// name and the index of its producer when there is one.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub node_index: Option<usize>,
    pub node_uuid: Option<Uuid>,
    pub stream: Option<usize>,
    pub node_desc: String,
    pub value: Option<String>,
    pub micros: String,
    pub micros_parts: [u64; 3],
}

impl TraceEvent {
    pub(crate) fn value_event(
        kind: TraceEventKind,
        value: &str,
        producer: Option<usize>,
        desc: String,
    ) -> Self {
        Self {
            kind,
            node_index: producer,
            node_uuid: None,
            stream: None,
            node_desc: desc,
            value: Some(value.to_string()),
            micros: String::new(),
            micros_parts: [0, 0, 0],
        }
    }
}

pub(crate) fn format_trace_timing(duration: Duration) -> (String, [u64; 3]) {
    let total_ns = duration.as_nanos();
    let ms = (total_ns / 1_000_000) as u64;
    let us = ((total_ns / 1_000) % 1_000) as u64;
    let ns = (total_ns % 1_000) as u64;
    (format!("{ms}ms {us}us {ns}ns"), [ms, us, ns])
}

/// One-line rendering used by the trace log.
pub fn format_step_line(event: &TraceEvent) -> String {
    let index = event
        .node_index
        .map(|index| index.to_string())
        .unwrap_or_else(|| "-".to_string());
    let stream = event
        .stream
        .map(|stream| format!("stream {}", stream))
        .unwrap_or_else(|| "host".to_string());
    match event.kind {
        TraceEventKind::OpExecute => format!(
            "{} [{}] {} -- {} -- ({})",
            index, stream, event.kind, event.node_desc, event.micros
        ),
        _ => format!("{} [{}] {} -- {}", index, stream, event.kind, event.node_desc),
    }
}

impl Serialize for TraceEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("TraceEvent", 7)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("node_index", &self.node_index)?;
        state.serialize_field("node_uuid", &self.node_uuid)?;
        state.serialize_field("stream", &self.stream)?;
        state.serialize_field("desc", &self.node_desc)?;
        state.serialize_field("value", &self.value)?;
        state.serialize_field("micros", &self.micros_parts)?;
        state.end()
    }
}

/// Counters of the most recent run against a context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub node_start: usize,
    pub node_end: usize,
    pub nodes_launched: usize,
    pub kernels_executed: usize,
    pub kernels_skipped: usize,
    pub cross_stream_waits: usize,
    pub cache_reads: usize,
    pub cache_writes: usize,
    pub values_retained: usize,
    pub values_released: usize,
    pub fetches_materialized: usize,
}
