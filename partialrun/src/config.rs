use std::env;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::device::Device;

const STREAMS_ENV: &str = "PARTIALRUN_STREAMS";
const INTRA_OP_THREADS_ENV: &str = "PARTIALRUN_INTRA_OP_THREADS";

/// Policy used by the stream planner to place nodes on streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAssignment {
    /// Every node on stream 0.
    Single,
    /// Node `i` goes to stream `i % stream_count`.
    RoundRobin,
    /// One stream index per node, in node order.
    Explicit(Vec<usize>),
}

/// Session construction options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// One entry per execution stream.
    pub stream_devices: Vec<Device>,
    pub assignment: StreamAssignment,
    /// Region boundaries on top of `0`, the yield nodes and the node count.
    pub boundaries: Vec<usize>,
    pub trace_enabled: bool,
    /// Size of the rayon pool kernels run in; `None` uses the global pool.
    pub intra_op_threads: Option<usize>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stream_devices: vec![Device::Cpu],
            assignment: StreamAssignment::Single,
            boundaries: Vec::new(),
            trace_enabled: false,
            intra_op_threads: None,
        }
    }
}

impl SessionOptions {
    /// Read stream count and intra-op threads from the environment.
    ///
    /// `PARTIALRUN_STREAMS=n` yields `n` CPU streams with round-robin
    /// placement.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Some(streams) = env_usize(STREAMS_ENV)? {
            if streams == 0 {
                return Err(anyhow!("{} must be at least 1", STREAMS_ENV));
            }
            options = options.with_streams(vec![Device::Cpu; streams]);
            if streams > 1 {
                options = options.with_assignment(StreamAssignment::RoundRobin);
            }
        }
        if let Some(threads) = env_usize(INTRA_OP_THREADS_ENV)? {
            options = options.with_intra_op_threads(threads);
        }
        Ok(options)
    }

    pub fn with_streams(mut self, devices: Vec<Device>) -> Self {
        self.stream_devices = devices;
        self
    }

    pub fn with_assignment(mut self, assignment: StreamAssignment) -> Self {
        self.assignment = assignment;
        self
    }

    pub fn with_boundaries(mut self, boundaries: Vec<usize>) -> Self {
        self.boundaries = boundaries;
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    pub fn with_intra_op_threads(mut self, threads: usize) -> Self {
        self.intra_op_threads = Some(threads);
        self
    }

    pub fn stream_count(&self) -> usize {
        self.stream_devices.len()
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|err| anyhow!("invalid {}={:?}: {}", name, value, err)),
        Err(_) => Ok(None),
    }
}
