use serde::{Deserialize, Serialize};

/// Contiguous node-index span with its per-stream program sub-ranges.
///
/// `stream_pc_range[s]` is a half-open range into stream `s`'s program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRegion {
    pub node_start: usize,
    pub node_end: usize,
    pub stream_pc_range: Vec<(usize, usize)>,
}

impl ProgramRegion {
    /// True if `[node_start, node_end)` intersects `[start, end)`.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.node_start < end && start < self.node_end
    }

    pub fn contains(&self, node: usize) -> bool {
        self.node_start <= node && node < self.node_end
    }

    /// Number of nodes covered across all streams.
    pub fn node_count(&self) -> usize {
        self.stream_pc_range
            .iter()
            .map(|(start, end)| end - start)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.node_start == self.node_end
    }
}
