use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::config::{SessionOptions, StreamAssignment};
use crate::graph::Graph;

use super::{ExecutionPlanProvider, ProgramRegion};

/// Wait inserted before a node for the latest producer on another stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrossStreamWait {
    pub stream: usize,
    pub node: usize,
    /// Position of `node` in its stream's program.
    pub pc: usize,
}

/// Node placement and synchronization points for one graph.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    node_count: usize,
    stream_of: Vec<usize>,
    pc_of: Vec<usize>,
    programs: Vec<Vec<usize>>,
    waits: Vec<Vec<CrossStreamWait>>,
    boundaries: Vec<usize>,
}

impl ExecutionPlan {
    /// Derive stream programs and waits from a per-node stream placement.
    ///
    /// Boundaries always include `0`, every yield node and the node count.
    pub fn from_assignment(
        graph: &Graph,
        stream_of: Vec<usize>,
        stream_count: usize,
        extra_boundaries: &[usize],
    ) -> Result<Self> {
        let node_count = graph.node_count();
        if stream_count == 0 {
            return Err(anyhow!("plan needs at least one stream"));
        }
        if stream_of.len() != node_count {
            return Err(anyhow!(
                "stream assignment covers {} nodes, graph has {}",
                stream_of.len(),
                node_count
            ));
        }
        if let Some((node, stream)) = stream_of
            .iter()
            .enumerate()
            .find(|(_, stream)| **stream >= stream_count)
        {
            return Err(anyhow!(
                "node {} assigned to stream {} of {}",
                node,
                stream,
                stream_count
            ));
        }

        let mut programs = vec![Vec::new(); stream_count];
        let mut pc_of = vec![0; node_count];
        for (node, stream) in stream_of.iter().enumerate() {
            pc_of[node] = programs[*stream].len();
            programs[*stream].push(node);
        }

        let mut waits = Vec::with_capacity(node_count);
        for node in graph.nodes() {
            let stream = stream_of[node.index];
            let mut latest: Vec<Option<usize>> = vec![None; stream_count];
            for input in &node.inputs {
                let Some(producer) = graph.producer(*input) else {
                    continue;
                };
                if stream_of[producer] == stream || graph.node(producer).op.is_yield() {
                    continue;
                }
                let slot = &mut latest[stream_of[producer]];
                if slot.map_or(true, |current| current < producer) {
                    *slot = Some(producer);
                }
            }
            waits.push(
                latest
                    .iter()
                    .enumerate()
                    .filter_map(|(stream, node)| {
                        node.map(|node| CrossStreamWait {
                            stream,
                            node,
                            pc: pc_of[node],
                        })
                    })
                    .collect(),
            );
        }

        let mut boundaries = vec![0, node_count];
        boundaries.extend(graph.yield_nodes());
        for boundary in extra_boundaries {
            if *boundary > node_count {
                return Err(anyhow!(
                    "region boundary {} beyond node count {}",
                    boundary,
                    node_count
                ));
            }
            boundaries.push(*boundary);
        }
        boundaries.sort_unstable();
        boundaries.dedup();

        Ok(Self {
            node_count,
            stream_of,
            pc_of,
            programs,
            waits,
            boundaries,
        })
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn stream_count(&self) -> usize {
        self.programs.len()
    }

    pub fn stream_of(&self, node: usize) -> usize {
        self.stream_of[node]
    }

    pub fn pc_of(&self, node: usize) -> usize {
        self.pc_of[node]
    }

    /// Node indices executed by `stream`, ascending.
    pub fn program(&self, stream: usize) -> &[usize] {
        &self.programs[stream]
    }

    pub fn waits(&self, node: usize) -> &[CrossStreamWait] {
        &self.waits[node]
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    /// Clip every stream program to the node range `[start, end)`.
    pub fn region_for(&self, start: usize, end: usize) -> ProgramRegion {
        let stream_pc_range = self
            .programs
            .iter()
            .map(|program| {
                let lo = program.partition_point(|node| *node < start);
                let hi = program.partition_point(|node| *node < end);
                (lo, hi.max(lo))
            })
            .collect();
        ProgramRegion {
            node_start: start,
            node_end: end.max(start),
            stream_pc_range,
        }
    }

    /// Regions between consecutive boundaries, ordered by `node_start`.
    pub fn program_regions(&self) -> Vec<ProgramRegion> {
        self.boundaries
            .windows(2)
            .map(|pair| self.region_for(pair[0], pair[1]))
            .collect()
    }
}

/// Default planner placing nodes per [`StreamAssignment`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamPlanner;

impl ExecutionPlanProvider for StreamPlanner {
    fn build_plan(&self, graph: &Graph, options: &SessionOptions) -> Result<ExecutionPlan> {
        let stream_count = options.stream_count();
        let node_count = graph.node_count();
        let stream_of = match &options.assignment {
            StreamAssignment::Single => vec![0; node_count],
            StreamAssignment::RoundRobin => (0..node_count)
                .map(|node| node % stream_count.max(1))
                .collect(),
            StreamAssignment::Explicit(streams) => streams.clone(),
        };
        let plan =
            ExecutionPlan::from_assignment(graph, stream_of, stream_count, &options.boundaries)?;
        crate::trace!(
            "plan.build nodes={} streams={} boundaries={:?}",
            plan.node_count(),
            plan.stream_count(),
            plan.boundaries()
        );
        Ok(plan)
    }
}
