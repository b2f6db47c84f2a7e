//! Static execution plan: node placement on streams, cross-stream waits and
//! program regions.
mod planner;
mod region;

use anyhow::Result;

use crate::config::SessionOptions;
use crate::graph::Graph;

pub use planner::{CrossStreamWait, ExecutionPlan, StreamPlanner};
pub use region::ProgramRegion;

/// Builds the immutable plan a session executes against.
pub trait ExecutionPlanProvider {
    fn build_plan(&self, graph: &Graph, options: &SessionOptions) -> Result<ExecutionPlan>;
}
