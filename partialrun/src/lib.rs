//! Resumable, multi-stream execution of dataflow graphs.
//!
//! A [`Session`] compiles a [`Graph`] into a static plan. A
//! [`PartialGraphExecutionState`] runs any contiguous node range of that plan
//! and keeps the values later ranges need, so a training step can run its
//! forward pass, hand control back to the caller at the Yield node, and
//! resume with the backward pass.
pub mod logging;

mod config;
mod device;
mod error;
mod graph;
pub mod kernels;
mod plan;
mod runtime;
mod session;
mod tensor;
mod training;

pub use config::{SessionOptions, StreamAssignment};
pub use device::{Device, DeviceStream, DeviceStreamCollection, StreamEvent};
pub use error::{Error, Result};
pub use graph::{
    describe_node, AttrValue, Graph, GraphDeserialize, GraphSerialize, Node, OpAttr, OpAttrs,
    OpKind, ValueId, ValueInfo,
};
pub use kernels::{HostKernel, KernelRegistry};
pub use plan::{CrossStreamWait, ExecutionPlan, ExecutionPlanProvider, ProgramRegion, StreamPlanner};
pub use runtime::{
    format_step_line, CancellationToken, ExecutionContext, OutputAllocator,
    PartialGraphExecutionState, RunStats, TraceEvent, TraceEventKind, ValueCache,
};
pub use session::Session;
pub use tensor::{
    checked_numel, compute_strides, numel, shape_matches, DType, FloatElement, Tensor,
    TensorOptions, TensorValue, BF16, F16,
};
pub use training::{
    create_and_initialize_feeds_fetches_manager, run_core, FeedsFetchesManager, TrainingAgent,
};
