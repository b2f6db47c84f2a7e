mod cache;
mod cancel;
mod context;
mod fetch;
mod state;
mod trace;

pub use cache::ValueCache;
pub use cancel::CancellationToken;
pub use context::ExecutionContext;
pub(crate) use context::RunRequest;
pub use fetch::OutputAllocator;
pub use state::PartialGraphExecutionState;
pub use trace::{format_step_line, RunStats, TraceEvent, TraceEventKind};
