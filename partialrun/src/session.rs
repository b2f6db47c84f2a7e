use std::sync::Arc;

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use rayon::{ThreadPool, ThreadPoolBuilder};
use uuid::Uuid;

use crate::config::SessionOptions;
use crate::device::DeviceStreamCollection;
use crate::graph::Graph;
use crate::kernels::KernelRegistry;
use crate::plan::{ExecutionPlan, ExecutionPlanProvider, ProgramRegion, StreamPlanner};

/// Compiled graph plus everything a partial run executes against.
///
/// Immutable once built; execution states borrow it for every run.
pub struct Session {
    id: Uuid,
    graph: Arc<Graph>,
    plan: Arc<ExecutionPlan>,
    streams: Arc<DeviceStreamCollection>,
    kernels: Arc<KernelRegistry>,
    intra_op_pool: Option<Arc<ThreadPool>>,
    options: SessionOptions,
    regions: OnceCell<Arc<Vec<ProgramRegion>>>,
}

impl Session {
    /// Build a session with the built-in kernels and the default planner.
    ///
    /// # Example
    /// ```no_run
    /// # use partialrun::{DType, Graph, OpAttrs, OpKind, Session, SessionOptions};
    /// # fn main() -> anyhow::Result<()> {
    /// let mut graph = Graph::new();
    /// graph.add_input("x", Some(DType::F32), None)?;
    /// graph.add_node("relu_0", OpKind::Relu, OpAttrs::none(), &["x"], &["y"])?;
    /// let session = Session::new(graph, SessionOptions::default())?;
    /// assert_eq!(session.program_regions().len(), 1);
    /// # Ok(()) }
    /// ```
    pub fn new(graph: Graph, options: SessionOptions) -> Result<Self> {
        Self::with_kernels(graph, options, KernelRegistry::with_builtins())
    }

    pub fn with_kernels(
        graph: Graph,
        options: SessionOptions,
        kernels: KernelRegistry,
    ) -> Result<Self> {
        Self::with_plan_provider(graph, options, kernels, &StreamPlanner)
    }

    pub fn with_plan_provider(
        graph: Graph,
        options: SessionOptions,
        kernels: KernelRegistry,
        provider: &dyn ExecutionPlanProvider,
    ) -> Result<Self> {
        let plan = provider.build_plan(&graph, &options)?;
        if plan.stream_count() != options.stream_count() {
            return Err(anyhow!(
                "plan uses {} streams, session has {}",
                plan.stream_count(),
                options.stream_count()
            ));
        }
        if plan.node_count() != graph.node_count() {
            return Err(anyhow!(
                "plan covers {} nodes, graph has {}",
                plan.node_count(),
                graph.node_count()
            ));
        }
        let streams = DeviceStreamCollection::new(&options.stream_devices)?;
        let intra_op_pool = match options.intra_op_threads {
            Some(threads) => Some(Arc::new(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("partialrun-intra-op-{}", index))
                    .build()
                    .map_err(|err| anyhow!("failed to build intra-op threadpool: {}", err))?,
            )),
            None => None,
        };
        let id = Uuid::new_v4();
        crate::trace!(
            "session.create id={} nodes={} streams={} trace={}",
            id,
            graph.node_count(),
            streams.len(),
            options.trace_enabled
        );
        Ok(Self {
            id,
            graph: Arc::new(graph),
            plan: Arc::new(plan),
            streams: Arc::new(streams),
            kernels: Arc::new(kernels),
            intra_op_pool,
            options,
            regions: OnceCell::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    pub fn streams(&self) -> &Arc<DeviceStreamCollection> {
        &self.streams
    }

    pub fn kernels(&self) -> &Arc<KernelRegistry> {
        &self.kernels
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn trace_enabled(&self) -> bool {
        self.options.trace_enabled
    }

    pub(crate) fn intra_op_pool(&self) -> Option<&Arc<ThreadPool>> {
        self.intra_op_pool.as_ref()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Region list of the plan, computed on first request and shared after.
    pub fn program_regions(&self) -> Arc<Vec<ProgramRegion>> {
        self.regions
            .get_or_init(|| {
                let regions = self.plan.program_regions();
                crate::trace!("session.regions id={} count={}", self.id, regions.len());
                Arc::new(regions)
            })
            .clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("nodes", &self.graph.node_count())
            .field("streams", &self.streams.len())
            .field("options", &self.options)
            .finish()
    }
}
