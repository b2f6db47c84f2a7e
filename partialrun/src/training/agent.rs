use std::sync::Arc;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::runtime::{
    CancellationToken, PartialGraphExecutionState, RunRequest, ValueCache,
};
use crate::session::Session;
use crate::tensor::TensorValue;

use super::FeedsFetchesManager;

/// Build the feed/fetch binding for one partial configuration of `session`.
pub fn create_and_initialize_feeds_fetches_manager<S: AsRef<str>>(
    session: &Session,
    feed_names: &[S],
    fetch_names: &[S],
    output_device_info: &[Device],
) -> Result<FeedsFetchesManager> {
    FeedsFetchesManager::create(session.graph(), feed_names, fetch_names, output_device_info)
}

/// Execute the region named by `state`'s program counters.
///
/// A run starting at node 0 rebinds the state's cache to `cache`, clearing it
/// when `cache` is `None`. Later runs keep the bound cache unless a new one
/// is given.
pub fn run_core(
    session: &Session,
    feeds: &[TensorValue],
    fetches: &mut Vec<TensorValue>,
    state: &mut PartialGraphExecutionState,
    manager: &FeedsFetchesManager,
    cache: Option<ValueCache>,
    token: &CancellationToken,
) -> Result<()> {
    let region = state.program_region(session)?.clone();
    state.check_session(session)?;
    if region.node_start == 0 || cache.is_some() {
        state.bind_cache(cache);
    }
    let cache = state.bound_cache().cloned();
    crate::trace!(
        "run_core session={} range=[{}, {})",
        session.id(),
        region.node_start,
        region.node_end
    );
    state.execution_context(session)?.run(RunRequest {
        region: &region,
        manager,
        feeds,
        fetches,
        cache: cache.as_ref(),
        token,
    })
}

/// Forward/backward driver over a graph split by a Yield node.
///
/// The Yield's inputs are the forward fetches and its outputs are the
/// backward feeds. Forward covers `[0, yield)`, backward covers
/// `[yield, nodes)`.
#[derive(Debug)]
pub struct TrainingAgent {
    session: Arc<Session>,
    fw_manager: FeedsFetchesManager,
    bw_manager: FeedsFetchesManager,
    fw_program_counter_end: usize,
    bw_program_counter_end: usize,
}

impl TrainingAgent {
    pub fn new<S: AsRef<str>>(
        session: Arc<Session>,
        fw_feed_names: &[S],
        fw_outputs_device_info: &[Device],
        bw_fetches_names: &[S],
        bw_outputs_device_info: &[Device],
    ) -> Result<Self> {
        let graph = session.graph();
        let yield_index = graph
            .yield_nodes()
            .first()
            .copied()
            .ok_or_else(|| Error::invalid("graph has no yield node to split at"))?;
        let yield_node = graph.node(yield_index);
        let fw_fetch_names = yield_node
            .inputs
            .iter()
            .map(|id| graph.value_name(*id).to_string())
            .collect::<Vec<_>>();
        let bw_feed_names = yield_node
            .outputs
            .iter()
            .map(|id| graph.value_name(*id).to_string())
            .collect::<Vec<_>>();
        let fw_feed_names = fw_feed_names
            .iter()
            .map(|name| name.as_ref().to_string())
            .collect::<Vec<_>>();
        let bw_fetches_names = bw_fetches_names
            .iter()
            .map(|name| name.as_ref().to_string())
            .collect::<Vec<_>>();

        let fw_manager = create_and_initialize_feeds_fetches_manager(
            &session,
            &fw_feed_names,
            &fw_fetch_names,
            fw_outputs_device_info,
        )?;
        let bw_manager = create_and_initialize_feeds_fetches_manager(
            &session,
            &bw_feed_names,
            &bw_fetches_names,
            bw_outputs_device_info,
        )?;
        let bw_program_counter_end = session.node_count();
        crate::trace!(
            "training_agent.create fw=[0, {}) bw=[{}, {})",
            yield_index,
            yield_index,
            bw_program_counter_end
        );
        Ok(Self {
            session,
            fw_manager,
            bw_manager,
            fw_program_counter_end: yield_index,
            bw_program_counter_end,
        })
    }

    /// Run `[0, yield)`. Values the backward pass needs stay resident in
    /// `state` and are mirrored into `cache` when one is given.
    pub fn run_forward(
        &self,
        feeds: &[TensorValue],
        fetches: &mut Vec<TensorValue>,
        state: &mut PartialGraphExecutionState,
        cache: Option<ValueCache>,
        token: &CancellationToken,
    ) -> Result<()> {
        state.set_program_counter_start(0);
        state.set_program_counter_end(self.fw_program_counter_end);
        self.run_core(feeds, fetches, state, &self.fw_manager, cache, token)
    }

    /// Run `[yield, nodes)` with the yield outputs as feeds.
    pub fn run_backward(
        &self,
        feeds: &[TensorValue],
        fetches: &mut Vec<TensorValue>,
        state: &mut PartialGraphExecutionState,
        token: &CancellationToken,
    ) -> Result<()> {
        state.set_program_counter_start(self.fw_program_counter_end);
        state.set_program_counter_end(self.bw_program_counter_end);
        self.run_core(feeds, fetches, state, &self.bw_manager, None, token)
    }

    pub fn run_core(
        &self,
        feeds: &[TensorValue],
        fetches: &mut Vec<TensorValue>,
        state: &mut PartialGraphExecutionState,
        manager: &FeedsFetchesManager,
        cache: Option<ValueCache>,
        token: &CancellationToken,
    ) -> Result<()> {
        run_core(&self.session, feeds, fetches, state, manager, cache, token)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn fw_manager(&self) -> &FeedsFetchesManager {
        &self.fw_manager
    }

    pub fn bw_manager(&self) -> &FeedsFetchesManager {
        &self.bw_manager
    }

    pub fn fw_program_counter_end(&self) -> usize {
        self.fw_program_counter_end
    }

    pub fn bw_program_counter_end(&self) -> usize {
        self.bw_program_counter_end
    }
}
