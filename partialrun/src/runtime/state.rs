use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::plan::ProgramRegion;
use crate::session::Session;

use super::cache::ValueCache;
use super::context::ExecutionContext;
use super::trace::{RunStats, TraceEvent};

/// Resumable position of a caller inside a session's graph.
///
/// Holds the node-index bounds of the next partial run, the region derived
/// from them, and the execution context that carries values across runs.
/// One state belongs to one caller at a time; `&mut self` on every run
/// keeps concurrent runs on the same state out.
#[derive(Debug, Default)]
pub struct PartialGraphExecutionState {
    program_counter_start: usize,
    program_counter_end: usize,
    regions: Option<Arc<Vec<ProgramRegion>>>,
    region: Option<((usize, usize), ProgramRegion)>,
    context: Option<ExecutionContext>,
    session_id: Option<Uuid>,
    cache: Option<ValueCache>,
    context_constructions: usize,
}

impl PartialGraphExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_program_counter_start(&mut self, start: usize) {
        self.program_counter_start = start;
    }

    pub fn set_program_counter_end(&mut self, end: usize) {
        self.program_counter_end = end;
    }

    pub fn program_counter_start(&self) -> usize {
        self.program_counter_start
    }

    pub fn program_counter_end(&self) -> usize {
        self.program_counter_end
    }

    /// Session region list, fetched once and kept for later lookups.
    pub fn program_regions(&mut self, session: &Session) -> Arc<Vec<ProgramRegion>> {
        self.regions
            .get_or_insert_with(|| session.program_regions())
            .clone()
    }

    /// Session regions that intersect the current bounds.
    pub fn overlapping_regions(&mut self, session: &Session) -> Vec<ProgramRegion> {
        let (start, end) = (self.program_counter_start, self.program_counter_end);
        self.program_regions(session)
            .iter()
            .filter(|region| region.overlaps(start, end))
            .cloned()
            .collect()
    }

    /// Region covering `[start, end)`, recomputed only when the bounds move.
    pub fn program_region(&mut self, session: &Session) -> Result<&ProgramRegion> {
        let bounds = (self.program_counter_start, self.program_counter_end);
        let node_count = session.node_count();
        if bounds.0 > bounds.1 || bounds.1 > node_count {
            return Err(Error::invalid(format!(
                "program counters [{}, {}) outside graph of {} nodes",
                bounds.0, bounds.1, node_count
            )));
        }
        if self.region.as_ref().map(|(cached, _)| *cached) != Some(bounds) {
            let region = session.plan().region_for(bounds.0, bounds.1);
            crate::trace!(
                "state.region [{}, {}) streams={:?}",
                bounds.0,
                bounds.1,
                region.stream_pc_range
            );
            self.region = Some((bounds, region));
        }
        match &self.region {
            Some((_, region)) => Ok(region),
            None => Err(Error::Internal(anyhow::anyhow!("region cache empty"))),
        }
    }

    /// Fails when this state already carries a context of another session.
    pub(crate) fn check_session(&self, session: &Session) -> Result<()> {
        match self.session_id {
            Some(id) if id != session.id() => Err(Error::invalid(format!(
                "execution state is bound to session {}, not {}",
                id,
                session.id()
            ))),
            _ => Ok(()),
        }
    }

    /// Context for `session`, created on first use and reused after.
    pub fn execution_context(&mut self, session: &Session) -> Result<&mut ExecutionContext> {
        self.check_session(session)?;
        if self.context.is_none() {
            self.context_constructions += 1;
            self.session_id = Some(session.id());
        }
        Ok(self
            .context
            .get_or_insert_with(|| ExecutionContext::new(session)))
    }

    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    pub fn context_id(&self) -> Option<Uuid> {
        self.context.as_ref().map(ExecutionContext::id)
    }

    /// How many contexts this state has built. Stays at one for its lifetime.
    pub fn context_constructions(&self) -> usize {
        self.context_constructions
    }

    pub fn bind_cache(&mut self, cache: Option<ValueCache>) {
        self.cache = cache;
    }

    pub fn bound_cache(&self) -> Option<&ValueCache> {
        self.cache.as_ref()
    }

    pub fn trace(&self) -> Vec<TraceEvent> {
        self.context
            .as_ref()
            .map(ExecutionContext::trace)
            .unwrap_or_default()
    }

    pub fn last_run_stats(&self) -> Option<&RunStats> {
        self.context.as_ref().map(ExecutionContext::stats)
    }
}
