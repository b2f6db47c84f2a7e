//! Execution context: launches the nodes of one program region on their
//! streams and settles values at the region boundary.
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::anyhow;
use rayon::ThreadPool;
use uuid::Uuid;

use crate::device::{DeviceStreamCollection, StreamEvent};
use crate::error::{Error, Result};
use crate::graph::{describe_node, Graph, Node, ValueId};
use crate::kernels::KernelRegistry;
use crate::plan::{ExecutionPlan, ProgramRegion};
use crate::session::Session;
use crate::tensor::{shape_matches, TensorValue};
use crate::training::FeedsFetchesManager;

use super::cache::ValueCache;
use super::cancel::CancellationToken;
use super::fetch::store_fetches;
use super::trace::{format_step_line, format_trace_timing, RunStats, TraceEvent, TraceEventKind};

type ValueTable = HashMap<ValueId, Arc<TensorValue>>;

/// Inputs of one partial run.
pub(crate) struct RunRequest<'a> {
    pub region: &'a ProgramRegion,
    pub manager: &'a FeedsFetchesManager,
    pub feeds: &'a [TensorValue],
    pub fetches: &'a mut Vec<TensorValue>,
    pub cache: Option<&'a ValueCache>,
    pub token: &'a CancellationToken,
}

/// State shared between the launching thread and the stream jobs of a run.
struct RunShared {
    graph: Arc<Graph>,
    kernels: Arc<KernelRegistry>,
    pool: Option<Arc<ThreadPool>>,
    live: Arc<Mutex<ValueTable>>,
    trace: Option<Arc<Mutex<Vec<TraceEvent>>>>,
    token: CancellationToken,
    failed: AtomicBool,
    cancel_observed: AtomicBool,
    first_error: Mutex<Option<Error>>,
    executed: AtomicUsize,
    skipped: AtomicUsize,
}

impl RunShared {
    fn fail(&self, err: Error) {
        crate::error!("run.fail {}", err);
        let mut slot = self.first_error.lock().expect("run status mutex poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    fn record(&self, event: TraceEvent) {
        if let Some(trace) = &self.trace {
            crate::trace!("{}", format_step_line(&event));
            trace.lock().expect("trace mutex poisoned").push(event);
        }
    }

    /// Stream job body for one node.
    fn execute(&self, index: usize, stream: usize) {
        let node = self.graph.node(index);
        let cancelled = self.token.is_cancelled();
        if cancelled || self.failed.load(Ordering::SeqCst) {
            if cancelled {
                self.cancel_observed.store(true, Ordering::SeqCst);
            }
            self.skipped.fetch_add(1, Ordering::SeqCst);
            self.record(TraceEvent {
                kind: TraceEventKind::Skipped,
                node_index: Some(index),
                node_uuid: Some(node.uuid),
                stream: Some(stream),
                node_desc: describe_node(&self.graph, node),
                value: None,
                micros: String::new(),
                micros_parts: [0, 0, 0],
            });
            return;
        }
        let started = Instant::now();
        match self.run_kernel(node) {
            Ok(outputs) => {
                let elapsed = started.elapsed();
                {
                    let mut live = self.live.lock().expect("live values mutex poisoned");
                    for (id, value) in node.outputs.iter().zip(outputs) {
                        live.insert(*id, Arc::new(value));
                    }
                }
                self.executed.fetch_add(1, Ordering::SeqCst);
                let (micros, micros_parts) = format_trace_timing(elapsed);
                self.record(TraceEvent {
                    kind: TraceEventKind::OpExecute,
                    node_index: Some(index),
                    node_uuid: Some(node.uuid),
                    stream: Some(stream),
                    node_desc: describe_node(&self.graph, node),
                    value: None,
                    micros,
                    micros_parts,
                });
            }
            Err(err) => self.fail(err),
        }
    }

    fn run_kernel(&self, node: &Node) -> Result<Vec<TensorValue>> {
        let inputs = {
            let live = self.live.lock().expect("live values mutex poisoned");
            node.inputs
                .iter()
                .map(|id| {
                    live.get(id)
                        .or_else(|| self.graph.initializer(*id))
                        .cloned()
                        .ok_or_else(|| {
                            Error::Internal(anyhow!(
                                "value {} missing when node {} ran",
                                self.graph.value_name(*id),
                                node.name
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?
        };
        let refs = inputs.iter().map(|value| value.as_ref()).collect::<Vec<_>>();
        let kernel = self.kernels.lookup(&node.op).ok_or_else(|| {
            Error::invalid(format!("no kernel registered for op {}", node.op))
        })?;
        let call = || panic::catch_unwind(AssertUnwindSafe(|| kernel(&node.attrs, &refs)));
        let outcome = match &self.pool {
            Some(pool) => pool.install(call),
            None => call(),
        };
        let outputs = match outcome {
            Ok(Ok(outputs)) => outputs,
            Ok(Err(err)) => return Err(Error::from_kernel(&node.name, node.op.as_str(), err)),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|msg| msg.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                return Err(Error::KernelFailure {
                    node: node.name.clone(),
                    op: node.op.to_string(),
                    cause: anyhow!("kernel panicked: {}", message),
                });
            }
        };
        if outputs.len() != node.outputs.len() {
            return Err(Error::KernelFailure {
                node: node.name.clone(),
                op: node.op.to_string(),
                cause: anyhow!(
                    "kernel produced {} outputs, node declares {}",
                    outputs.len(),
                    node.outputs.len()
                ),
            });
        }
        Ok(outputs)
    }
}

/// Scheduler owned by one execution state and reused for all its runs.
pub struct ExecutionContext {
    id: Uuid,
    session_id: Uuid,
    graph: Arc<Graph>,
    plan: Arc<ExecutionPlan>,
    streams: Arc<DeviceStreamCollection>,
    kernels: Arc<KernelRegistry>,
    pool: Option<Arc<ThreadPool>>,
    trace_enabled: bool,
    live: Arc<Mutex<ValueTable>>,
    cursors: Vec<usize>,
    /// `waited[consumer][producer]`: one past the highest producer-stream
    /// program counter the consumer stream already waits on.
    waited: Vec<Vec<usize>>,
    events: Vec<Option<StreamEvent>>,
    trace: Arc<Mutex<Vec<TraceEvent>>>,
    stats: RunStats,
    runs: usize,
}

impl ExecutionContext {
    pub(crate) fn new(session: &Session) -> Self {
        let stream_count = session.streams().len();
        let id = Uuid::new_v4();
        crate::trace!("context.create id={} session={}", id, session.id());
        Self {
            id,
            session_id: session.id(),
            graph: session.graph().clone(),
            plan: session.plan().clone(),
            streams: session.streams().clone(),
            kernels: session.kernels().clone(),
            pool: session.intra_op_pool().cloned(),
            trace_enabled: session.trace_enabled(),
            live: Arc::new(Mutex::new(HashMap::new())),
            cursors: vec![0; stream_count],
            waited: vec![vec![0; stream_count]; stream_count],
            events: Vec::new(),
            trace: Arc::new(Mutex::new(Vec::new())),
            stats: RunStats::default(),
            runs: 0,
        }
    }

    /// Stable identity across every run of the owning state.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Number of runs started on this context.
    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Trace of the most recent run; empty unless the session traces.
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.trace.lock().expect("trace mutex poisoned").clone()
    }

    /// Names of the values still resident, sorted.
    pub fn live_values(&self) -> Vec<String> {
        let live = self.live.lock().expect("live values mutex poisoned");
        let mut names = live
            .keys()
            .map(|id| self.graph.value_name(*id).to_string())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn live_value(&self, name: &str) -> Option<Arc<TensorValue>> {
        let id = self.graph.value_id(name)?;
        self.live
            .lock()
            .expect("live values mutex poisoned")
            .get(&id)
            .cloned()
    }

    /// Rewind cursors and sync bookkeeping to the start of `region`.
    fn reset(&mut self, region: &ProgramRegion) {
        for (cursor, (start, _)) in self.cursors.iter_mut().zip(region.stream_pc_range.iter()) {
            *cursor = *start;
        }
        for row in self.waited.iter_mut() {
            row.iter_mut().for_each(|pc| *pc = 0);
        }
        self.events.clear();
        self.events.resize(region.node_end - region.node_start, None);
        self.trace.lock().expect("trace mutex poisoned").clear();
        self.stats = RunStats {
            node_start: region.node_start,
            node_end: region.node_end,
            ..RunStats::default()
        };
    }

    fn record(&self, event: TraceEvent) {
        if self.trace_enabled {
            crate::trace!("{}", format_step_line(&event));
            self.trace.lock().expect("trace mutex poisoned").push(event);
        }
    }

    pub(crate) fn run(&mut self, request: RunRequest<'_>) -> Result<()> {
        let RunRequest {
            region,
            manager,
            feeds,
            fetches,
            cache,
            token,
        } = request;
        let (start, end) = (region.node_start, region.node_end);
        self.runs += 1;
        self.reset(region);
        crate::trace!(
            "context.run id={} range=[{}, {}) feeds={} fetches={} cache={}",
            self.id,
            start,
            end,
            feeds.len(),
            manager.fetch_ids().len(),
            cache.is_some()
        );
        if start == 0 {
            self.live.lock().expect("live values mutex poisoned").clear();
        }

        let cache_reads = self.validate(start, end, manager, feeds, cache)?;
        self.stats.cache_reads = cache_reads.len();
        for (id, _) in &cache_reads {
            let name = self.graph.value_name(*id);
            self.record(TraceEvent::value_event(
                TraceEventKind::CacheRead,
                name,
                self.graph.producer(*id),
                format!("CacheRead {}", name),
            ));
        }

        {
            let mut live = self.live.lock().expect("live values mutex poisoned");
            for (id, value) in manager.feed_ids().iter().zip(feeds.iter()) {
                let value = value
                    .try_clone()
                    .map_err(|err| Error::allocation(format!("{:#}", err)))?;
                live.insert(*id, Arc::new(value));
            }
            for (id, value) in cache_reads {
                live.insert(id, value);
            }
        }

        let shared = Arc::new(RunShared {
            graph: self.graph.clone(),
            kernels: self.kernels.clone(),
            pool: self.pool.clone(),
            live: self.live.clone(),
            trace: self.trace_enabled.then(|| self.trace.clone()),
            token: token.clone(),
            failed: AtomicBool::new(false),
            cancel_observed: AtomicBool::new(false),
            first_error: Mutex::new(None),
            executed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        });

        self.launch_region(region, &shared);

        if let Err(err) = self.streams.synchronize_all() {
            shared.fail(Error::Internal(err));
        }
        self.stats.kernels_executed = shared.executed.load(Ordering::SeqCst);
        self.stats.kernels_skipped = shared.skipped.load(Ordering::SeqCst);

        if let Some(err) = shared
            .first_error
            .lock()
            .expect("run status mutex poisoned")
            .take()
        {
            return Err(err);
        }
        if shared.cancel_observed.load(Ordering::SeqCst) {
            crate::warning!("context.cancelled id={} range=[{}, {})", self.id, start, end);
            return Err(Error::Cancelled);
        }

        self.settle(start, end, manager, fetches, cache)
    }

    /// Pre-launch checks. Returns the values to read back from the cache.
    fn validate(
        &self,
        start: usize,
        end: usize,
        manager: &FeedsFetchesManager,
        feeds: &[TensorValue],
        cache: Option<&ValueCache>,
    ) -> Result<Vec<(ValueId, Arc<TensorValue>)>> {
        let graph = &self.graph;
        if feeds.len() != manager.feed_ids().len() {
            return Err(Error::invalid(format!(
                "expected {} feeds, got {}",
                manager.feed_ids().len(),
                feeds.len()
            )));
        }
        for (id, value) in manager.feed_ids().iter().zip(feeds.iter()) {
            let info = graph.value(*id);
            if let Some(dtype) = info.dtype {
                if dtype != value.dtype() {
                    return Err(Error::invalid(format!(
                        "feed {} expects {:?}, got {:?}",
                        info.name,
                        dtype,
                        value.dtype()
                    )));
                }
            }
            if let Some(shape) = &info.shape {
                if !shape_matches(shape, value.shape()) {
                    return Err(Error::invalid(format!(
                        "feed {} expects shape {:?}, got {:?}",
                        info.name,
                        shape,
                        value.shape()
                    )));
                }
            }
        }

        let fed = manager.feed_ids().iter().copied().collect::<HashSet<_>>();
        let live = self.live.lock().expect("live values mutex poisoned");
        let mut available = fed.clone();
        available.extend(live.keys().copied());
        let mut reads = Vec::new();
        let mut recover = |id: ValueId, available: &mut HashSet<ValueId>| -> bool {
            if available.contains(&id) || graph.is_initializer(id) {
                return true;
            }
            let Some(value) = cache.and_then(|cache| cache.get(graph.value_name(id))) else {
                return false;
            };
            available.insert(id);
            reads.push((id, value));
            true
        };

        for index in start..end {
            let node = graph.node(index);
            if node.op.is_yield() {
                if let Some(id) = node.outputs.iter().find(|id| !available.contains(id)) {
                    return Err(Error::invalid(format!(
                        "yield output {} of node {} must be fed",
                        graph.value_name(*id),
                        node.name
                    )));
                }
                continue;
            }
            if !self.kernels.contains(&node.op) {
                return Err(Error::invalid(format!(
                    "no kernel registered for op {} (node {})",
                    node.op, node.name
                )));
            }
            for id in &node.inputs {
                if !recover(*id, &mut available) {
                    return Err(Error::invalid(format!(
                        "input {} of node {} is not available in [{}, {})",
                        graph.value_name(*id),
                        node.name,
                        start,
                        end
                    )));
                }
            }
            available.extend(node.outputs.iter().copied());
        }

        for id in manager.fetch_ids() {
            match graph.producer(*id) {
                _ if fed.contains(id) || graph.is_initializer(*id) => {}
                Some(producer) if producer >= end => {
                    return Err(Error::invalid(format!(
                        "fetch {} is produced by node {}, outside the executed range [{}, {})",
                        graph.value_name(*id),
                        producer,
                        start,
                        end
                    )));
                }
                Some(producer) if producer >= start => {}
                _ => {
                    if !recover(*id, &mut available) {
                        return Err(Error::invalid(format!(
                            "fetch {} is not available in [{}, {})",
                            graph.value_name(*id),
                            start,
                            end
                        )));
                    }
                }
            }
        }
        drop(live);
        Ok(reads)
    }

    fn launch_region(&mut self, region: &ProgramRegion, shared: &Arc<RunShared>) {
        let stream_count = self.cursors.len();
        loop {
            if shared.token.is_cancelled() {
                shared.cancel_observed.store(true, Ordering::SeqCst);
                crate::trace!("context.cancel observed before launch id={}", self.id);
                break;
            }
            if shared.failed.load(Ordering::SeqCst) {
                break;
            }
            let next = (0..stream_count)
                .filter(|stream| self.cursors[*stream] < region.stream_pc_range[*stream].1)
                .map(|stream| (self.plan.program(stream)[self.cursors[stream]], stream))
                .min();
            let Some((index, stream)) = next else {
                break;
            };
            self.cursors[stream] += 1;
            if let Err(err) = self.launch(index, stream, region.node_start, shared) {
                shared.fail(err);
                break;
            }
        }
    }

    fn launch(
        &mut self,
        index: usize,
        stream: usize,
        start: usize,
        shared: &Arc<RunShared>,
    ) -> Result<()> {
        let node = self.graph.node(index);
        if node.op.is_yield() {
            self.record(TraceEvent {
                kind: TraceEventKind::Yield,
                node_index: Some(index),
                node_uuid: Some(node.uuid),
                stream: Some(stream),
                node_desc: describe_node(&self.graph, node),
                value: None,
                micros: String::new(),
                micros_parts: [0, 0, 0],
            });
            return Ok(());
        }
        let device_stream = self
            .streams
            .stream(stream)
            .ok_or_else(|| Error::Internal(anyhow!("plan references missing stream {}", stream)))?;

        for wait in self.plan.waits(index) {
            if wait.node < start || wait.pc < self.waited[stream][wait.stream] {
                continue;
            }
            let Some(event) = &self.events[wait.node - start] else {
                continue;
            };
            device_stream.wait_event(event)?;
            self.waited[stream][wait.stream] = wait.pc + 1;
            self.stats.cross_stream_waits += 1;
            self.record(TraceEvent {
                kind: TraceEventKind::Wait,
                node_index: Some(index),
                node_uuid: Some(node.uuid),
                stream: Some(stream),
                node_desc: format!(
                    "stream {} waits for node {} on stream {}",
                    stream, wait.node, wait.stream
                ),
                value: None,
                micros: String::new(),
                micros_parts: [0, 0, 0],
            });
        }

        let job_shared = shared.clone();
        device_stream.launch(Box::new(move || job_shared.execute(index, stream)))?;
        let event = StreamEvent::new();
        device_stream.record_event(&event)?;
        self.events[index - start] = Some(event);
        self.stats.nodes_launched += 1;
        Ok(())
    }

    /// Boundary handling after a successful drain.
    fn settle(
        &mut self,
        start: usize,
        end: usize,
        manager: &FeedsFetchesManager,
        fetches: &mut Vec<TensorValue>,
        cache: Option<&ValueCache>,
    ) -> Result<()> {
        let graph = self.graph.clone();
        let fetched = {
            let live = self.live.lock().expect("live values mutex poisoned");
            manager
                .fetch_ids()
                .iter()
                .map(|id| {
                    live.get(id)
                        .or_else(|| graph.initializer(*id))
                        .cloned()
                        .ok_or_else(|| {
                            Error::Internal(anyhow!(
                                "fetch {} missing after run",
                                graph.value_name(*id)
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?
        };

        let mut events = Vec::new();
        {
            let mut live = self.live.lock().expect("live values mutex poisoned");
            let before = live.len();
            // every retained value, graph outputs included, is recoverable by name
            live.retain(|id, value| {
                let keep = graph.consumed_at_or_after(*id, end) || graph.is_output(*id);
                match (keep, cache) {
                    (true, Some(cache)) => {
                        cache.insert(graph.value_name(*id), value.clone());
                        events.push((TraceEventKind::CacheWrite, *id));
                    }
                    (true, None) => {}
                    (false, _) => events.push((TraceEventKind::Release, *id)),
                }
                keep
            });
            self.stats.values_retained = live.len();
            self.stats.values_released = before - live.len();
        }
        for (kind, id) in events {
            if kind == TraceEventKind::CacheWrite {
                self.stats.cache_writes += 1;
            }
            let name = graph.value_name(id);
            self.record(TraceEvent::value_event(
                kind,
                name,
                graph.producer(id),
                format!("{} {}", kind, name),
            ));
        }

        let values = fetched.iter().map(|value| value.as_ref()).collect::<Vec<_>>();
        store_fetches(
            fetches,
            &values,
            &manager.fetch_allocators(),
            manager.fetch_devices(),
        )?;
        for ((id, device), name) in manager
            .fetch_ids()
            .iter()
            .zip(manager.fetch_devices())
            .zip(manager.fetch_names())
        {
            if !device.is_host() {
                self.record(TraceEvent::value_event(
                    TraceEventKind::Transfer,
                    name,
                    graph.producer(*id),
                    format!("transfer {} to {}", name, device),
                ));
            }
        }
        self.stats.fetches_materialized = values.len();
        crate::trace!(
            "context.done id={} range=[{}, {}) launched={} retained={} released={} cached={}",
            self.id,
            start,
            end,
            self.stats.nodes_launched,
            self.stats.values_retained,
            self.stats.values_released,
            self.stats.cache_writes
        );
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("runs", &self.runs)
            .field("stats", &self.stats)
            .finish()
    }
}
