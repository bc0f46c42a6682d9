//! Parallel state-space search.
//!
//! Each worker runs a [`Weaver`] over [`SearchTask`]s with three machines:
//!
//! - the expander turns `Start` into the initial edges and `Expand(s)` into
//!   the outgoing edges of `s`, using the worker's own builder;
//! - the dedup machine replaces every edge target by its canonical copy from
//!   the shared store and marks whether it was new;
//! - the observer reports edges and new states to the listener and decides,
//!   from its verdicts, which states to expand.
//!
//! Only the `Expand` queue is shared between workers; its shape sets the
//! search order. Every other task stays on the worker that created it.

use crate::builder::Builder;
use crate::config::{Order, ProgressCounters, SearchConfig};
use crate::error::{EngineError, EngineResult};
use crate::listener::{Action, Listener};
use crate::state::{Label, State, StateKey};
use crate::store::DedupStore;
use crate::weaver::{Control, Flow, Halt, Machine, Outbox, Queue, Task, Weaver};
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use expanse_heap::SkipSet;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub const EDGE: usize = 0;
pub const DEADLOCK: usize = 1;
pub const START: usize = 2;
pub const EXPAND: usize = 3;

/// An edge on its way from the builder to the listener.
#[derive(Debug, Clone)]
pub struct EdgeTask {
    /// `None` for the edges into initial states.
    pub from: Option<State>,
    pub to: State,
    pub label: Label,
    /// Set by the dedup machine.
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub enum SearchTask {
    Start,
    Expand(State),
    Edge(EdgeTask),
    Deadlock(State),
}

impl Task for SearchTask {
    const KINDS: usize = 4;

    #[inline]
    fn kind(&self) -> usize {
        match self {
            SearchTask::Edge(_) => EDGE,
            SearchTask::Deadlock(_) => DEADLOCK,
            SearchTask::Start => START,
            SearchTask::Expand(_) => EXPAND,
        }
    }
}

/// Expansion bookkeeping for states whose fate is not settled yet.
///
/// A state enters the ledger as `InFlight` when the store adds it and
/// leaves it once it is expanded or will never be. Only the states still
/// waiting for demand stay behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Demand {
    /// Added to the store; the discovering worker has not settled it yet.
    InFlight,
    /// Edges arrived before the discovering worker settled the state.
    /// `process` is set if one of them asked for expansion.
    Requested { process: bool },
    /// Reached through an ignored edge. The listener has not seen it yet.
    Hidden,
    /// Waiting for an edge that asks for it.
    Deferred,
}

/// What a revisiting edge must do about its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Nothing,
    /// The target was deferred and this edge asks for it.
    Expand,
    /// The target was hidden; this edge is the first the listener sees.
    Reveal,
}

/// Everything the workers of one run share.
struct EngineContext {
    store: DedupStore,
    control: Control,
    demand: DashMap<StateKey, Demand>,
    expanded: AtomicUsize,
    edges: AtomicUsize,
    first_error: Mutex<Option<EngineError>>,
    progress: Option<Arc<ProgressCounters>>,
    check_deadlock: bool,
}

impl EngineContext {
    fn new(store: DedupStore, config: &SearchConfig) -> Self {
        Self {
            store,
            control: Control::new(config.stop_flag.clone()),
            demand: DashMap::new(),
            expanded: AtomicUsize::new(0),
            edges: AtomicUsize::new(0),
            first_error: Mutex::new(None),
            progress: config.progress.clone(),
            check_deadlock: config.check_deadlock,
        }
    }

    fn fail(&self, e: EngineError) {
        self.control.terminate();
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            error!(error = %e, "search aborted");
            *slot = Some(e);
        }
    }

    /// The state's fate is decided; later edges need not track it.
    fn settled(&self, state: &State) {
        self.demand.remove(&state.key());
    }

    /// A new state was deferred. Returns true if an edge already asked for
    /// it, in which case the caller must expand it now.
    fn defer(&self, state: &State) -> bool {
        match self.demand.entry(state.key()) {
            Entry::Occupied(e) if *e.get() == Demand::Requested { process: true } => {
                e.remove();
                true
            }
            Entry::Occupied(mut e) => {
                e.insert(Demand::Deferred);
                false
            }
            Entry::Vacant(e) => {
                e.insert(Demand::Deferred);
                false
            }
        }
    }

    /// The edge that discovered `state` was ignored. Returns the verdict of
    /// an edge that reached it meanwhile, if any; the caller must then
    /// settle the state on that edge's behalf.
    fn hide(&self, state: &State) -> Option<Action> {
        match self.demand.entry(state.key()) {
            Entry::Occupied(mut e) => match *e.get() {
                Demand::Requested { process } => {
                    Some(if process { Action::Process } else { Action::AsNeeded })
                }
                _ => {
                    e.insert(Demand::Hidden);
                    None
                }
            },
            Entry::Vacant(e) => {
                e.insert(Demand::Hidden);
                None
            }
        }
    }

    /// A followed edge reached a known state. A state missing from the
    /// ledger is settled, and stays settled.
    fn request(&self, state: &State, verdict: Action) -> Wake {
        let key = state.key();
        if !self.demand.contains_key(&key) {
            return Wake::Nothing;
        }
        let process = verdict == Action::Process;
        match self.demand.entry(key) {
            Entry::Vacant(_) => Wake::Nothing,
            Entry::Occupied(mut e) => match *e.get() {
                Demand::InFlight => {
                    e.insert(Demand::Requested { process });
                    Wake::Nothing
                }
                Demand::Requested { process: false } if process => {
                    e.insert(Demand::Requested { process: true });
                    Wake::Nothing
                }
                Demand::Hidden => {
                    e.insert(Demand::InFlight);
                    Wake::Reveal
                }
                Demand::Deferred if process => {
                    e.remove();
                    Wake::Expand
                }
                _ => Wake::Nothing,
            },
        }
    }
}

/// Generates edges with the worker's builder.
struct Expander<'a, B> {
    builder: B,
    ctx: &'a EngineContext,
}

impl<B: Builder> Machine<SearchTask> for Expander<'_, B> {
    fn interests(&self) -> &'static [usize] {
        &[START, EXPAND]
    }

    fn run(&mut self, task: &mut SearchTask, out: &mut Outbox<SearchTask>) -> EngineResult<Flow> {
        match task {
            SearchTask::Start => {
                let mut count = 0usize;
                self.builder.initials(|to, label| {
                    count += 1;
                    out.push(SearchTask::Edge(EdgeTask {
                        from: None,
                        to,
                        label,
                        is_new: false,
                    }));
                })?;
                if count == 0 {
                    return Err(EngineError::NoInitialStates);
                }
                info!(count, "generated initial states");
            }
            SearchTask::Expand(from) => {
                let from: &State = from;
                let mut count = 0usize;
                self.builder.edges(from, |to, label| {
                    count += 1;
                    out.push(SearchTask::Edge(EdgeTask {
                        from: Some(from.clone()),
                        to,
                        label,
                        is_new: false,
                    }));
                })?;
                let n = self.ctx.expanded.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(progress) = &self.ctx.progress {
                    progress.expanded.store(n, Ordering::Relaxed);
                }
                if count == 0 && self.ctx.check_deadlock {
                    let mut sink = from.clone();
                    sink.flags.deadlock = true;
                    out.push(SearchTask::Deadlock(sink));
                }
            }
            _ => return Ok(Flow::Continue),
        }
        Ok(Flow::Handled)
    }
}

/// Canonicalizes edge targets through the shared store.
struct Dedup<'a> {
    ctx: &'a EngineContext,
}

impl Machine<SearchTask> for Dedup<'_> {
    fn interests(&self) -> &'static [usize] {
        &[EDGE]
    }

    fn run(&mut self, task: &mut SearchTask, _out: &mut Outbox<SearchTask>) -> EngineResult<Flow> {
        if let SearchTask::Edge(edge) = task {
            let demand = &self.ctx.demand;
            let (canonical, is_new) = self
                .ctx
                .store
                .insert_or_get_with(edge.to.clone(), |added| {
                    demand.insert(added.key(), Demand::InFlight);
                })?;
            edge.to = canonical;
            edge.is_new = is_new;
            if edge.from.is_some() {
                let n = self.ctx.edges.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(progress) = &self.ctx.progress {
                    progress.edges.store(n, Ordering::Relaxed);
                }
            }
        }
        Ok(Flow::Continue)
    }
}

/// Feeds the listener and schedules expansions.
struct Observer<'a, L> {
    listener: &'a L,
    ctx: &'a EngineContext,
}

impl<L: Listener> Observer<'_, L> {
    /// Ask the listener about a state it has not seen before and schedule
    /// its expansion. `verdict` is that of the edge the state is seen
    /// through. Error states are reported but never expanded.
    fn settle(&self, state: &State, verdict: Action, out: &mut Outbox<SearchTask>) -> Flow {
        let expand = match self.listener.state(state) {
            Action::Terminate => return Flow::Terminate,
            _ if state.is_error() => false,
            Action::Ignore => false,
            Action::Process => true,
            Action::AsNeeded if verdict == Action::Process => true,
            Action::AsNeeded => {
                if self.ctx.defer(state) {
                    out.push(SearchTask::Expand(state.clone()));
                }
                return Flow::Handled;
            }
        };
        self.ctx.settled(state);
        if expand {
            out.push(SearchTask::Expand(state.clone()));
        }
        Flow::Handled
    }

    fn on_edge(&self, edge: &EdgeTask, out: &mut Outbox<SearchTask>) -> Flow {
        let verdict = match &edge.from {
            Some(from) => self.listener.edge(from, &edge.to, &edge.label, edge.is_new),
            None => self.listener.initial(&edge.to, &edge.label, edge.is_new),
        };
        match (verdict, edge.is_new) {
            (Action::Terminate, _) => Flow::Terminate,
            (Action::Ignore, true) => match self.ctx.hide(&edge.to) {
                Some(waiting) => self.settle(&edge.to, waiting, out),
                None => Flow::Handled,
            },
            (Action::Ignore, false) => Flow::Handled,
            (_, true) => self.settle(&edge.to, verdict, out),
            (_, false) => {
                match self.ctx.request(&edge.to, verdict) {
                    Wake::Expand => out.push(SearchTask::Expand(edge.to.clone())),
                    Wake::Reveal => return self.settle(&edge.to, verdict, out),
                    Wake::Nothing => {}
                }
                Flow::Handled
            }
        }
    }
}

impl<L: Listener> Machine<SearchTask> for Observer<'_, L> {
    fn interests(&self) -> &'static [usize] {
        &[EDGE, DEADLOCK]
    }

    fn run(&mut self, task: &mut SearchTask, out: &mut Outbox<SearchTask>) -> EngineResult<Flow> {
        Ok(match task {
            SearchTask::Edge(edge) => self.on_edge(edge, out),
            SearchTask::Deadlock(state) => match self.listener.deadlocked(state) {
                Action::Terminate => Flow::Terminate,
                _ => Flow::Handled,
            },
            _ => Flow::Continue,
        })
    }
}

/// Shared FIFO frontier. New tasks are batched locally and handed over
/// every `flush_every` pushes.
struct SharedFifo<'a, T> {
    global: &'a Injector<T>,
    batch: Vec<T>,
    flush_every: usize,
}

impl<T: Send> Queue<T> for SharedFifo<'_, T> {
    fn push(&mut self, task: T) {
        self.batch.push(task);
        if self.batch.len() >= self.flush_every {
            self.flush();
        }
    }

    fn pop(&mut self) -> Option<T> {
        loop {
            match self.global.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn flush(&mut self) {
        for task in self.batch.drain(..) {
            self.global.push(task);
        }
    }
}

/// Per-worker frontier with stealing from the other workers when empty.
struct Stealing<'a, T> {
    local: Worker<T>,
    global: &'a Injector<T>,
    stealers: &'a [Stealer<T>],
    index: usize,
}

impl<T: Send> Queue<T> for Stealing<'_, T> {
    fn push(&mut self, task: T) {
        self.local.push(task);
    }

    fn pop(&mut self) -> Option<T> {
        if let Some(task) = self.local.pop() {
            return Some(task);
        }
        loop {
            let attempt = self.global.steal_batch_and_pop(&self.local).or_else(|| {
                self.stealers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != self.index)
                    .map(|(_, s)| s.steal())
                    .collect()
            });
            match attempt {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }
}

/// Summary of a finished run.
#[derive(Debug)]
pub struct SearchReport {
    /// Distinct states stored.
    pub states: usize,
    /// Edges between states, not counting those into initial states.
    pub edges: usize,
    pub expanded: usize,
    /// States left unexpanded because no edge asked for them.
    pub waiting: usize,
    pub halt: Halt,
    pub workers: usize,
    pub elapsed: Duration,
    /// The visited states.
    pub store: DedupStore,
}

/// A configured search over one builder, reporting to one listener.
pub struct Search<B, L> {
    builder: B,
    listener: L,
    config: SearchConfig,
}

impl<B: Builder, L: Listener> Search<B, L> {
    pub fn new(builder: B, listener: L, config: SearchConfig) -> Self {
        Self {
            builder,
            listener,
            config,
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn run(&self) -> EngineResult<SearchReport> {
        let config = &self.config;
        let workers = if config.workers == 0 {
            rayon::current_num_threads()
        } else {
            config.workers
        };
        let skip: SkipSet = self
            .builder
            .skip_ids()
            .iter()
            .chain(config.skip_ids.iter().copied())
            .collect();

        let ctx = EngineContext::new(DedupStore::with_capacity(skip, config.table_capacity), config);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("expanse-worker-{i}"))
            .build()?;

        let injector = Injector::new();
        let locals: Vec<Worker<SearchTask>> = (0..workers)
            .map(|_| match config.order {
                Order::Dfs => Worker::new_lifo(),
                Order::Bfs | Order::PseudoBfs => Worker::new_fifo(),
            })
            .collect();
        let stealers: Vec<Stealer<SearchTask>> = locals.iter().map(Worker::stealer).collect();

        ctx.control.announce(1);
        injector.push(SearchTask::Start);

        let mut jobs = Vec::with_capacity(workers);
        for (index, local) in locals.into_iter().enumerate() {
            let frontier: Box<dyn Queue<SearchTask> + '_> = match config.order {
                Order::Bfs => Box::new(SharedFifo {
                    global: &injector,
                    batch: Vec::new(),
                    flush_every: config.flush_every.max(1),
                }),
                Order::PseudoBfs | Order::Dfs => Box::new(Stealing {
                    local,
                    global: &injector,
                    stealers: &stealers,
                    index,
                }),
            };
            jobs.push((index, self.builder.clone(), frontier));
        }

        info!(workers, order = %config.order, "starting search");
        let started = Instant::now();
        let halts = Mutex::new(Vec::with_capacity(workers));
        let (ctx_ref, listener, halts_ref) = (&ctx, &self.listener, &halts);

        pool.scope(move |scope| {
            for (index, builder, frontier) in jobs {
                scope.spawn(move |_| {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        run_worker(index, builder, frontier, ctx_ref, listener)
                    }));
                    match result {
                        Ok(Ok(halt)) => halts_ref.lock().push(halt),
                        Ok(Err(e)) => ctx_ref.fail(e),
                        Err(_) => ctx_ref.fail(EngineError::WorkerPanicked),
                    }
                });
            }
        });

        let elapsed = started.elapsed();
        let EngineContext {
            store,
            demand,
            expanded,
            edges,
            first_error,
            ..
        } = ctx;
        if let Some(e) = first_error.into_inner() {
            return Err(e);
        }

        let halts = halts.into_inner();
        let halt = if halts.contains(&Halt::Terminated) {
            Halt::Terminated
        } else if halts.contains(&Halt::Cancelled) {
            Halt::Cancelled
        } else {
            Halt::Quiescent
        };

        let report = SearchReport {
            states: store.len(),
            edges: edges.into_inner(),
            expanded: expanded.into_inner(),
            waiting: demand.len(),
            halt,
            workers,
            elapsed,
            store,
        };
        info!(
            states = report.states,
            edges = report.edges,
            expanded = report.expanded,
            waiting = report.waiting,
            ?halt,
            elapsed_ms = elapsed.as_millis() as u64,
            "search finished"
        );
        Ok(report)
    }
}

fn run_worker<'a, B: Builder + 'a, L: Listener>(
    index: usize,
    builder: B,
    frontier: Box<dyn Queue<SearchTask> + 'a>,
    ctx: &'a EngineContext,
    listener: &'a L,
) -> EngineResult<Halt> {
    let mut weaver = Weaver::new(&ctx.control)
        .with_queue(EXPAND, frontier)
        .with_machine(Box::new(Expander { builder, ctx }))
        .with_machine(Box::new(Dedup { ctx }))
        .with_machine(Box::new(Observer { listener, ctx }));
    let halt = weaver.run()?;
    debug!(worker = index, handled = weaver.handled(), ?halt, "worker finished");
    Ok(halt)
}
