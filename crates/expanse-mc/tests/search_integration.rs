//! End-to-end search runs over generated graphs.

use dashmap::DashMap;
use expanse_heap::{HeapError, Pool, SkipSet};
use expanse_mc::{
    replay, vertex_of, Action, Builder, EngineError, EngineResult, ExplicitGraph, GraphBuilder,
    Halt, Label, Listener, Order, Search, SearchConfig, State, Statistics, Trace, TraceRecorder,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const ORDERS: [Order; 3] = [Order::Bfs, Order::PseudoBfs, Order::Dfs];

fn config(order: Order, workers: usize) -> SearchConfig {
    SearchConfig {
        workers,
        order,
        check_deadlock: false,
        ..SearchConfig::default()
    }
}

/// Counts how often each vertex is expanded.
#[derive(Clone)]
struct Counting {
    inner: GraphBuilder,
    expansions: Arc<DashMap<u32, usize>>,
}

impl Counting {
    fn new(graph: ExplicitGraph) -> Self {
        Self {
            inner: GraphBuilder::new(graph),
            expansions: Arc::new(DashMap::new()),
        }
    }
}

impl Builder for Counting {
    fn initials<Y: FnMut(State, Label)>(&mut self, yield_: Y) -> EngineResult<()> {
        self.inner.initials(yield_)
    }

    fn edges<Y: FnMut(State, Label)>(&mut self, from: &State, yield_: Y) -> EngineResult<()> {
        if let Some(v) = vertex_of(from) {
            *self.expansions.entry(v).or_insert(0) += 1;
        }
        self.inner.edges(from, yield_)
    }

    fn skip_ids(&self) -> SkipSet {
        self.inner.skip_ids()
    }
}

#[test]
fn same_state_space_for_every_order_and_worker_count() {
    for seed in 0..4 {
        let graph = ExplicitGraph::random(50, 120, seed);
        for order in ORDERS {
            for workers in [1, 8] {
                let stats = Statistics::new();
                let report = Search::new(GraphBuilder::new(graph.clone()), &stats, config(order, workers))
                    .run()
                    .unwrap();
                assert_eq!(report.halt, Halt::Quiescent, "{order} x{workers}");
                assert_eq!(report.states, 50, "{order} x{workers} seed {seed}");
                assert_eq!(report.edges, 120, "{order} x{workers} seed {seed}");
                assert_eq!(report.expanded, 50);
                assert_eq!(stats.stats().states, 50);

                let vertices: BTreeSet<u32> =
                    report.store.states().iter().filter_map(vertex_of).collect();
                assert_eq!(vertices, graph.vertices());
            }
        }
    }
}

#[test]
fn every_state_expanded_exactly_once() {
    let graph = ExplicitGraph::random(300, 1_500, 11);
    for order in ORDERS {
        let builder = Counting::new(graph.clone());
        let expansions = Arc::clone(&builder.expansions);
        let report = Search::new(builder, (), config(order, 8)).run().unwrap();
        assert_eq!(report.expanded, 300);
        assert_eq!(expansions.len(), 300);
        assert!(expansions.iter().all(|e| *e.value() == 1), "{order}");
    }
}

/// Defers every new state. Only edges taken by choice 1 ask for their
/// target.
struct Lazy;

impl Listener for Lazy {
    fn edge(&self, _from: &State, _to: &State, label: &Label, _is_new: bool) -> Action {
        if label.choices[0] == 1 {
            Action::Process
        } else {
            Action::AsNeeded
        }
    }

    fn state(&self, _state: &State) -> Action {
        Action::AsNeeded
    }
}

/// Vertices a [`Lazy`] search must expand: the initial ones, then every
/// target of a choice-1 edge out of an expanded vertex.
fn wanted(graph: &ExplicitGraph) -> BTreeSet<u32> {
    let mut wanted: BTreeSet<u32> = graph.initials().iter().copied().collect();
    loop {
        let more: Vec<u32> = wanted
            .iter()
            .filter_map(|&v| graph.successors(v).get(1).copied())
            .filter(|v| !wanted.contains(v))
            .collect();
        if more.is_empty() {
            return wanted;
        }
        wanted.extend(more);
    }
}

#[test]
fn deferred_states_expand_once_when_demanded() {
    for seed in 0..4 {
        let graph = ExplicitGraph::random(200, 800, seed);
        let expected = wanted(&graph);
        for order in ORDERS {
            let builder = Counting::new(graph.clone());
            let expansions = Arc::clone(&builder.expansions);
            let report = Search::new(builder, Lazy, config(order, 8)).run().unwrap();
            assert_eq!(report.expanded, expected.len(), "{order} seed {seed}");
            let got: BTreeSet<u32> = expansions.iter().map(|e| *e.key()).collect();
            assert_eq!(got, expected);
            assert!(expansions.iter().all(|e| *e.value() == 1));
        }
    }
}

/// Drops every edge into vertex `blocked`.
struct Block {
    blocked: u32,
}

impl Listener for Block {
    fn edge(&self, _from: &State, to: &State, _label: &Label, _is_new: bool) -> Action {
        if vertex_of(to) == Some(self.blocked) {
            Action::Ignore
        } else {
            Action::Process
        }
    }
}

#[test]
fn ignored_edges_cut_the_search() {
    let graph = ExplicitGraph::parse("init 1\n1 -> 2 3\n2 -> 4\n3 -> 5\n").unwrap();
    let builder = Counting::new(graph);
    let expansions = Arc::clone(&builder.expansions);
    let report = Search::new(builder, Block { blocked: 2 }, config(Order::Bfs, 2))
        .run()
        .unwrap();
    // 2 is stored but never expanded, so 4 is never reached.
    assert_eq!(report.states, 4);
    assert!(!expansions.contains_key(&2));
    assert!(!report.store.states().iter().any(|s| vertex_of(s) == Some(4)));
}

/// Drops the single edge `from -> to`.
struct BlockEdge {
    from: u32,
    to: u32,
}

impl Listener for BlockEdge {
    fn edge(&self, from: &State, to: &State, _label: &Label, _is_new: bool) -> Action {
        if vertex_of(from) == Some(self.from) && vertex_of(to) == Some(self.to) {
            Action::Ignore
        } else {
            Action::Process
        }
    }
}

#[test]
fn state_first_reached_by_an_ignored_edge_is_expanded_through_another() {
    // 1 -> 2 is ignored but 3 -> 2 is not, so 2 and then 4 are still explored.
    let graph = ExplicitGraph::parse("init 1\n1 -> 2 3\n3 -> 2\n2 -> 4\n").unwrap();
    for order in ORDERS {
        for workers in [1, 4] {
            let builder = Counting::new(graph.clone());
            let expansions = Arc::clone(&builder.expansions);
            let stats = Statistics::new();
            let listener = (BlockEdge { from: 1, to: 2 }, &stats);
            let report = Search::new(builder, listener, config(order, workers))
                .run()
                .unwrap();
            assert_eq!(report.states, 4, "{order} x{workers}");
            assert_eq!(report.expanded, 4);
            assert_eq!(stats.stats().states, 4);
            assert!(expansions.iter().all(|e| *e.value() == 1));
        }
    }
}

#[test]
fn bookkeeping_object_splits_or_merges_states() {
    let src = "init 1\n1 -> 2 3\n2 -> 3\n3 -> 4\n";
    let graph = ExplicitGraph::parse(src).unwrap();

    let split = GraphBuilder::new(graph.clone()).with_bookkeeping(false);
    let report = Search::new(split, (), config(Order::Bfs, 4)).run().unwrap();
    assert_eq!(report.states, 5);

    let merged = GraphBuilder::new(graph.clone()).with_bookkeeping(true);
    let report = Search::new(merged, (), config(Order::Bfs, 4)).run().unwrap();
    assert_eq!(report.states, 4);

    // The same effect through the configuration instead of the builder.
    let mut cfg = config(Order::Dfs, 4);
    cfg.skip_ids = vec![expanse_mc::graph::BOOKKEEPING];
    let plain = GraphBuilder::new(graph).with_bookkeeping(false);
    let report = Search::new(plain, (), cfg).run().unwrap();
    assert_eq!(report.states, 4);
}

#[test]
fn recorded_traces_replay_to_their_states() {
    let graph = ExplicitGraph::random(80, 240, 3);
    let recorder = TraceRecorder::new();
    let report = Search::new(GraphBuilder::new(graph.clone()), &recorder, config(Order::Dfs, 4))
        .run()
        .unwrap();
    assert_eq!(recorder.len(), report.states);

    let mut builder = GraphBuilder::new(graph);
    for state in report.store.states().iter().take(20) {
        let (trace, path) = recorder.trace_to(state).unwrap();
        let replayed = replay(&mut builder, &trace, &SkipSet::new()).unwrap();
        assert_eq!(replayed.len(), path.len());
        assert_eq!(vertex_of(replayed.last().unwrap()), vertex_of(state));

        let text = trace.to_string();
        assert_eq!(Trace::parse(&text).unwrap(), trace);
    }
}

/// Stops after a fixed number of new states.
struct Budget {
    left: AtomicUsize,
}

impl Listener for Budget {
    fn state(&self, _state: &State) -> Action {
        match self.left.fetch_sub(1, Ordering::Relaxed) {
            0 | 1 => Action::Terminate,
            _ => Action::Process,
        }
    }
}

#[test]
fn terminate_stops_all_workers() {
    let graph = ExplicitGraph::random(5_000, 20_000, 9);
    let budget = Budget {
        left: AtomicUsize::new(100),
    };
    let report = Search::new(GraphBuilder::new(graph), &budget, config(Order::Bfs, 8))
        .run()
        .unwrap();
    assert_eq!(report.halt, Halt::Terminated);
    assert!(report.states < 5_000);
}

#[test]
fn growing_from_a_tiny_table() {
    let graph = ExplicitGraph::random(2_000, 6_000, 4);
    let cfg = SearchConfig {
        table_capacity: 16,
        ..config(Order::PseudoBfs, 8)
    };
    let report = Search::new(GraphBuilder::new(graph), (), cfg).run().unwrap();
    assert_eq!(report.states, 2_000);
    assert!(report.store.capacity() >= 2_000);
}

#[test]
fn pool_images_released_with_the_search() {
    let pool = Arc::new(Pool::new());
    let graph = ExplicitGraph::random(500, 2_000, 6);
    let search = Search::new(
        GraphBuilder::with_pool(graph, Arc::clone(&pool)),
        (),
        config(Order::Dfs, 4),
    );
    let report = search.run().unwrap();
    pool.collect();
    // One vertex object per stored state.
    assert_eq!(pool.len(), report.states);
    drop(report);
    drop(search);
    pool.collect();
    assert!(pool.is_empty());
}

#[test]
fn heap_exhaustion_aborts_every_worker() {
    let pool = Arc::new(Pool::with_limit(400));
    let graph = ExplicitGraph::random(5_000, 20_000, 3);
    for order in ORDERS {
        let builder = GraphBuilder::with_pool(graph.clone(), Arc::clone(&pool));
        let err = Search::new(builder, (), config(order, 8)).run().unwrap_err();
        assert!(
            matches!(err, EngineError::Heap(HeapError::Exhausted { limit: 400 })),
            "{order}: {err:?}"
        );
    }
}
