//! Property tests: the explored state space does not depend on the search
//! order or the number of workers.

use expanse_mc::{vertex_of, ExplicitGraph, GraphBuilder, Order, Search, SearchConfig};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn order_strategy() -> impl Strategy<Value = Order> {
    prop_oneof![Just(Order::Bfs), Just(Order::PseudoBfs), Just(Order::Dfs)]
}

/// Vertices reachable from the initial ones, computed directly.
fn reachable(graph: &ExplicitGraph) -> BTreeSet<u32> {
    let mut seen: BTreeSet<u32> = graph.initials().iter().copied().collect();
    let mut stack: Vec<u32> = seen.iter().copied().collect();
    while let Some(v) = stack.pop() {
        for &to in graph.successors(v) {
            if seen.insert(to) {
                stack.push(to);
            }
        }
    }
    seen
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]

    #[test]
    fn search_matches_reachability(
        vertices in 1u32..60,
        extra in 0usize..150,
        seed in any::<u64>(),
        workers in 1usize..6,
        order in order_strategy(),
        flush_every in 1usize..16,
    ) {
        let graph = ExplicitGraph::random(vertices, vertices as usize + extra, seed);
        let config = SearchConfig {
            workers,
            order,
            flush_every,
            table_capacity: 16,
            check_deadlock: false,
            ..SearchConfig::default()
        };
        let report = Search::new(GraphBuilder::new(graph.clone()), (), config).run().unwrap();
        let found: BTreeSet<u32> = report.store.states().iter().filter_map(vertex_of).collect();
        prop_assert_eq!(found, reachable(&graph));
        prop_assert_eq!(report.edges, graph.edge_count());
        prop_assert_eq!(report.expanded, report.states);
    }

    #[test]
    fn hand_written_graphs_round_trip_through_text(
        edges in prop::collection::vec((1u32..20, 1u32..20), 0..40),
        errors in prop::collection::btree_set(1u32..20, 0..4),
    ) {
        let mut graph = ExplicitGraph::new();
        graph.add_initial(1);
        for (from, to) in edges {
            graph.add_edge(from, to);
        }
        for v in errors {
            graph.mark_error(v);
        }
        let parsed = ExplicitGraph::parse(&graph.to_string()).unwrap();
        prop_assert_eq!(parsed, graph);
    }
}
