#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(graph) = expanse_mc::ExplicitGraph::parse(s) {
            if graph.vertices().len() <= 1_000 {
                let reachable = graph.vertices().len();
                let config = expanse_mc::SearchConfig {
                    workers: 2,
                    check_deadlock: true,
                    ..expanse_mc::SearchConfig::default()
                };
                let builder = expanse_mc::GraphBuilder::new(graph);
                if let Ok(report) = expanse_mc::Search::new(builder, (), config).run() {
                    assert!(report.states <= reachable);
                    assert_eq!(report.expanded, report.states);
                }
            }
        }
    }
});
