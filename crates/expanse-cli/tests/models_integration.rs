//! Integration tests that check every model under `models/` against the
//! verdict in its `# Expect:` header.

use expanse_mc::{CheckOutcome, Checker, ExplicitGraph, GraphBuilder, Order, SearchConfig, ViolationKind};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct Expect {
    verdict: String,
    states: Option<usize>,
    edges: Option<usize>,
    no_deadlock: bool,
}

fn parse_header(source: &str) -> Option<Expect> {
    let mut expect: Option<Expect> = None;
    for line in source.lines() {
        if let Some(rest) = line.strip_prefix("# Expect:") {
            let mut e = Expect::default();
            for part in rest.split_whitespace() {
                match part.split_once('=') {
                    Some(("states", n)) => e.states = n.parse().ok(),
                    Some(("edges", n)) => e.edges = n.parse().ok(),
                    _ => e.verdict = part.to_string(),
                }
            }
            expect = Some(e);
        } else if let Some(rest) = line.strip_prefix("# Use:") {
            if let Some(e) = expect.as_mut() {
                e.no_deadlock |= rest.split_whitespace().any(|flag| flag == "--no-deadlock");
            }
        }
    }
    expect
}

fn models_dir() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("models")
}

fn find_graph_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().map_or(false, |e| e == "graph"))
        .collect();
    files.sort();
    files
}

fn check_model(file: &Path, order: Order, workers: usize) -> Result<(), String> {
    let source = fs::read_to_string(file).unwrap();
    let expect = parse_header(&source).ok_or("missing '# Expect:' header")?;
    let graph = ExplicitGraph::parse(&source).map_err(|e| e.to_string())?;
    let config = SearchConfig {
        workers,
        order,
        check_deadlock: !expect.no_deadlock,
        ..SearchConfig::default()
    };
    let outcome = Checker::new(GraphBuilder::new(graph), config)
        .check()
        .map_err(|e| e.to_string())?;

    match (&outcome, expect.verdict.as_str()) {
        (CheckOutcome::Ok { states, edges, .. }, "ok") => {
            if expect.states.is_some_and(|n| n != *states) {
                return Err(format!("expected {:?} states, found {states}", expect.states));
            }
            if expect.edges.is_some_and(|n| n != *edges) {
                return Err(format!("expected {:?} edges, found {edges}", expect.edges));
            }
            Ok(())
        }
        (CheckOutcome::Violation { kind: ViolationKind::Error, state, .. }, "error") => {
            if state.flags.error {
                Ok(())
            } else {
                Err("violation state is not flagged as an error".into())
            }
        }
        (CheckOutcome::Violation { kind: ViolationKind::Deadlock, .. }, "deadlock") => Ok(()),
        (other, verdict) => Err(format!("expected {verdict}, got {other:?}")),
    }
}

#[test]
fn all_models_have_expected_verdicts() {
    let files = find_graph_files(&models_dir());
    assert!(!files.is_empty(), "no .graph files found");

    let mut failures = Vec::new();
    for file in &files {
        for order in [Order::Bfs, Order::PseudoBfs, Order::Dfs] {
            for workers in [1, 4] {
                if let Err(e) = check_model(file, order, workers) {
                    failures.push(format!("{} ({order}, {workers} workers): {e}", file.display()));
                }
            }
        }
    }

    if !failures.is_empty() {
        panic!("model failures:\n{}", failures.join("\n"));
    }
}

#[test]
fn counterexamples_end_in_the_violation() {
    let file = models_dir().join("mutex-racy.graph");
    let source = fs::read_to_string(&file).unwrap();
    let graph = ExplicitGraph::parse(&source).unwrap();
    let config = SearchConfig {
        workers: 1,
        ..SearchConfig::default()
    };
    let outcome = Checker::new(GraphBuilder::new(graph), config).check().unwrap();
    let CheckOutcome::Violation { trace, path, state, .. } = outcome else {
        panic!("expected a violation");
    };
    assert_eq!(trace.len(), path.len());
    assert_eq!(expanse_mc::vertex_of(path.last().unwrap()), Some(221));
    assert_eq!(expanse_mc::vertex_of(&state), Some(221));
    // BFS with one worker finds a shortest counterexample.
    assert_eq!(trace.len(), 5);
}
