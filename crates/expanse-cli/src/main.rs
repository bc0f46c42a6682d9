//! Command-line interface for the expanse state-space explorer.

use clap::{Parser, Subcommand};
use expanse_heap::{ObjId, Pool};
use expanse_mc::{
    replay, vertex_of, CheckOutcome, Checker, ExplicitGraph, GraphBuilder, Order,
    ProgressCounters, Search, SearchConfig, State, Statistics, Trace,
};
use memory_stats::memory_stats;
use miette::{Diagnostic, NamedSource, SourceSpan};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// CLI error with source context for pretty printing.
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("failed to read {path}: {message}")]
    IoError { path: String, message: String },

    #[error("parse error: {message}")]
    #[diagnostic(code(expanse::parse_error))]
    ParseError {
        message: String,
        #[source_code]
        src: NamedSource<Arc<String>>,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("search error: {message}")]
    #[diagnostic(code(expanse::search_error))]
    SearchError { message: String },

    #[error("{message}")]
    Other { message: String },
}

impl CliError {
    fn from_parse_error(e: expanse_mc::ParseError, source: Arc<String>, filename: &str) -> Self {
        CliError::ParseError {
            message: e.message,
            src: NamedSource::new(filename, source),
            span: (e.span.start, e.span.len()).into(),
        }
    }

    fn search(e: expanse_mc::EngineError) -> Self {
        CliError::SearchError {
            message: e.to_string(),
        }
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "expanse", version)]
#[command(about = "Parallel explicit-state explorer for graph models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct SearchArgs {
    /// Number of worker threads (0 = use all available)
    #[arg(short, long, default_value = "0")]
    workers: usize,

    /// Search order: bfs, pseudo-bfs or dfs
    #[arg(long, default_value = "bfs")]
    order: Order,

    /// Frontier batch size for BFS workers
    #[arg(long, default_value = "64")]
    flush_every: usize,

    /// Initial state table size
    #[arg(long, default_value = "4096")]
    table_capacity: usize,

    /// Object ids to ignore when comparing states
    #[arg(long, value_name = "ID")]
    skip_id: Vec<u32>,

    /// Record the producing choice in each state (skipped when --skip-id 2)
    #[arg(long)]
    bookkeeping: bool,

    /// Wall-clock limit in seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    time_limit: u64,

    /// Maximum memory usage in MB (0 = unlimited)
    #[arg(long, default_value = "0")]
    memory_limit: usize,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Explore a graph and check for error states and deadlocks
    Check {
        /// Input graph file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Disable deadlock checking
        #[arg(long)]
        no_deadlock: bool,

        /// Write the counterexample trace to this file
        #[arg(long, value_name = "TRACE")]
        trace_out: Option<PathBuf>,

        #[command(flatten)]
        search: SearchArgs,
    },

    /// Explore a graph completely and print search statistics
    Stats {
        /// Input graph file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        search: SearchArgs,
    },

    /// Print a random graph in which every vertex is reachable
    Generate {
        #[arg(long, default_value = "100")]
        vertices: u32,

        #[arg(long, default_value = "300")]
        edges: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Output file (default: stdout)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,
    },

    /// Replay a trace against a graph and print the visited vertices
    Replay {
        /// Input graph file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Trace file, one step per line
        #[arg(value_name = "TRACE")]
        trace: PathBuf,
    },
}

fn main() {
    // Install miette's fancy error handler
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Check { search, .. } | Commands::Stats { search, .. } => search.verbose,
        _ => false,
    };
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let result = match cli.command {
        Commands::Check {
            file,
            no_deadlock,
            trace_out,
            search,
        } => cmd_check(&file, !no_deadlock, trace_out.as_deref(), &search),
        Commands::Stats { file, search } => cmd_stats(&file, &search),
        Commands::Generate {
            vertices,
            edges,
            seed,
            output,
        } => cmd_generate(vertices, edges, seed, output.as_deref()),
        Commands::Replay { file, trace } => cmd_replay(&file, &trace),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(1);
        }
    }
}

/// Returns current process memory usage in MB, or None if unavailable.
fn current_memory_mb() -> Option<usize> {
    memory_stats().map(|stats| stats.physical_mem / (1024 * 1024))
}

fn read_source(file: &Path) -> CliResult<Arc<String>> {
    fs::read_to_string(file)
        .map(Arc::new)
        .map_err(|e| CliError::IoError {
            path: file.display().to_string(),
            message: e.to_string(),
        })
}

fn load_graph(file: &Path) -> CliResult<ExplicitGraph> {
    let filename = file.display().to_string();
    let source = read_source(file)?;
    ExplicitGraph::parse(&source).map_err(|e| CliError::from_parse_error(e, source.clone(), &filename))
}

fn builder(graph: ExplicitGraph, args: &SearchArgs, pool: &Arc<Pool>) -> GraphBuilder {
    let builder = GraphBuilder::with_pool(graph, Arc::clone(pool));
    if args.bookkeeping {
        builder.with_bookkeeping(false)
    } else {
        builder
    }
}

fn search_config(args: &SearchArgs, check_deadlock: bool) -> SearchConfig {
    SearchConfig {
        workers: args.workers,
        order: args.order,
        flush_every: args.flush_every,
        table_capacity: args.table_capacity,
        skip_ids: args.skip_id.iter().map(|&id| ObjId::new(id)).collect(),
        check_deadlock,
        progress: Some(Arc::new(ProgressCounters::new())),
        stop_flag: Some(Arc::new(AtomicBool::new(false))),
    }
}

/// Raises the stop flag when a time or memory limit is hit, and logs
/// progress every few seconds.
struct Watchdog {
    done: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn start(args: &SearchArgs, config: &SearchConfig) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let (Some(stop), Some(progress)) = (config.stop_flag.clone(), config.progress.clone()) else {
            return Self { done, handle: None };
        };
        let time_limit = (args.time_limit > 0).then(|| Duration::from_secs(args.time_limit));
        let memory_limit = (args.memory_limit > 0).then_some(args.memory_limit);
        let finished = Arc::clone(&done);

        let handle = thread::spawn(move || {
            let started = Instant::now();
            let mut last_report = Instant::now();
            while !finished.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(50));
                if let Some(limit) = time_limit {
                    if started.elapsed() >= limit {
                        warn!(seconds = limit.as_secs(), "time limit reached, stopping");
                        stop.store(true, Ordering::Relaxed);
                        return;
                    }
                }
                if let (Some(limit), Some(used)) = (memory_limit, current_memory_mb()) {
                    if used >= limit {
                        warn!(used_mb = used, limit_mb = limit, "memory limit reached, stopping");
                        stop.store(true, Ordering::Relaxed);
                        return;
                    }
                }
                if last_report.elapsed() >= Duration::from_secs(5) {
                    last_report = Instant::now();
                    info!(
                        states = progress.states.load(Ordering::Relaxed),
                        expanded = progress.expanded.load(Ordering::Relaxed),
                        edges = progress.edges.load(Ordering::Relaxed),
                        memory_mb = current_memory_mb().unwrap_or(0),
                        "progress"
                    );
                }
            }
        });
        Self {
            done,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

fn describe(state: &State) -> String {
    let vertex = vertex_of(state).map_or_else(|| "?".to_string(), |v| v.to_string());
    let mut flags = Vec::new();
    if state.flags.error {
        flags.push("error");
    }
    if state.flags.accepting {
        flags.push("accepting");
    }
    if flags.is_empty() {
        vertex
    } else {
        format!("{vertex} ({})", flags.join(", "))
    }
}

fn cmd_check(
    file: &Path,
    check_deadlock: bool,
    trace_out: Option<&Path>,
    args: &SearchArgs,
) -> CliResult<i32> {
    info!("parsing...");
    let graph = load_graph(file)?;
    info!(
        vertices = graph.vertices().len(),
        edges = graph.edge_count(),
        "loaded graph"
    );

    let pool = Arc::new(Pool::new());
    let config = search_config(args, check_deadlock);
    let watchdog = Watchdog::start(args, &config);

    info!("checking...");
    let start = Instant::now();
    let result = Checker::new(builder(graph, args, &pool), config).check();
    watchdog.stop();
    let outcome = result.map_err(CliError::search)?;
    let elapsed = start.elapsed();

    match outcome {
        CheckOutcome::Ok {
            states,
            edges,
            expanded,
            ..
        } => {
            println!();
            println!("Result: OK");
            println!("  States explored: {}", states);
            println!("  States expanded: {}", expanded);
            println!("  Edges: {}", edges);
            println!("  Time: {:.2}s", elapsed.as_secs_f64());
            println!(
                "  States/sec: {:.0}",
                states as f64 / elapsed.as_secs_f64().max(1e-9)
            );
            Ok(0)
        }
        CheckOutcome::Violation {
            kind,
            state,
            trace,
            path,
            states,
        } => {
            println!();
            println!("Result: {}", match kind {
                expanse_mc::ViolationKind::Error => "ERROR STATE REACHED",
                expanse_mc::ViolationKind::Deadlock => "DEADLOCK",
            });
            println!("  State: {}", describe(&state));
            println!("  States explored: {}", states);
            println!("  Trace ({} steps):", trace.len());
            for (i, (step, state)) in trace.steps.iter().zip(&path).enumerate() {
                println!("    {}: [{}] -> {}", i, step, describe(state));
            }
            if let Some(out) = trace_out {
                fs::write(out, trace.to_string()).map_err(|e| CliError::IoError {
                    path: out.display().to_string(),
                    message: e.to_string(),
                })?;
                println!("  Trace written to {}", out.display());
            }
            Ok(1)
        }
        CheckOutcome::Cancelled { states, edges } => {
            println!();
            println!("Result: CANCELLED");
            println!("  States explored: {}", states);
            println!("  Edges: {}", edges);
            println!("  Time: {:.2}s", elapsed.as_secs_f64());
            Ok(2)
        }
    }
}

fn cmd_stats(file: &Path, args: &SearchArgs) -> CliResult<i32> {
    let graph = load_graph(file)?;
    let pool = Arc::new(Pool::new());
    let config = search_config(args, true);
    let watchdog = Watchdog::start(args, &config);

    let stats = Statistics::new();
    let result = Search::new(builder(graph, args, &pool), &stats, config).run();
    watchdog.stop();
    let report = result.map_err(CliError::search)?;
    let counts = stats.stats();
    pool.collect();

    println!("Halt: {:?}", report.halt);
    println!("  Workers: {}", report.workers);
    println!("  States: {}", report.states);
    println!("  Initial states: {}", counts.initials);
    println!("  Edges: {}", report.edges);
    println!("  Expanded: {}", report.expanded);
    println!("  Error states: {}", counts.errors);
    println!("  Accepting states: {}", counts.accepting);
    println!("  Deadlocks: {}", counts.deadlocks);
    println!("  Table capacity: {}", report.store.capacity());
    println!("  Hash collisions: {}", report.store.collisions());
    println!("  Pool images: {} ({} bytes)", pool.len(), pool.bytes());
    println!("  Time: {:.2}s", report.elapsed.as_secs_f64());
    if let Some(mb) = current_memory_mb() {
        println!("  Memory: {} MB", mb);
    }
    Ok(0)
}

fn cmd_generate(vertices: u32, edges: usize, seed: u64, output: Option<&Path>) -> CliResult<i32> {
    if vertices == 0 {
        return Err(CliError::Other {
            message: "a graph needs at least one vertex".into(),
        });
    }
    let graph = ExplicitGraph::random(vertices, edges, seed);
    let text = format!(
        "# Generated: --vertices {vertices} --edges {edges} --seed {seed}\n{graph}"
    );
    match output {
        Some(path) => {
            fs::write(path, &text).map_err(|e| CliError::IoError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            println!("generated: {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(0)
}

fn cmd_replay(file: &Path, trace_file: &Path) -> CliResult<i32> {
    let graph = load_graph(file)?;
    let filename = trace_file.display().to_string();
    let source = read_source(trace_file)?;
    let trace =
        Trace::parse(&source).map_err(|e| CliError::from_parse_error(e, source.clone(), &filename))?;

    let mut builder = GraphBuilder::new(graph);
    let path = replay(&mut builder, &trace, &expanse_heap::SkipSet::new()).map_err(CliError::search)?;
    println!("Replayed {} steps:", trace.len());
    for (i, (step, state)) in trace.steps.iter().zip(&path).enumerate() {
        println!("  {}: [{}] -> {}", i, step, describe(state));
    }
    Ok(if path.last().is_some_and(State::is_error) { 1 } else { 0 })
}
