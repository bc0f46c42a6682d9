//! Search configuration.

use expanse_heap::ObjId;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

/// Order in which frontier states are expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// One shared FIFO frontier.
    #[default]
    Bfs,
    /// Per-worker FIFO frontiers with work stealing.
    PseudoBfs,
    /// Per-worker stacks with work stealing.
    Dfs,
}

impl FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bfs" => Ok(Order::Bfs),
            "pseudo-bfs" | "pseudobfs" | "pbfs" => Ok(Order::PseudoBfs),
            "dfs" => Ok(Order::Dfs),
            other => Err(format!("unknown search order '{other}' (expected bfs, pseudo-bfs or dfs)")),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Order::Bfs => "bfs",
            Order::PseudoBfs => "pseudo-bfs",
            Order::Dfs => "dfs",
        })
    }
}

/// Lock-free progress counters shared between the search and a reporter.
pub struct ProgressCounters {
    pub states: AtomicUsize,
    /// States whose successors have been generated.
    pub expanded: AtomicUsize,
    pub edges: AtomicUsize,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            states: AtomicUsize::new(0),
            expanded: AtomicUsize::new(0),
            edges: AtomicUsize::new(0),
        }
    }
}

/// Configuration for a search run.
#[derive(Clone)]
pub struct SearchConfig {
    /// Number of worker threads (0 = use all available).
    pub workers: usize,
    pub order: Order,
    /// BFS workers hand their new frontier states to the shared queue in
    /// batches of this size.
    pub flush_every: usize,
    /// Initial slot count of the state table.
    pub table_capacity: usize,
    /// Extra objects to ignore when comparing states, on top of those the
    /// builder names.
    pub skip_ids: Vec<ObjId>,
    /// Report expanded states without successors to listeners.
    pub check_deadlock: bool,
    /// Shared counters the search updates as it goes.
    pub progress: Option<Arc<ProgressCounters>>,
    /// Set from outside to cancel the run.
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            order: Order::Bfs,
            flush_every: 64,
            table_capacity: 1 << 12,
            skip_ids: Vec::new(),
            check_deadlock: true,
            progress: None,
            stop_flag: None,
        }
    }
}

impl fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchConfig")
            .field("workers", &self.workers)
            .field("order", &self.order)
            .field("flush_every", &self.flush_every)
            .field("table_capacity", &self.table_capacity)
            .field("skip_ids", &self.skip_ids)
            .field("check_deadlock", &self.check_deadlock)
            .field("progress", &self.progress.as_ref().map(|_| "..."))
            .field("stop_flag", &self.stop_flag.as_ref().map(|_| "..."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_parse() {
        assert_eq!("BFS".parse::<Order>().unwrap(), Order::Bfs);
        assert_eq!("pseudo-bfs".parse::<Order>().unwrap(), Order::PseudoBfs);
        assert_eq!("dfs".parse::<Order>().unwrap(), Order::Dfs);
        assert!("random".parse::<Order>().is_err());
        assert_eq!(Order::PseudoBfs.to_string(), "pseudo-bfs");
    }
}
