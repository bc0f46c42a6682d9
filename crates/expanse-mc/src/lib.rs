//! Parallel explicit-state search engine.
//!
//! States are heap [`Snapshot`](expanse_heap::Snapshot)s produced by a
//! [`Builder`]. A [`Search`] explores them with a pool of workers, each
//! running a [`Weaver`](weaver::Weaver) task loop, deduplicates them in a
//! shared [`DedupStore`] and reports every edge and new state to a
//! [`Listener`].

pub mod builder;
pub mod checker;
pub mod config;
pub mod error;
pub mod graph;
pub mod hashset;
pub mod listener;
pub mod search;
pub mod state;
pub mod store;
pub mod trace;
pub mod weaver;

pub use builder::Builder;
pub use checker::{CheckOutcome, Checker};
pub use config::{Order, ProgressCounters, SearchConfig};
pub use error::{EngineError, EngineResult, ParseError, ReplayError, StoreError};
pub use graph::{vertex_of, ExplicitGraph, GraphBuilder};
pub use listener::{
    Action, Listener, Listeners, SafetyListener, Statistics, Stats, TraceRecorder, Violation,
    ViolationKind,
};
pub use search::{Search, SearchReport};
pub use state::{Fingerprint, InterruptFlags, Label, State, StateFlags};
pub use store::DedupStore;
pub use trace::{replay, verify, Trace, TraceStep};
pub use weaver::Halt;
