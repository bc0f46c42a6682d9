//! Safety checking on top of [`Search`].

use crate::builder::Builder;
use crate::config::SearchConfig;
use crate::error::EngineResult;
use crate::listener::{Listeners, SafetyListener, Statistics, Stats, TraceRecorder, ViolationKind};
use crate::search::Search;
use crate::state::State;
use crate::trace::{self, Trace};
use crate::weaver::Halt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a check.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The reachable state space was exhausted without a violation.
    Ok {
        states: usize,
        edges: usize,
        expanded: usize,
        elapsed: Duration,
    },
    /// A violation was found. `trace` replays to `path`, whose last state is
    /// `state`.
    Violation {
        kind: ViolationKind,
        state: State,
        trace: Trace,
        path: Vec<State>,
        states: usize,
    },
    /// The stop flag was raised before the search finished.
    Cancelled { states: usize, edges: usize },
}

impl CheckOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CheckOutcome::Ok { .. })
    }
}

/// Runs a search with statistics, trace recording and safety listeners and
/// turns the result into a [`CheckOutcome`].
pub struct Checker<B> {
    builder: B,
    config: SearchConfig,
}

impl<B: Builder> Checker<B> {
    pub fn new(builder: B, config: SearchConfig) -> Self {
        Self { builder, config }
    }

    pub fn check(&self) -> EngineResult<CheckOutcome> {
        self.check_with_stats().map(|(outcome, _)| outcome)
    }

    /// Like [`check`](Self::check), also returning the listener counts.
    pub fn check_with_stats(&self) -> EngineResult<(CheckOutcome, Stats)> {
        let stats = Arc::new(match &self.config.progress {
            Some(progress) => Statistics::with_progress(Arc::clone(progress)),
            None => Statistics::new(),
        });
        let recorder = Arc::new(TraceRecorder::new());
        let safety = Arc::new(SafetyListener::new(self.config.check_deadlock));
        let listeners = Listeners::new()
            .with(stats.clone())
            .with(recorder.clone())
            .with(safety.clone());

        let report = Search::new(self.builder.clone(), listeners, self.config.clone()).run()?;
        let counts = stats.stats();

        if let Some(violation) = safety.violation() {
            let skip = report.store.skip_ids().clone();
            let Some((trace, recorded)) = recorder.trace_to(&violation.state) else {
                warn!("violation state has no recorded parent");
                return Ok((
                    CheckOutcome::Violation {
                        kind: violation.kind,
                        state: violation.state.clone(),
                        trace: Trace::default(),
                        path: vec![violation.state.clone()],
                        states: report.states,
                    },
                    counts,
                ));
            };
            let mut builder = self.builder.clone();
            let path = trace::verify(&mut builder, &trace, &recorded, &skip)?;
            info!(kind = ?violation.kind, length = trace.len(), "counterexample confirmed by replay");
            return Ok((
                CheckOutcome::Violation {
                    kind: violation.kind,
                    state: violation.state.clone(),
                    trace,
                    path,
                    states: report.states,
                },
                counts,
            ));
        }

        let outcome = match report.halt {
            Halt::Cancelled => CheckOutcome::Cancelled {
                states: report.states,
                edges: report.edges,
            },
            Halt::Quiescent | Halt::Terminated => CheckOutcome::Ok {
                states: report.states,
                edges: report.edges,
                expanded: report.expanded,
                elapsed: report.elapsed,
            },
        };
        Ok((outcome, counts))
    }
}
