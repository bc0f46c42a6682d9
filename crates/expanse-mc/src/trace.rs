//! Counterexample traces and their replay.
//!
//! A trace is the sequence of `(choices, interrupts)` steps that leads from
//! an initial state to a target state. The first step picks the initial
//! state, each further step one outgoing edge. Replaying re-runs the builder
//! and follows the edge whose label carries the recorded step.
//!
//! Text form, one step per line:
//!
//! ```text
//! 0
//! 2 1 +mem
//! 1 +mem+cfl
//! ```

use crate::builder::Builder;
use crate::error::{source_lines, EngineError, EngineResult, ParseError, ReplayError};
use crate::state::{InterruptFlags, Label, State};
use expanse_heap::{equal, SkipSet};
use std::fmt;
use tracing::debug;

/// One replayable step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TraceStep {
    pub choices: Vec<u32>,
    pub interrupts: InterruptFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
}

impl Trace {
    pub fn new(steps: Vec<TraceStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn parse(src: &str) -> Result<Self, ParseError> {
        let mut steps = Vec::new();
        for (lineno, (start, line)) in source_lines(src).enumerate() {
            let text = line.split('#').next().unwrap_or("").trim();
            if text.is_empty() {
                continue;
            }
            let mut step = TraceStep::default();
            for word in text.split_whitespace() {
                if let Some(flags) = word.strip_prefix('+') {
                    for flag in flags.split('+') {
                        step.interrupts = step.interrupts
                            | match flag {
                                "mem" => InterruptFlags::MEMORY,
                                "cfl" => InterruptFlags::CONTROL,
                                _ => return Err(token_error(line, start, lineno, word, "unknown interrupt")),
                            };
                    }
                } else {
                    let choice = word
                        .parse()
                        .map_err(|_| token_error(line, start, lineno, word, "expected a choice index"))?;
                    step.choices.push(choice);
                }
            }
            steps.push(step);
        }
        Ok(Self { steps })
    }
}

fn token_error(line: &str, line_start: usize, lineno: usize, word: &str, what: &str) -> ParseError {
    let col = line.find(word).unwrap_or(0);
    ParseError {
        message: format!("{what}: '{word}'"),
        line: lineno + 1,
        span: line_start + col..line_start + col + word.len(),
    }
}

impl fmt::Display for TraceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for choice in &self.choices {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{choice}")?;
            first = false;
        }
        if !self.interrupts.is_empty() {
            if !first {
                write!(f, " ")?;
            }
            if self.interrupts.contains(InterruptFlags::MEMORY) {
                write!(f, "+mem")?;
            }
            if self.interrupts.contains(InterruptFlags::CONTROL) {
                write!(f, "+cfl")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            writeln!(f, "{step}")?;
        }
        Ok(())
    }
}

/// Pick the candidate reached by `step`. All candidates carrying the step
/// must be equal, otherwise the builder is not deterministic.
fn follow(
    candidates: Vec<(State, Label)>,
    step: &TraceStep,
    index: usize,
    skip: &SkipSet,
) -> Result<State, ReplayError> {
    let mut chosen: Option<State> = None;
    for (state, label) in candidates {
        if label.choices[..] != step.choices[..] || label.interrupts != step.interrupts {
            continue;
        }
        match &chosen {
            None => chosen = Some(state),
            Some(prev) if equal(&prev.snap, &state.snap, skip) => {}
            Some(_) => {
                return Err(ReplayError::Diverged {
                    step: index,
                    choices: step.choices.clone(),
                })
            }
        }
    }
    chosen.ok_or_else(|| ReplayError::NoSuchEdge {
        step: index,
        choices: step.choices.clone(),
    })
}

/// Re-run `trace` against `builder`, returning the visited states.
pub fn replay<B: Builder>(builder: &mut B, trace: &Trace, skip: &SkipSet) -> EngineResult<Vec<State>> {
    let mut steps = trace.steps.iter().enumerate();
    let (_, first) = steps.next().ok_or(ReplayError::Empty)?;

    let mut candidates = Vec::new();
    builder.initials(|s, l| candidates.push((s, l)))?;
    let mut current = follow(candidates, first, 0, skip)?;
    let mut path = vec![current.clone()];

    for (index, step) in steps {
        let mut candidates = Vec::new();
        builder.edges(&current, |s, l| candidates.push((s, l)))?;
        current = follow(candidates, step, index, skip)?;
        path.push(current.clone());
    }
    debug!(steps = trace.len(), "replayed trace");
    Ok(path)
}

/// Replay `trace` and check that it visits states equal to `expected`.
pub fn verify<B: Builder>(
    builder: &mut B,
    trace: &Trace,
    expected: &[State],
    skip: &SkipSet,
) -> EngineResult<Vec<State>> {
    let path = replay(builder, trace, skip)?;
    for (index, (got, want)) in path.iter().zip(expected).enumerate() {
        if !equal(&got.snap, &want.snap, skip) {
            return Err(EngineError::Nondeterminism(ReplayError::Diverged {
                step: index,
                choices: trace.steps[index].choices.clone(),
            }));
        }
    }
    Ok(path)
}
