//! Search observers.
//!
//! A listener is told about every edge the search follows and every state
//! it discovers, and steers exploration through the [`Action`] it returns.
//! Several listeners can be combined; their verdicts are merged with
//! [`Action::merge`].

use crate::config::ProgressCounters;
use crate::state::{Label, State, StateKey};
use crate::trace::{Trace, TraceStep};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// A listener's verdict.
///
/// On an edge: `Process` follows it, `AsNeeded` follows it only if the
/// target itself asks for expansion, `Ignore` drops it. On a new state:
/// `Process` expands it, `AsNeeded` expands it once some edge into it is
/// processed, `Ignore` never expands it. `Terminate` stops the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    #[default]
    Process,
    AsNeeded,
    Ignore,
    Terminate,
}

impl Action {
    fn rank(self) -> u8 {
        match self {
            Action::Process => 0,
            Action::AsNeeded => 1,
            Action::Ignore => 2,
            Action::Terminate => 3,
        }
    }

    /// Combine two verdicts. `Terminate` beats `Ignore`, which beats
    /// `AsNeeded`, which beats `Process`.
    pub fn merge(self, other: Action) -> Action {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

pub trait Listener: Send + Sync {
    /// An initial state produced by the builder.
    fn initial(&self, _to: &State, _label: &Label, _is_new: bool) -> Action {
        Action::Process
    }

    /// Every edge, new target or not.
    fn edge(&self, _from: &State, _to: &State, _label: &Label, _is_new: bool) -> Action {
        Action::Process
    }

    /// Called once per state, when it is first reached through an edge
    /// that is not ignored.
    fn state(&self, _state: &State) -> Action {
        Action::Process
    }

    /// An expanded state that has no successors.
    fn deadlocked(&self, _state: &State) -> Action {
        Action::Process
    }
}

impl Listener for () {}

impl<L: Listener + ?Sized> Listener for Arc<L> {
    fn initial(&self, to: &State, label: &Label, is_new: bool) -> Action {
        (**self).initial(to, label, is_new)
    }

    fn edge(&self, from: &State, to: &State, label: &Label, is_new: bool) -> Action {
        (**self).edge(from, to, label, is_new)
    }

    fn state(&self, state: &State) -> Action {
        (**self).state(state)
    }

    fn deadlocked(&self, state: &State) -> Action {
        (**self).deadlocked(state)
    }
}

impl<L: Listener + ?Sized> Listener for &L {
    fn initial(&self, to: &State, label: &Label, is_new: bool) -> Action {
        (**self).initial(to, label, is_new)
    }

    fn edge(&self, from: &State, to: &State, label: &Label, is_new: bool) -> Action {
        (**self).edge(from, to, label, is_new)
    }

    fn state(&self, state: &State) -> Action {
        (**self).state(state)
    }

    fn deadlocked(&self, state: &State) -> Action {
        (**self).deadlocked(state)
    }
}

impl<A: Listener, B: Listener> Listener for (A, B) {
    fn initial(&self, to: &State, label: &Label, is_new: bool) -> Action {
        self.0
            .initial(to, label, is_new)
            .merge(self.1.initial(to, label, is_new))
    }

    fn edge(&self, from: &State, to: &State, label: &Label, is_new: bool) -> Action {
        self.0
            .edge(from, to, label, is_new)
            .merge(self.1.edge(from, to, label, is_new))
    }

    fn state(&self, state: &State) -> Action {
        self.0.state(state).merge(self.1.state(state))
    }

    fn deadlocked(&self, state: &State) -> Action {
        self.0.deadlocked(state).merge(self.1.deadlocked(state))
    }
}

/// A runtime list of listeners, all consulted in order.
#[derive(Default, Clone)]
pub struct Listeners(Vec<Arc<dyn Listener>>);

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn Listener>) -> Self {
        self.0.push(listener);
        self
    }

    pub fn push(&mut self, listener: Arc<dyn Listener>) {
        self.0.push(listener);
    }

    fn fold(&self, f: impl Fn(&dyn Listener) -> Action) -> Action {
        self.0
            .iter()
            .fold(Action::Process, |acc, l| acc.merge(f(l.as_ref())))
    }
}

impl Listener for Listeners {
    fn initial(&self, to: &State, label: &Label, is_new: bool) -> Action {
        self.fold(|l| l.initial(to, label, is_new))
    }

    fn edge(&self, from: &State, to: &State, label: &Label, is_new: bool) -> Action {
        self.fold(|l| l.edge(from, to, label, is_new))
    }

    fn state(&self, state: &State) -> Action {
        self.fold(|l| l.state(state))
    }

    fn deadlocked(&self, state: &State) -> Action {
        self.fold(|l| l.deadlocked(state))
    }
}

/// Counts of what a search reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub states: usize,
    pub initials: usize,
    pub edges: usize,
    pub errors: usize,
    pub accepting: usize,
    pub deadlocks: usize,
}

/// Lock-free counters over listener events.
#[derive(Default)]
pub struct Statistics {
    states: AtomicUsize,
    initials: AtomicUsize,
    edges: AtomicUsize,
    errors: AtomicUsize,
    accepting: AtomicUsize,
    deadlocks: AtomicUsize,
    progress: Option<Arc<ProgressCounters>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also publish the state count to shared progress counters.
    pub fn with_progress(progress: Arc<ProgressCounters>) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            states: self.states.load(Ordering::Relaxed),
            initials: self.initials.load(Ordering::Relaxed),
            edges: self.edges.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            accepting: self.accepting.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
        }
    }
}

impl Listener for Statistics {
    fn initial(&self, _to: &State, _label: &Label, is_new: bool) -> Action {
        if is_new {
            self.initials.fetch_add(1, Ordering::Relaxed);
        }
        Action::Process
    }

    fn edge(&self, _from: &State, _to: &State, _label: &Label, _is_new: bool) -> Action {
        self.edges.fetch_add(1, Ordering::Relaxed);
        Action::Process
    }

    fn state(&self, state: &State) -> Action {
        let n = self.states.fetch_add(1, Ordering::Relaxed) + 1;
        if state.flags.error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if state.flags.accepting {
            self.accepting.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(progress) = &self.progress {
            progress.states.store(n, Ordering::Relaxed);
        }
        Action::Process
    }

    fn deadlocked(&self, _state: &State) -> Action {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
        Action::Process
    }
}

struct Parent {
    from: Option<State>,
    label: Label,
}

/// Remembers, for every state, the edge through which it was first reached.
///
/// The parents form a tree rooted in the initial states, so any discovered
/// state can be traced back to an initial state.
#[derive(Default)]
pub struct TraceRecorder {
    parents: DashMap<StateKey, Parent>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// The trace from an initial state to `target`, with the states it
    /// visits. Returns `None` if `target` was never recorded.
    pub fn trace_to(&self, target: &State) -> Option<(Trace, Vec<State>)> {
        let mut steps: Vec<TraceStep> = Vec::new();
        let mut path = vec![target.clone()];
        let mut key = target.key();
        loop {
            let parent = self.parents.get(&key)?;
            steps.push(parent.label.step());
            match &parent.from {
                Some(from) => {
                    key = from.key();
                    path.push(from.clone());
                }
                None => break,
            }
        }
        steps.reverse();
        path.reverse();
        debug!(length = steps.len(), "reconstructed trace");
        Some((Trace::new(steps), path))
    }
}

impl Listener for TraceRecorder {
    fn initial(&self, to: &State, label: &Label, is_new: bool) -> Action {
        if is_new {
            self.parents.insert(
                to.key(),
                Parent {
                    from: None,
                    label: label.clone(),
                },
            );
        }
        Action::Process
    }

    fn edge(&self, from: &State, to: &State, label: &Label, is_new: bool) -> Action {
        if is_new {
            self.parents.insert(
                to.key(),
                Parent {
                    from: Some(from.clone()),
                    label: label.clone(),
                },
            );
        }
        Action::Process
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// An error-flagged state was reached.
    Error,
    /// An expanded state has no successors.
    Deadlock,
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub state: State,
}

/// Stops the search at the first error state, and optionally at the first
/// deadlock.
pub struct SafetyListener {
    violation: OnceLock<Violation>,
    deadlocks: bool,
}

impl SafetyListener {
    pub fn new(deadlocks: bool) -> Self {
        Self {
            violation: OnceLock::new(),
            deadlocks,
        }
    }

    pub fn violation(&self) -> Option<&Violation> {
        self.violation.get()
    }

    fn report(&self, kind: ViolationKind, state: &State) -> Action {
        if self
            .violation
            .set(Violation {
                kind,
                state: state.clone(),
            })
            .is_ok()
        {
            info!(?kind, "violation found");
        }
        Action::Terminate
    }
}

impl Listener for SafetyListener {
    fn state(&self, state: &State) -> Action {
        if state.flags.error {
            self.report(ViolationKind::Error, state)
        } else {
            Action::Process
        }
    }

    fn deadlocked(&self, state: &State) -> Action {
        if self.deadlocks {
            self.report(ViolationKind::Deadlock, state)
        } else {
            Action::Process
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateFlags;
    use expanse_heap::Snapshot;

    struct Fixed(Action);

    impl Listener for Fixed {
        fn state(&self, _state: &State) -> Action {
            self.0
        }
    }

    fn fresh() -> State {
        State::new(Snapshot::default())
    }

    #[test]
    fn test_merge_precedence() {
        use Action::*;
        assert_eq!(Process.merge(AsNeeded), AsNeeded);
        assert_eq!(AsNeeded.merge(Ignore), Ignore);
        assert_eq!(Ignore.merge(Process), Ignore);
        assert_eq!(Terminate.merge(Ignore), Terminate);
        assert_eq!(Process.merge(Terminate), Terminate);
        assert_eq!(Process.merge(Process), Process);
    }

    #[test]
    fn test_composition() {
        let s = fresh();
        let pair = (Fixed(Action::Process), Fixed(Action::Ignore));
        assert_eq!(pair.state(&s), Action::Ignore);

        let list = Listeners::new()
            .with(Arc::new(Fixed(Action::AsNeeded)))
            .with(Arc::new(Fixed(Action::Process)));
        assert_eq!(list.state(&s), Action::AsNeeded);
        assert_eq!(Listeners::new().state(&s), Action::Process);
    }

    #[test]
    fn test_statistics() {
        let stats = Statistics::new();
        let mut bad = fresh();
        bad.flags = StateFlags {
            error: true,
            ..StateFlags::default()
        };
        let good = fresh();
        stats.initial(&good, &Label::choice(0), true);
        stats.state(&good);
        stats.edge(&good, &bad, &Label::choice(0), true);
        stats.state(&bad);
        stats.edge(&bad, &good, &Label::choice(0), false);
        let s = stats.stats();
        assert_eq!(s.states, 2);
        assert_eq!(s.initials, 1);
        assert_eq!(s.edges, 2);
        assert_eq!(s.errors, 1);
    }

    #[test]
    fn test_trace_recorder_follows_first_discovery() {
        let rec = TraceRecorder::new();
        let a = fresh();
        let b = fresh();
        let c = fresh();
        rec.initial(&a, &Label::choice(0), true);
        rec.edge(&a, &b, &Label::choice(1), true);
        rec.edge(&b, &c, &Label::choice(2), true);
        // A later, shorter edge does not replace the recorded parent.
        rec.edge(&a, &c, &Label::choice(3), false);

        let (trace, path) = rec.trace_to(&c).unwrap();
        let choices: Vec<Vec<u32>> = trace.steps.iter().map(|s| s.choices.clone()).collect();
        assert_eq!(choices, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(path.len(), 3);
        assert!(path[0].same(&a) && path[2].same(&c));
        assert!(rec.trace_to(&fresh()).is_none());
    }

    #[test]
    fn test_safety_listener_keeps_first_violation() {
        let safety = SafetyListener::new(false);
        let ok = fresh();
        assert_eq!(safety.state(&ok), Action::Process);
        assert_eq!(safety.deadlocked(&ok), Action::Process);
        let mut bad = fresh();
        bad.flags.error = true;
        assert_eq!(safety.state(&bad), Action::Terminate);
        let other = {
            let mut s = fresh();
            s.flags.error = true;
            s
        };
        safety.state(&other);
        assert!(safety.violation().unwrap().state.same(&bad));
        assert_eq!(safety.violation().unwrap().kind, ViolationKind::Error);
    }
}
