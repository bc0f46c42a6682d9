//! Typed task dispatch.
//!
//! A [`Weaver`] owns one queue per task kind and a list of machines. Each
//! machine declares the kinds it reacts to. The weaver pops a task from the
//! first non-empty queue (queues are kept in priority order) and passes it to
//! the interested machines in registration order, until one of them reports
//! the task handled. Tasks a machine emits go to an [`Outbox`] and are queued
//! only after the current task is done, never run re-entrantly.
//!
//! Every worker runs its own weaver. The workers share a [`Control`] that
//! counts outstanding tasks across all of them; a worker whose queues are
//! empty stops once that count drops to zero.

use crate::error::EngineResult;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A unit of work routed by kind.
pub trait Task: Send {
    /// Number of task kinds.
    const KINDS: usize;

    /// Index of this task's kind, below `KINDS`.
    fn kind(&self) -> usize;
}

/// A queue for one task kind.
pub trait Queue<T>: Send {
    fn push(&mut self, task: T);
    fn pop(&mut self) -> Option<T>;

    /// Publish locally buffered tasks to other workers.
    fn flush(&mut self) {}
}

/// Plain worker-private FIFO.
pub struct Fifo<T>(std::collections::VecDeque<T>);

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Fifo(std::collections::VecDeque::new())
    }
}

impl<T: Send> Queue<T> for Fifo<T> {
    fn push(&mut self, task: T) {
        self.0.push_back(task);
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }
}

/// What a machine did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Pass the task on to the next interested machine.
    Continue,
    /// The task is fully handled.
    Handled,
    /// Stop the whole run.
    Terminate,
}

/// Tasks emitted while handling one task.
pub struct Outbox<T> {
    tasks: Vec<T>,
}

impl<T> Outbox<T> {
    fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, task: T) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub trait Machine<T: Task>: Send {
    /// Kinds of task this machine reacts to.
    fn interests(&self) -> &'static [usize];

    fn run(&mut self, task: &mut T, out: &mut Outbox<T>) -> EngineResult<Flow>;
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// Every queue of every worker drained.
    Quiescent,
    /// A machine returned [`Flow::Terminate`].
    Terminated,
    /// The external stop flag was raised.
    Cancelled,
}

/// Shared run state: outstanding task count and stop conditions.
pub struct Control {
    pending: AtomicUsize,
    terminated: AtomicBool,
    stop: Option<Arc<AtomicBool>>,
}

impl Control {
    pub fn new(stop: Option<Arc<AtomicBool>>) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            stop,
        }
    }

    /// Count `n` tasks placed in a shared queue outside any weaver.
    pub fn announce(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn halted(&self) -> Option<Halt> {
        if self.is_terminated() {
            Some(Halt::Terminated)
        } else if self.is_cancelled() {
            Some(Halt::Cancelled)
        } else {
            None
        }
    }
}

/// Lifecycle of one weaver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Done(Halt),
}

pub struct Weaver<'a, T: Task> {
    queues: Vec<Box<dyn Queue<T> + 'a>>,
    machines: Vec<Box<dyn Machine<T> + 'a>>,
    routes: Vec<Vec<usize>>,
    outbox: Outbox<T>,
    control: &'a Control,
    phase: Phase,
    handled: usize,
}

impl<'a, T: Task + 'a> Weaver<'a, T> {
    /// A weaver with a private FIFO for every kind.
    pub fn new(control: &'a Control) -> Self {
        Self {
            queues: (0..T::KINDS)
                .map(|_| Box::new(Fifo::default()) as Box<dyn Queue<T> + 'a>)
                .collect(),
            machines: Vec::new(),
            routes: vec![Vec::new(); T::KINDS],
            outbox: Outbox::new(),
            control,
            phase: Phase::Idle,
            handled: 0,
        }
    }

    /// Replace the queue used for `kind`.
    pub fn with_queue(mut self, kind: usize, queue: Box<dyn Queue<T> + 'a>) -> Self {
        self.queues[kind] = queue;
        self
    }

    /// Register a machine after all previously registered ones.
    pub fn with_machine(mut self, machine: Box<dyn Machine<T> + 'a>) -> Self {
        let index = self.machines.len();
        for &kind in machine.interests() {
            self.routes[kind].push(index);
        }
        self.machines.push(machine);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of tasks this weaver has dispatched.
    pub fn handled(&self) -> usize {
        self.handled
    }

    /// Queue a task.
    pub fn push(&mut self, task: T) {
        self.control.pending.fetch_add(1, Ordering::AcqRel);
        self.queues[task.kind()].push(task);
    }

    fn pop(&mut self) -> Option<T> {
        self.queues.iter_mut().find_map(|q| q.pop())
    }

    fn flush(&mut self) {
        for q in &mut self.queues {
            q.flush();
        }
    }

    fn dispatch(&mut self, mut task: T) -> EngineResult<Flow> {
        let kind = task.kind();
        let mut flow = Flow::Continue;
        for &index in &self.routes[kind] {
            flow = self.machines[index].run(&mut task, &mut self.outbox)?;
            if flow != Flow::Continue {
                break;
            }
        }
        Ok(flow)
    }

    /// Dispatch tasks until global quiescence or a stop condition.
    pub fn run(&mut self) -> EngineResult<Halt> {
        self.phase = Phase::Running;
        let backoff = Backoff::new();
        let halt = loop {
            if let Some(halt) = self.control.halted() {
                break halt;
            }

            let Some(task) = self.pop() else {
                self.flush();
                if self.control.pending() == 0 {
                    break Halt::Quiescent;
                }
                backoff.snooze();
                continue;
            };
            backoff.reset();

            let flow = match self.dispatch(task) {
                Ok(flow) => flow,
                Err(e) => {
                    self.control.terminate();
                    self.phase = Phase::Done(Halt::Terminated);
                    return Err(e);
                }
            };
            self.handled += 1;

            if flow == Flow::Terminate {
                self.outbox.tasks.clear();
                self.control.terminate();
                break Halt::Terminated;
            }

            let emitted = std::mem::take(&mut self.outbox.tasks);
            for next in emitted {
                self.push(next);
            }
            // Only now may the count reach zero: emitted tasks are counted.
            self.control.pending.fetch_sub(1, Ordering::AcqRel);
        };
        trace!(handled = self.handled, ?halt, "weaver stopped");
        self.phase = Phase::Done(halt);
        Ok(halt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Count down from `n`; every number spawns its predecessor and is
    /// logged by a second machine.
    #[derive(Debug)]
    enum Count {
        Number(u32),
        Log(u32),
    }

    impl Task for Count {
        const KINDS: usize = 2;

        fn kind(&self) -> usize {
            match self {
                Count::Log(_) => 0,
                Count::Number(_) => 1,
            }
        }
    }

    struct Decrement;

    impl Machine<Count> for Decrement {
        fn interests(&self) -> &'static [usize] {
            &[1]
        }

        fn run(&mut self, task: &mut Count, out: &mut Outbox<Count>) -> EngineResult<Flow> {
            if let Count::Number(n) = *task {
                out.push(Count::Log(n));
                if n > 0 {
                    out.push(Count::Number(n - 1));
                }
            }
            Ok(Flow::Continue)
        }
    }

    struct Recorder<'a> {
        seen: &'a mut Vec<String>,
        stop_at: Option<u32>,
    }

    impl Machine<Count> for Recorder<'_> {
        fn interests(&self) -> &'static [usize] {
            &[0, 1]
        }

        fn run(&mut self, task: &mut Count, _out: &mut Outbox<Count>) -> EngineResult<Flow> {
            self.seen.push(format!("{task:?}"));
            match *task {
                Count::Log(n) if Some(n) == self.stop_at => Ok(Flow::Terminate),
                _ => Ok(Flow::Handled),
            }
        }
    }

    // Registered after a machine that reports every task handled.
    struct Unreachable;

    impl Machine<Count> for Unreachable {
        fn interests(&self) -> &'static [usize] {
            &[0]
        }

        fn run(&mut self, _task: &mut Count, _out: &mut Outbox<Count>) -> EngineResult<Flow> {
            panic!("task passed on after being handled");
        }
    }

    #[test]
    fn test_runs_to_quiescence_in_priority_order() {
        let control = Control::new(None);
        let mut seen = Vec::new();
        {
            let mut weaver = Weaver::new(&control)
                .with_machine(Box::new(Decrement))
                .with_machine(Box::new(Recorder {
                    seen: &mut seen,
                    stop_at: None,
                }))
                .with_machine(Box::new(Unreachable));
            assert_eq!(weaver.phase(), Phase::Idle);
            weaver.push(Count::Number(2));
            assert_eq!(weaver.run().unwrap(), Halt::Quiescent);
            assert_eq!(weaver.phase(), Phase::Done(Halt::Quiescent));
            assert_eq!(weaver.handled(), 6);
        }
        assert_eq!(
            seen,
            vec!["Number(2)", "Log(2)", "Number(1)", "Log(1)", "Number(0)", "Log(0)"]
        );
        assert_eq!(control.pending(), 0);
    }

    #[test]
    fn test_terminate_stops_dispatch() {
        let control = Control::new(None);
        let mut seen = Vec::new();
        {
            let mut weaver = Weaver::new(&control)
                .with_machine(Box::new(Decrement))
                .with_machine(Box::new(Recorder {
                    seen: &mut seen,
                    stop_at: Some(3),
                }));
            weaver.push(Count::Number(5));
            assert_eq!(weaver.run().unwrap(), Halt::Terminated);
        }
        assert!(control.is_terminated());
        assert_eq!(seen.last().map(String::as_str), Some("Log(3)"));
    }

    #[test]
    fn test_cancel_flag() {
        let stop = Arc::new(AtomicBool::new(true));
        let control = Control::new(Some(stop));
        let mut weaver: Weaver<'_, Count> = Weaver::new(&control).with_machine(Box::new(Decrement));
        weaver.push(Count::Number(100));
        assert_eq!(weaver.run().unwrap(), Halt::Cancelled);
        assert_eq!(weaver.handled(), 0);
    }
}
