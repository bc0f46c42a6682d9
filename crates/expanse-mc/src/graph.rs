//! Explicit graphs and a builder that explores them through the heap.
//!
//! Graph text format, one directive per line, `#` starts a comment:
//!
//! ```text
//! init 1
//! 1 -> 2 3
//! 2 -> 3
//! 3 -> 4
//! error 4      # reaching 4 is a violation
//! accept 3
//! fault 2      # entering 2 faults
//! ```
//!
//! The [`GraphBuilder`] keeps the current vertex in heap object `#1`, so
//! every state is a real snapshot and goes through the same canonical
//! compare and hash as any other builder's states.

use crate::builder::Builder;
use crate::error::{source_lines, EngineResult, ParseError};
use crate::state::{Label, State, StateFlags};
use expanse_heap::{CowHeap, HeapLoc, ObjId, Pool, SkipSet, Snapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// A finite directed graph with initial, error, accepting and fault
/// vertices. Out-edges keep their order; an edge's index in that order is
/// its choice label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplicitGraph {
    successors: BTreeMap<u32, Vec<u32>>,
    initials: Vec<u32>,
    errors: BTreeSet<u32>,
    accepting: BTreeSet<u32>,
    faults: BTreeSet<u32>,
}

impl ExplicitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_initial(&mut self, v: u32) {
        self.initials.push(v);
    }

    pub fn add_edge(&mut self, from: u32, to: u32) {
        self.successors.entry(from).or_default().push(to);
    }

    pub fn mark_error(&mut self, v: u32) {
        self.errors.insert(v);
    }

    pub fn mark_accepting(&mut self, v: u32) {
        self.accepting.insert(v);
    }

    pub fn mark_fault(&mut self, v: u32) {
        self.faults.insert(v);
    }

    pub fn initials(&self) -> &[u32] {
        &self.initials
    }

    pub fn successors(&self, v: u32) -> &[u32] {
        self.successors.get(&v).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_error(&self, v: u32) -> bool {
        self.errors.contains(&v)
    }

    pub fn is_accepting(&self, v: u32) -> bool {
        self.accepting.contains(&v)
    }

    pub fn is_fault(&self, v: u32) -> bool {
        self.faults.contains(&v)
    }

    pub fn edge_count(&self) -> usize {
        self.successors.values().map(Vec::len).sum()
    }

    /// Every vertex mentioned anywhere.
    pub fn vertices(&self) -> BTreeSet<u32> {
        let mut all: BTreeSet<u32> = self.initials.iter().copied().collect();
        for (from, tos) in &self.successors {
            all.insert(*from);
            all.extend(tos.iter().copied());
        }
        all.extend(self.errors.iter().copied());
        all.extend(self.accepting.iter().copied());
        all.extend(self.faults.iter().copied());
        all
    }

    /// A random graph on vertices `1..=vertices` with vertex 1 initial.
    ///
    /// A random spanning tree rooted in 1 makes every vertex reachable; the
    /// remaining edges are distinct random pairs. `edges` is clamped to what
    /// the vertex count allows. The same seed always gives the same graph.
    pub fn random(vertices: u32, edges: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut graph = Self::new();
        if vertices == 0 {
            return graph;
        }
        let n = vertices as usize;
        let edges = edges.clamp(n - 1, n * n);

        graph.add_initial(1);
        let mut present = BTreeSet::new();
        for v in 2..=vertices {
            let parent = rng.gen_range(1..v);
            graph.add_edge(parent, v);
            present.insert((parent, v));
        }
        while present.len() < edges {
            let from = rng.gen_range(1..=vertices);
            let to = rng.gen_range(1..=vertices);
            if present.insert((from, to)) {
                graph.add_edge(from, to);
            }
        }
        graph
    }

    pub fn parse(src: &str) -> Result<Self, ParseError> {
        let mut graph = Self::new();
        for (lineno, (line_start, raw)) in source_lines(src).enumerate() {
            let text = raw.split('#').next().unwrap_or("");
            let words: Vec<(usize, &str)> = words_with_offsets(text);
            let Some(&(_, head)) = words.first() else {
                continue;
            };

            let vertex = |(col, word): (usize, &str)| -> Result<u32, ParseError> {
                word.parse().map_err(|_| ParseError {
                    message: format!("expected a vertex number, found '{word}'"),
                    line: lineno + 1,
                    span: line_start + col..line_start + col + word.len(),
                })
            };
            let vertices = |rest: &[(usize, &str)]| -> Result<Vec<u32>, ParseError> {
                rest.iter().map(|&w| vertex(w)).collect()
            };

            match head {
                "init" => vertices(&words[1..])?
                    .into_iter()
                    .for_each(|v| graph.add_initial(v)),
                "error" => vertices(&words[1..])?
                    .into_iter()
                    .for_each(|v| graph.mark_error(v)),
                "accept" => vertices(&words[1..])?
                    .into_iter()
                    .for_each(|v| graph.mark_accepting(v)),
                "fault" => vertices(&words[1..])?
                    .into_iter()
                    .for_each(|v| graph.mark_fault(v)),
                _ => {
                    let from = vertex(words[0])?;
                    match words.get(1) {
                        Some(&(_, "->")) => {}
                        Some(&(col, other)) => {
                            return Err(ParseError {
                                message: format!("expected '->', found '{other}'"),
                                line: lineno + 1,
                                span: line_start + col..line_start + col + other.len(),
                            })
                        }
                        None => {
                            return Err(ParseError {
                                message: "expected '->' after vertex".into(),
                                line: lineno + 1,
                                span: line_start + raw.len()..line_start + raw.len(),
                            })
                        }
                    }
                    for to in vertices(&words[2..])? {
                        graph.add_edge(from, to);
                    }
                }
            }
        }
        Ok(graph)
    }
}

fn words_with_offsets(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                out.push((s, &text[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, &text[s..]));
    }
    out
}

fn write_set(f: &mut fmt::Formatter<'_>, keyword: &str, set: &BTreeSet<u32>) -> fmt::Result {
    if set.is_empty() {
        return Ok(());
    }
    write!(f, "{keyword}")?;
    for v in set {
        write!(f, " {v}")?;
    }
    writeln!(f)
}

impl fmt::Display for ExplicitGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.initials.is_empty() {
            write!(f, "init")?;
            for v in &self.initials {
                write!(f, " {v}")?;
            }
            writeln!(f)?;
        }
        for (from, tos) in &self.successors {
            write!(f, "{from} ->")?;
            for to in tos {
                write!(f, " {to}")?;
            }
            writeln!(f)?;
        }
        write_set(f, "error", &self.errors)?;
        write_set(f, "accept", &self.accepting)?;
        write_set(f, "fault", &self.faults)
    }
}

/// Object holding the current vertex.
pub const VERTEX: ObjId = ObjId::new(1);
/// Object holding the choice that produced the state.
pub const BOOKKEEPING: ObjId = ObjId::new(2);

/// The vertex a [`GraphBuilder`] state stands for.
pub fn vertex_of(state: &State) -> Option<u32> {
    let image = state.snap.get(VERTEX)?;
    let bytes: [u8; 4] = image.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Explores an [`ExplicitGraph`], one heap object per state.
///
/// Entering a fault vertex performs an out-of-bounds heap write; the
/// resulting fault is turned into an error-flagged successor.
#[derive(Clone)]
pub struct GraphBuilder {
    graph: Arc<ExplicitGraph>,
    heap: CowHeap,
    bookkeeping: Option<bool>,
}

impl GraphBuilder {
    pub fn new(graph: ExplicitGraph) -> Self {
        Self::with_pool(graph, Arc::new(Pool::new()))
    }

    pub fn with_pool(graph: ExplicitGraph, pool: Arc<Pool>) -> Self {
        Self {
            graph: Arc::new(graph),
            heap: CowHeap::new(pool),
            bookkeeping: None,
        }
    }

    /// Also record the producing choice in a second object. When `skipped`
    /// it is left out of state identity, otherwise states reached by
    /// different choices stay apart.
    pub fn with_bookkeeping(mut self, skipped: bool) -> Self {
        self.bookkeeping = Some(skipped);
        self
    }

    pub fn graph(&self) -> &ExplicitGraph {
        &self.graph
    }

    fn flags(&self, v: u32) -> StateFlags {
        StateFlags {
            error: self.graph.is_error(v),
            accepting: self.graph.is_accepting(v),
            deadlock: false,
        }
    }

    /// Move the workspace to `to`, starting from the current base.
    fn enter(&mut self, to: u32, choice: u32) -> EngineResult<(State, Label)> {
        let mut label = Label::choice(choice);
        let mut flags = self.flags(to);

        if !self.heap.valid(VERTEX) {
            self.heap.make_hinted(4, VERTEX.raw())?;
        }
        if self.graph.is_fault(to) {
            match self.heap.write_u32(HeapLoc::new(VERTEX, 4), to) {
                Err(e) if e.is_fault() => {
                    flags.error = true;
                    label.error = true;
                    label = label.with_annotation(e.to_string());
                }
                Err(e) => return Err(e.into()),
                Ok(()) => {}
            }
        }
        self.heap.write_u32(HeapLoc::base(VERTEX), to)?;

        if self.bookkeeping.is_some() {
            if !self.heap.valid(BOOKKEEPING) {
                self.heap.make_hinted(4, BOOKKEEPING.raw())?;
            }
            self.heap.write_u32(HeapLoc::base(BOOKKEEPING), choice)?;
        }

        label.accepting = flags.accepting;
        let snap = self.heap.snapshot()?;
        Ok((State::with_flags(snap, flags), label))
    }
}

impl Builder for GraphBuilder {
    fn initials<Y>(&mut self, mut yield_: Y) -> EngineResult<()>
    where
        Y: FnMut(State, Label),
    {
        let graph = Arc::clone(&self.graph);
        for (i, &v) in graph.initials().iter().enumerate() {
            self.heap.restore(&Snapshot::default());
            let (state, label) = self.enter(v, i as u32)?;
            yield_(state, label);
        }
        Ok(())
    }

    fn edges<Y>(&mut self, from: &State, mut yield_: Y) -> EngineResult<()>
    where
        Y: FnMut(State, Label),
    {
        self.heap.restore(&from.snap);
        let v = self.heap.read_u32(HeapLoc::base(VERTEX))?;
        let graph = Arc::clone(&self.graph);
        for (i, &to) in graph.successors(v).iter().enumerate() {
            self.heap.restore(&from.snap);
            let (state, label) = self.enter(to, i as u32)?;
            yield_(state, label);
        }
        Ok(())
    }

    fn skip_ids(&self) -> SkipSet {
        match self.bookkeeping {
            Some(true) => [BOOKKEEPING].into_iter().collect(),
            _ => SkipSet::new(),
        }
    }
}
