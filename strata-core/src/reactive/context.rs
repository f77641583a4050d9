//! Evaluation Context
//!
//! While a relay evaluates, it reads other atoms through a [`Reader`]. The
//! reader is how dependencies get recorded: every read confirms or creates a
//! link from the evaluating relay to the atom it read.
//!
//! # Implementation
//!
//! A reader is handed to the evaluation function as `&mut Reader<'_>`. The
//! function cannot keep it past the call, so a reader is only ever used
//! during the evaluation it was created for. Each evaluation also carries a
//! fresh run identity; links confirmed by the reader are stamped with it, and
//! propagation ignores links stamped by an older run.
//!
//! The evaluation is bracketed by an [`EvaluationGuard`]. Dropping the guard
//! clears the reentrancy flag and detaches the source links the evaluation
//! did not confirm, even if the evaluation function panics.

use std::fmt;

use super::atom::{downcast, Atom};
use super::runtime::Graph;
use crate::error::Result;
use crate::graph::AtomId;

/// Read access to other atoms, valid for one evaluation.
pub struct Reader<'g> {
    graph: &'g Graph,
    consumer: AtomId,
    run: u64,
}

impl<'g> Reader<'g> {
    pub(crate) fn new(graph: &'g Graph, consumer: AtomId, run: u64) -> Self {
        Self {
            graph,
            consumer,
            run,
        }
    }

    /// Read an atom and record it as a source of the evaluating relay.
    ///
    /// Relays are brought up to date before their value is returned. Reading
    /// an atom that is itself mid-evaluation fails with
    /// [`Error::CyclicRead`](crate::Error::CyclicRead).
    pub fn read<T: Clone + 'static>(&mut self, atom: &Atom<T>) -> Result<T> {
        let value = self.graph.read_for(self.consumer, self.run, atom.id())?;
        downcast(atom.id(), &value)
    }

    /// Read an atom without recording a dependency.
    pub fn untracked<T: Clone + 'static>(&self, atom: &Atom<T>) -> Result<T> {
        self.graph.get(atom)
    }

    /// The relay being evaluated.
    pub fn consumer(&self) -> AtomId {
        self.consumer
    }

    /// The graph being evaluated.
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }
}

impl fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("consumer", &self.consumer)
            .field("run", &self.run)
            .finish()
    }
}

/// Guard that closes an evaluation when dropped.
pub(crate) struct EvaluationGuard<'g> {
    graph: &'g Graph,
    atom: AtomId,
}

impl<'g> EvaluationGuard<'g> {
    pub fn new(graph: &'g Graph, atom: AtomId) -> Self {
        Self { graph, atom }
    }
}

impl Drop for EvaluationGuard<'_> {
    fn drop(&mut self) {
        let mut store = self.graph.store_mut();
        store.evaluating -= 1;
        if let Some(node) = store.node_mut(self.atom) {
            node.flags.evaluating = false;
        }
        store.detach_stale(self.atom);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
