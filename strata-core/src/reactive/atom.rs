//! Atom Handles
//!
//! An [`Atom<T>`] is a typed, copyable handle to a node in a [`Graph`]. The
//! value itself lives in the graph; the handle only carries the node's id and
//! the value type.
//!
//! # How Atoms Work
//!
//! 1. A factory on [`Graph`] creates the node and returns its handle. State
//!    atoms also come with a [`Setter<T>`], the only way to write them.
//!
//! 2. Reading goes through the graph (`graph.get(&atom)`) from the outside,
//!    or through a [`Reader`](super::Reader) from inside an evaluation, which
//!    also records the dependency.
//!
//! 3. Once the atom is disposed the handle is stale for good: every read or
//!    write fails with [`Error::Lifecycle`].

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::rc::Rc;

use super::runtime::Graph;
use crate::error::{Error, Result};
use crate::graph::{AtomId, Value};

/// Convert a type-erased value back into the atom's value type.
pub(crate) fn downcast<T: Clone + 'static>(id: AtomId, value: &Value) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or(Error::Lifecycle(id))
}

/// A typed handle to an atom.
pub struct Atom<T> {
    id: AtomId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Atom<T> {
    pub(crate) fn new(id: AtomId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The untyped id of this atom.
    pub fn id(&self) -> AtomId {
        self.id
    }
}

impl<T: Clone + 'static> Atom<T> {
    /// Get the current value. Same as [`Graph::get`].
    pub fn get(&self, graph: &Graph) -> Result<T> {
        graph.get(self)
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Atom<T> {}

impl<T> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Atom<T> {}

impl<T> Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atom").field(&self.id).finish()
    }
}

/// Write access to a state atom.
///
/// # Example
///
/// ```rust,ignore
/// let (count, set_count) = graph.state(0);
///
/// set_count.set(&graph, 5)?;
/// set_count.update(&graph, |v| v + 1)?;
/// assert_eq!(graph.get(&count)?, 6);
/// ```
pub struct Setter<T> {
    id: AtomId,
    _marker: PhantomData<fn(T)>,
}

impl<T> Setter<T> {
    pub(crate) fn new(id: AtomId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The atom this setter writes.
    pub fn atom(&self) -> Atom<T> {
        Atom::new(self.id)
    }
}

impl<T: Clone + PartialEq + 'static> Setter<T> {
    /// Set a new value and notify consumers.
    ///
    /// Writing a value equal to the current one does nothing.
    pub fn set(&self, graph: &Graph, value: T) -> Result<()> {
        graph.write(self.id, Rc::new(value))
    }

    /// Update the value using a function of the current one.
    pub fn update<F>(&self, graph: &Graph, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let current = graph.get(&self.atom())?;
        self.set(graph, f(&current))
    }
}

impl<T> Clone for Setter<T> {
    fn clone(&self) -> Self {
        Self::new(self.id)
    }
}

impl<T> Debug for Setter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Setter").field(&self.id).finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_get_and_set() {
        let graph = Graph::new();
        let (atom, setter) = graph.state(0);
        assert_eq!(atom.get(&graph).unwrap(), 0);

        setter.set(&graph, 42).unwrap();
        assert_eq!(atom.get(&graph).unwrap(), 42);
    }

    #[test]
    fn state_update() {
        let graph = Graph::new();
        let (atom, setter) = graph.state(10);

        setter.update(&graph, |v| v + 5).unwrap();
        assert_eq!(graph.get(&atom).unwrap(), 15);
    }

    #[test]
    fn handles_are_copies_of_the_same_atom() {
        let graph = Graph::new();
        let (atom, setter) = graph.state(String::from("a"));
        let copy = atom;

        setter.set(&graph, String::from("b")).unwrap();
        assert_eq!(copy.get(&graph).unwrap(), "b");
        assert_eq!(setter.atom(), atom);
    }

    #[test]
    fn setter_fails_after_disposal() {
        let graph = Graph::new();
        let (atom, setter) = graph.state(1);
        graph.dispose(&atom);

        assert!(matches!(setter.set(&graph, 2), Err(Error::Lifecycle(_))));
        assert!(matches!(setter.update(&graph, |v| v + 1), Err(Error::Lifecycle(_))));
    }
}
