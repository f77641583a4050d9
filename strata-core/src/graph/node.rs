//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.
//!
//! A node is either a **state** atom, holding a plain value that is written
//! from the outside, or a **relay**-backed atom whose value is a function of
//! other atoms. Relay-backed atoms come in two flavours:
//!
//! - `Derive`: lazily pulled. Only evaluated when something reads it.
//! - `Compute`: eagerly scheduled. Queued in the depth heap whenever it
//!   becomes dirty, and re-notifies its consumers only when its value changes.
//!
//! The payload is a tagged enum, so a state atom carrying a relay (or the
//! other way around) cannot be represented.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use super::link::LinkId;
use crate::error::Result;
use crate::reactive::Reader;

/// Type-erased atom value.
pub(crate) type Value = Rc<dyn Any>;

/// Equality check between two values of the same concrete type.
pub(crate) type EqFn = fn(&dyn Any, &dyn Any) -> bool;

/// Type-erased evaluation function of a relay.
pub(crate) type ComputeFn = Rc<dyn Fn(&mut Reader<'_>) -> Result<Value>>;

/// Monomorphised equality used for change detection.
pub(crate) fn value_eq<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Unique identifier for an atom.
///
/// This is a generational slot handle: `index` addresses the arena slot and
/// `generation` is bumped every time the slot is vacated. A handle whose
/// generation no longer matches refers to a destroyed atom. The `graph` tag
/// keeps handles from being used against a different graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomId {
    graph: u32,
    index: u32,
    generation: u32,
}

impl AtomId {
    pub(crate) fn new(graph: u32, index: u32, generation: u32) -> Self {
        Self {
            graph,
            index,
            generation,
        }
    }

    /// Identifier of the graph that created this atom.
    pub fn graph(&self) -> u32 {
        self.graph
    }

    /// Arena slot of this atom.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Generation of the slot when this atom was created.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}@g{}", self.index, self.generation, self.graph)
    }
}

/// The kind of an atom, as observed from outside the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AtomKind {
    /// A leaf value, written through a setter.
    State,

    /// A lazily pulled computation.
    Derive,

    /// An eagerly scheduled computation.
    Compute,

    /// The atom has been disposed. Terminal.
    Destroyed,
}

/// Bookkeeping flags of a node.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Flags {
    /// The cached value may be stale.
    pub dirty: bool,
    /// The evaluation function is currently running (reentrancy guard).
    pub evaluating: bool,
    /// Bucket of the node's live heap entry. Older entries for the node are
    /// stale and skipped by the drain.
    pub queued: Option<usize>,
    /// The node was visited by the active fallback walk.
    pub in_fallback: bool,
}

/// Computation metadata of a derive or compute atom.
pub(crate) struct Relay {
    /// Topological level. `-1` until the first evaluation.
    pub depth: i32,

    /// Identity of the current (or last) evaluation. Links confirmed during
    /// that evaluation carry the same value.
    pub run: u64,

    /// The evaluation function.
    pub compute: ComputeFn,

    /// Change detection for the cached value.
    pub eq: EqFn,

    /// First link of the source chain, in read order.
    pub source_head: Option<LinkId>,

    /// Last link confirmed by the current evaluation. Everything after it
    /// belongs to the previous evaluation and is still unconfirmed.
    pub source_tail: Option<LinkId>,

    /// Cached outcome of the last evaluation. `None` before the first run.
    pub cached: Option<Result<Value>>,
}

impl Relay {
    pub fn new(compute: ComputeFn, eq: EqFn) -> Self {
        Self {
            depth: -1,
            run: 0,
            compute,
            eq,
            source_head: None,
            source_tail: None,
            cached: None,
        }
    }

    /// Whether the last evaluation failed.
    pub fn has_error(&self) -> bool {
        matches!(self.cached, Some(Err(_)))
    }
}

/// The payload of a node.
pub(crate) enum Body {
    State { value: Value, eq: EqFn },
    Derive(Relay),
    Compute(Relay),
}

/// A node in the dependency graph.
pub(crate) struct Node {
    pub id: AtomId,
    pub body: Body,
    pub flags: Flags,

    /// Head of the consumer ring: links whose source is this node.
    pub consumers: Option<LinkId>,

    /// First and last entries of the subscriber list.
    pub subscribers_head: Option<usize>,
    pub subscribers_tail: Option<usize>,

    /// The atom this node's consistency is bound to.
    pub owner: Option<AtomId>,

    /// Atoms owned by this node; disposed along with it.
    pub owned: SmallVec<[AtomId; 2]>,
}

impl Node {
    pub fn new(id: AtomId, body: Body) -> Self {
        let dirty = !matches!(body, Body::State { .. });
        Self {
            id,
            body,
            flags: Flags {
                dirty,
                ..Flags::default()
            },
            consumers: None,
            subscribers_head: None,
            subscribers_tail: None,
            owner: None,
            owned: SmallVec::new(),
        }
    }

    pub fn kind(&self) -> AtomKind {
        match self.body {
            Body::State { .. } => AtomKind::State,
            Body::Derive(_) => AtomKind::Derive,
            Body::Compute(_) => AtomKind::Compute,
        }
    }

    pub fn relay(&self) -> Option<&Relay> {
        match &self.body {
            Body::Derive(relay) | Body::Compute(relay) => Some(relay),
            Body::State { .. } => None,
        }
    }

    pub fn relay_mut(&mut self) -> Option<&mut Relay> {
        match &mut self.body {
            Body::Derive(relay) | Body::Compute(relay) => Some(relay),
            Body::State { .. } => None,
        }
    }

    /// Compute atoms fold `source + 1`, derive atoms fold `source`.
    pub fn is_compute(&self) -> bool {
        matches!(self.body, Body::Compute(_))
    }

    /// Whether the node is scheduled through the heap when it turns dirty.
    pub fn can_heap(&self) -> bool {
        self.is_compute() && self.owner.is_none()
    }

    /// Topological level; state atoms sit at level 0.
    pub fn depth(&self) -> i32 {
        self.relay().map_or(0, |relay| relay.depth)
    }

    /// Fold a source's depth into this relay's depth.
    pub fn fold_depth(&mut self, source_depth: i32) {
        let step = i32::from(self.is_compute());
        if let Some(relay) = self.relay_mut() {
            relay.depth = relay.depth.max(source_depth + step);
        }
    }

    /// The cached value or error, cloned for a reader.
    pub fn cached(&self) -> Option<Result<Value>> {
        match &self.body {
            Body::State { value, .. } => Some(Ok(Rc::clone(value))),
            Body::Derive(relay) | Body::Compute(relay) => relay.cached.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> Relay {
        let compute: ComputeFn = Rc::new(|_: &mut Reader<'_>| Ok(Rc::new(1_i32) as Value));
        Relay::new(compute, value_eq::<i32>)
    }

    fn id(index: u32) -> AtomId {
        AtomId::new(0, index, 0)
    }

    #[test]
    fn state_node_starts_clean() {
        let node = Node::new(
            id(0),
            Body::State {
                value: Rc::new(1_i32),
                eq: value_eq::<i32>,
            },
        );
        assert_eq!(node.kind(), AtomKind::State);
        assert!(!node.flags.dirty);
        assert_eq!(node.depth(), 0);
    }

    #[test]
    fn relay_nodes_start_dirty_and_uninitialized() {
        let node = Node::new(id(1), Body::Derive(relay()));
        assert_eq!(node.kind(), AtomKind::Derive);
        assert!(node.flags.dirty);
        assert_eq!(node.depth(), -1);
        assert!(node.cached().is_none());
    }

    #[test]
    fn compute_depth_is_strictly_deeper() {
        let mut node = Node::new(id(2), Body::Compute(relay()));
        node.relay_mut().unwrap().depth = 0;

        node.fold_depth(3);
        assert_eq!(node.depth(), 4);

        // A shallower source never lowers the depth
        node.fold_depth(1);
        assert_eq!(node.depth(), 4);
    }

    #[test]
    fn derive_depth_shares_the_deepest_source() {
        let mut node = Node::new(id(3), Body::Derive(relay()));
        node.relay_mut().unwrap().depth = 0;

        node.fold_depth(3);
        node.fold_depth(2);
        assert_eq!(node.depth(), 3);
    }

    #[test]
    fn owned_compute_is_not_heap_eligible() {
        let mut node = Node::new(id(4), Body::Compute(relay()));
        assert!(node.can_heap());

        node.owner = Some(id(5));
        assert!(!node.can_heap());
    }

    #[test]
    fn value_eq_compares_concrete_values() {
        assert!(value_eq::<i32>(&1_i32, &1_i32));
        assert!(!value_eq::<i32>(&1_i32, &2_i32));
        assert!(!value_eq::<i32>(&1_i32, &"one"));
    }

    #[test]
    fn atom_ids_display_slot_and_generation() {
        let atom = AtomId::new(7, 3, 2);
        assert_eq!(atom.to_string(), "#3v2@g7");
        assert_eq!(atom.index(), 3);
        assert_eq!(atom.generation(), 2);
        assert_eq!(atom.graph(), 7);
    }
}
