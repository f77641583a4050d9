//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects state, derive, and
//! compute atoms. It owns the dependency graph and schedules updates when
//! state changes.
//!
//! # How It Works
//!
//! 1. Atoms are created through the factory methods on [`Graph`] and live in
//!    a slab arena owned by that graph.
//!
//! 2. When a relay evaluates, every read through its [`Reader`] confirms or
//!    creates a link to the source, and folds the source's depth into the
//!    relay's own depth.
//!
//! 3. When a state atom is written, the runtime:
//!    a. Notifies the atom's subscribers
//!    b. Marks direct consumers dirty
//!    c. Queues dirty compute atoms in the depth heap
//!    d. Walks through lazy consumers immediately, marking their consumers too
//!
//! 4. `stabilize()` drains the heap in depth order; reading an atom inline
//!    forces only the stale ancestors it actually needs.
//!
//! # Threading
//!
//! A graph is single threaded and `!Send`. All of the bookkeeping that would
//! otherwise be process-wide (heap buckets, the link pool, run counters) is
//! scoped to the [`Graph`] value, so independent graphs never interfere.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use slab::Slab;
use smallvec::{smallvec, SmallVec};

use super::atom::{downcast, Atom, Setter};
use super::channel::ChannelState;
use super::context::Reader;
use super::subscriber::SubscriberTable;
use crate::config::{GraphConfig, GraphStats};
use crate::error::{Error, OwnershipViolation, Result};
use crate::graph::{
    value_eq, AtomId, AtomKind, Body, ComputeFn, DepthHeap, LinkId, LinkPool, Node, Relay, Value,
};

/// Counter for generating unique graph IDs.
static GRAPH_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a new unique graph ID.
fn next_graph_id() -> u32 {
    GRAPH_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Look up a live node, checking graph and generation.
pub(crate) fn lookup(nodes: &Slab<Node>, graph: u32, id: AtomId) -> Option<&Node> {
    if id.graph() != graph {
        return None;
    }
    nodes.get(id.index()).filter(|node| node.id == id)
}

/// Mutable variant of [`lookup`], usable while other store fields are borrowed.
pub(crate) fn lookup_mut(nodes: &mut Slab<Node>, graph: u32, id: AtomId) -> Option<&mut Node> {
    if id.graph() != graph {
        return None;
    }
    nodes.get_mut(id.index()).filter(|node| node.id == id)
}

/// All mutable state of a graph.
///
/// Methods on `Store` never call user code, so they can run under a single
/// `RefCell` borrow. Anything that evaluates a relay or runs a subscriber
/// lives on [`Graph`] and releases the borrow first.
pub(crate) struct Store {
    pub id: u32,
    pub config: GraphConfig,
    pub nodes: Slab<Node>,
    /// Next generation for every slot the arena has ever handed out.
    pub generations: Vec<u32>,
    pub links: LinkPool,
    pub heap: DepthHeap,
    /// Heads of detached source chains, reclaimed by `clean()`.
    pub stale: Vec<LinkId>,
    /// Run identity counter; every evaluation gets a fresh value.
    pub runs: u64,
    /// Evaluations currently on the call stack.
    pub evaluating: usize,
    /// Nesting level of fallback walks.
    pub fallback_depth: usize,
    /// Atoms flagged by the active fallback walk.
    pub fallback_marked: Vec<AtomId>,
    pub subscribers: SubscriberTable,
    pub channels: Slab<ChannelState>,
}

impl Store {
    fn new(config: GraphConfig) -> Self {
        Self {
            id: next_graph_id(),
            nodes: Slab::new(),
            generations: Vec::new(),
            links: LinkPool::with_capacity(config.link_capacity),
            heap: DepthHeap::with_buckets(config.depth_buckets),
            stale: Vec::new(),
            runs: 0,
            evaluating: 0,
            fallback_depth: 0,
            fallback_marked: Vec::new(),
            subscribers: SubscriberTable::default(),
            channels: Slab::new(),
            config,
        }
    }

    pub fn node(&self, id: AtomId) -> Option<&Node> {
        lookup(&self.nodes, self.id, id)
    }

    pub fn node_mut(&mut self, id: AtomId) -> Option<&mut Node> {
        lookup_mut(&mut self.nodes, self.id, id)
    }

    fn insert(&mut self, body: Body) -> AtomId {
        let entry = self.nodes.vacant_entry();
        let index = entry.key();
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 0);
        }
        let id = AtomId::new(self.id, index as u32, self.generations[index]);
        entry.insert(Node::new(id, body));
        id
    }

    pub fn next_run(&mut self) -> u64 {
        self.runs += 1;
        self.runs
    }

    /// Queue a node in the bucket for its current depth.
    ///
    /// A node already queued in that bucket is left alone. A node queued
    /// elsewhere, because its depth changed outside the drain, gets a fresh
    /// entry and the old one goes stale.
    pub fn schedule(&mut self, id: AtomId) {
        let Some(node) = lookup(&self.nodes, self.id, id) else {
            return;
        };
        let depth = node.depth();
        if node.flags.queued == Some(DepthHeap::bucket_of(depth)) {
            return;
        }
        let bucket = self.heap.insert(id, depth);
        if let Some(node) = self.node_mut(id) {
            node.flags.queued = Some(bucket);
        }
    }

    fn write(&mut self, id: AtomId, next: Value) -> Result<()> {
        let node = self.node_mut(id).ok_or(Error::Lifecycle(id))?;
        match &mut node.body {
            Body::State { value, eq } => {
                if (*eq)(&**value, &*next) {
                    return Ok(());
                }
                *value = next;
            }
            Body::Derive(_) | Body::Compute(_) => return Err(Error::Lifecycle(id)),
        }
        self.transmit(id);
        Ok(())
    }

    fn set_owner(&mut self, atom: AtomId, owner: AtomId) -> Result<()> {
        let violation = |reason| Error::Ownership {
            atom,
            owner,
            reason,
        };
        if atom == owner {
            return Err(violation(OwnershipViolation::SelfOwned));
        }
        let owner_node = self.node(owner).ok_or(Error::Lifecycle(owner))?;
        if !owner_node.can_heap() {
            return Err(violation(OwnershipViolation::OwnerNotEager));
        }

        let node = self.node_mut(atom).ok_or(Error::Lifecycle(atom))?;
        if node.owner.is_some() {
            return Err(violation(OwnershipViolation::AlreadyOwned));
        }
        // Its owned atoms would be left with an owner that is no longer eager
        if !node.owned.is_empty() {
            return Err(violation(OwnershipViolation::OwnsOthers));
        }
        node.owner = Some(owner);

        if let Some(owner_node) = self.node_mut(owner) {
            owner_node.owned.push(atom);
        }
        Ok(())
    }

    /// Remove an atom and everything it owns.
    fn dispose(&mut self, root: AtomId) -> bool {
        if self.node(root).is_none() {
            return false;
        }

        let mut pending: SmallVec<[AtomId; 8]> = smallvec![root];
        while let Some(id) = pending.pop() {
            if self.node(id).is_none() {
                continue;
            }
            let node = self.nodes.remove(id.index());
            self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);

            pending.extend(node.owned.iter().copied());
            if let Some(owner) = node.owner {
                if let Some(owner_node) = self.node_mut(owner) {
                    owner_node.owned.retain(|owned| *owned != id);
                }
            }

            // Sever the owning side: the chain is reclaimed by `clean()`,
            // and `transmit` drops its links from live rings as it meets them.
            if let Some(head) = node.relay().and_then(|relay| relay.source_head) {
                self.stale.push(head);
            }

            self.release_subscribers(node.subscribers_head);
            tracing::debug!(atom = %id, "disposed atom");
        }
        true
    }

    fn stats(&self) -> GraphStats {
        GraphStats {
            atoms: self.nodes.len(),
            links_allocated: self.links.allocated(),
            links_live: self.links.live(),
            links_pooled: self.links.pooled(),
            stale_chains: self.stale.len(),
            queued: self.heap.len(),
            subscribers: self.subscribers.len(),
        }
    }
}

/// An incremental computation graph.
///
/// # Example
///
/// ```rust,ignore
/// use strata_core::Graph;
///
/// let graph = Graph::new();
/// let (count, set_count) = graph.state(1);
/// let doubled = graph.derive(move |read| Ok(read.read(&count)? * 2));
///
/// assert_eq!(graph.get(&doubled)?, 2);
/// set_count.set(&graph, 5)?;
/// assert_eq!(graph.get(&doubled)?, 10);
/// ```
pub struct Graph {
    store: RefCell<Store>,
}

impl Graph {
    /// Create a graph with the default configuration.
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    /// Create a graph with the given configuration.
    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            store: RefCell::new(Store::new(config)),
        }
    }

    pub(crate) fn store(&self) -> Ref<'_, Store> {
        self.store.borrow()
    }

    pub(crate) fn store_mut(&self) -> RefMut<'_, Store> {
        self.store.borrow_mut()
    }

    /// Unique identifier of this graph.
    pub fn id(&self) -> u32 {
        self.store().id
    }

    // ------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------

    /// Create a state atom and the setter that writes it.
    pub fn state<T>(&self, initial: T) -> (Atom<T>, Setter<T>)
    where
        T: Clone + PartialEq + 'static,
    {
        let id = self.store_mut().insert(Body::State {
            value: Rc::new(initial),
            eq: value_eq::<T>,
        });
        (Atom::new(id), Setter::new(id))
    }

    /// Create a lazily pulled atom. The function runs on first read.
    pub fn derive<T, F>(&self, f: F) -> Atom<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(&mut Reader<'_>) -> Result<T> + 'static,
    {
        let relay = Relay::new(erase(f), value_eq::<T>);
        Atom::new(self.store_mut().insert(Body::Derive(relay)))
    }

    /// Create an eagerly scheduled atom. It is queued right away and runs on
    /// the next `stabilize()` or read.
    pub fn compute<T, F>(&self, f: F) -> Atom<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(&mut Reader<'_>) -> Result<T> + 'static,
    {
        let relay = Relay::new(erase(f), value_eq::<T>);
        let mut store = self.store_mut();
        let id = store.insert(Body::Compute(relay));
        store.schedule(id);
        Atom::new(id)
    }

    // ------------------------------------------------------------------
    // Reading and writing
    // ------------------------------------------------------------------

    /// Get the atom's current, consistent value.
    ///
    /// Relays are brought up to date first. A cached evaluation failure is
    /// returned as the same error until a source changes.
    pub fn get<T: Clone + 'static>(&self, atom: &Atom<T>) -> Result<T> {
        let value = self.pull(atom.id())?;
        downcast(atom.id(), &value)
    }

    /// Untyped read shared by `get` and the reader.
    pub(crate) fn pull(&self, id: AtomId) -> Result<Value> {
        let (owner, is_relay) = {
            let store = self.store();
            let node = store.node(id).ok_or(Error::Lifecycle(id))?;
            if node.flags.evaluating {
                return Err(Error::CyclicRead(id));
            }
            (node.owner, node.relay().is_some())
        };

        if let Some(owner) = owner {
            self.stabilize_relay(owner);
        }
        if is_relay {
            self.stabilize_relay(id);
        }

        let store = self.store();
        let node = store.node(id).ok_or(Error::Lifecycle(id))?;
        node.cached().unwrap_or(Err(Error::Lifecycle(id)))
    }

    pub(crate) fn write(&self, id: AtomId, value: Value) -> Result<()> {
        self.store_mut().write(id, value)
    }

    // ------------------------------------------------------------------
    // Ownership and disposal
    // ------------------------------------------------------------------

    /// Bind `atom`'s consistency to `owner`.
    ///
    /// Reading an owned atom stabilizes its owner first. The owner must be an
    /// unowned compute atom, and an atom can have only one owner.
    pub fn set_owner<T, U>(&self, atom: &Atom<T>, owner: &Atom<U>) -> Result<()> {
        self.store_mut().set_owner(atom.id(), owner.id())
    }

    /// Destroy an atom and every atom it owns.
    ///
    /// Returns `false` if the atom was already gone.
    pub fn dispose<T>(&self, atom: &Atom<T>) -> bool {
        self.store_mut().dispose(atom.id())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// The atom's kind, or `Destroyed` for a stale handle.
    pub fn kind(&self, id: AtomId) -> AtomKind {
        self.store()
            .node(id)
            .map_or(AtomKind::Destroyed, |node| node.kind())
    }

    /// Topological depth. State atoms report 0, relays that never ran -1.
    pub fn depth(&self, id: AtomId) -> Option<i32> {
        self.store().node(id).map(|node| node.depth())
    }

    /// Whether the atom is marked dirty.
    pub fn is_dirty(&self, id: AtomId) -> bool {
        self.store().node(id).is_some_and(|node| node.flags.dirty)
    }

    /// Whether the relay's cached outcome is an error.
    pub fn has_error(&self, id: AtomId) -> bool {
        self.store()
            .node(id)
            .and_then(|node| node.relay())
            .is_some_and(|relay| relay.has_error())
    }

    /// Sources the relay read during its last evaluation, in read order.
    pub fn sources(&self, id: AtomId) -> Vec<AtomId> {
        let store = self.store();
        let mut out = Vec::new();
        let mut cursor = store
            .node(id)
            .and_then(|node| node.relay())
            .and_then(|relay| relay.source_head);
        while let Some(link) = cursor {
            out.push(store.links[link].source);
            cursor = store.links[link].next_source;
        }
        out
    }

    /// Snapshot of the graph's bookkeeping.
    pub fn stats(&self) -> GraphStats {
        self.store().stats()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Box a typed evaluation function behind the type-erased relay signature.
fn erase<T, F>(f: F) -> ComputeFn
where
    T: 'static,
    F: Fn(&mut Reader<'_>) -> Result<T> + 'static,
{
    Rc::new(move |reader: &mut Reader<'_>| f(reader).map(|value| Rc::new(value) as Value))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
