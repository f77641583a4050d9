//! Subscribers
//!
//! A subscriber is a handler attached to an atom. It is never called during
//! propagation. Propagation only *triggers* it, which queues it on its
//! [`Channel`](super::Channel), and the handler runs when that channel is run
//! from the outside.
//!
//! # Layout
//!
//! Entries live in a slab. Each atom threads its entries on a doubly linked
//! list (`subscribers_head` / `subscribers_tail` on the node), so
//! subscribing appends in O(1).
//!
//! Disposing a [`Subscription`] only tombstones the entry. The next emission
//! walk over the atom's list splices tombstones out; an entry still sitting
//! in a channel queue is freed by the channel once it gets there.

use std::fmt;
use std::rc::Rc;

use slab::Slab;

use super::atom::Atom;
use super::channel::Channel;
use super::runtime::{lookup_mut, Graph, Store};
use crate::error::{Error, Result};
use crate::graph::AtomId;

/// Type-erased subscriber callback.
pub(crate) type Handler = Rc<dyn Fn(&Graph) -> Result<()>>;

pub(crate) struct SubscriberEntry {
    pub serial: u64,
    pub atom: AtomId,
    pub channel: usize,
    pub handler: Handler,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    /// Tombstoned by its subscription or by disposal of the atom.
    pub removed: bool,
    /// Waiting in its channel's queue.
    pub queued: bool,
    /// No longer on the atom's list.
    pub detached: bool,
}

/// All subscriber entries of a graph.
#[derive(Default)]
pub(crate) struct SubscriberTable {
    pub entries: Slab<SubscriberEntry>,
    serial: u64,
}

impl SubscriberTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Free an entry once it is both off its atom's list and out of its
    /// channel's queue.
    pub fn release_if_idle(&mut self, key: usize) {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.detached && !entry.queued)
        {
            self.entries.remove(key);
        }
    }
}

/// Handle to a subscription, returned by [`Graph::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::dispose`] to end it.
#[must_use = "a subscription stays active until it is disposed"]
pub struct Subscription {
    graph: u32,
    key: usize,
    serial: u64,
    atom: AtomId,
}

impl Subscription {
    /// The atom this subscription watches.
    pub fn atom(&self) -> AtomId {
        self.atom
    }

    /// Stop delivering to this handler.
    ///
    /// Returns `false` if the subscription had already ended, for instance
    /// because its atom was disposed.
    pub fn dispose(self, graph: &Graph) -> bool {
        let mut store = graph.store_mut();
        if store.id != self.graph {
            return false;
        }
        match store.subscribers.entries.get_mut(self.key) {
            Some(entry) if entry.serial == self.serial && !entry.removed => {
                entry.removed = true;
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("atom", &self.atom)
            .field("key", &self.key)
            .finish()
    }
}

impl Store {
    fn add_subscriber(
        &mut self,
        atom: AtomId,
        channel: usize,
        handler: Handler,
    ) -> Result<Subscription> {
        let node = lookup_mut(&mut self.nodes, self.id, atom).ok_or(Error::Lifecycle(atom))?;

        self.subscribers.serial += 1;
        let serial = self.subscribers.serial;
        let tail = node.subscribers_tail;
        let key = self.subscribers.entries.insert(SubscriberEntry {
            serial,
            atom,
            channel,
            handler,
            prev: tail,
            next: None,
            removed: false,
            queued: false,
            detached: false,
        });

        match tail {
            Some(tail) => self.subscribers.entries[tail].next = Some(key),
            None => node.subscribers_head = Some(key),
        }
        node.subscribers_tail = Some(key);

        Ok(Subscription {
            graph: self.id,
            key,
            serial,
            atom,
        })
    }

    /// Trigger the subscribers of `atom`.
    ///
    /// Live entries not already queued join their channel's queue; tombstones
    /// met on the way are spliced out.
    pub fn emit(&mut self, atom: AtomId) {
        let mut cursor = match self.node(atom) {
            Some(node) => node.subscribers_head,
            None => return,
        };

        while let Some(key) = cursor {
            let entry = &mut self.subscribers.entries[key];
            cursor = entry.next;

            if entry.removed {
                self.splice_subscriber(atom, key);
                continue;
            }
            if entry.queued {
                continue;
            }
            if let Some(channel) = self.channels.get_mut(entry.channel) {
                entry.queued = true;
                channel.queue.push_back(key);
            }
        }
    }

    /// Take a tombstoned entry off its atom's list.
    fn splice_subscriber(&mut self, atom: AtomId, key: usize) {
        let (prev, next) = {
            let entry = &mut self.subscribers.entries[key];
            entry.detached = true;
            (entry.prev.take(), entry.next.take())
        };

        let Some(node) = lookup_mut(&mut self.nodes, self.id, atom) else {
            return;
        };
        match prev {
            Some(prev) => self.subscribers.entries[prev].next = next,
            None => node.subscribers_head = next,
        }
        match next {
            Some(next) => self.subscribers.entries[next].prev = prev,
            None => node.subscribers_tail = prev,
        }

        self.subscribers.release_if_idle(key);
    }

    /// End every subscription on a list whose atom is gone.
    pub fn release_subscribers(&mut self, head: Option<usize>) {
        let mut cursor = head;
        while let Some(key) = cursor {
            let entry = &mut self.subscribers.entries[key];
            cursor = entry.next.take();
            entry.prev = None;
            entry.removed = true;
            entry.detached = true;
            self.subscribers.release_if_idle(key);
        }
    }
}

impl Graph {
    /// Attach `handler` to `atom`, delivering through `channel`.
    ///
    /// The handler is queued whenever the atom changes (or, for derive and
    /// owned atoms, turns dirty) and runs on the next
    /// [`Channel::run`](super::Channel::run).
    ///
    /// Fails with [`Error::ForeignChannel`] if `channel` was created by a
    /// different graph.
    pub fn subscribe<T, F>(
        &self,
        channel: &Channel,
        atom: &Atom<T>,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(&Graph) -> Result<()> + 'static,
    {
        let mut store = self.store_mut();
        if channel.graph() != store.id {
            return Err(Error::ForeignChannel(*channel));
        }
        store.add_subscriber(atom.id(), channel.key(), Rc::new(handler))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn list(graph: &Graph, atom: AtomId) -> Vec<usize> {
        let store = graph.store();
        let mut out = Vec::new();
        let mut cursor = store.node(atom).and_then(|node| node.subscribers_head);
        while let Some(key) = cursor {
            out.push(key);
            cursor = store.subscribers.entries[key].next;
        }
        out
    }

    #[test]
    fn subscribers_append_in_order() {
        let graph = Graph::new();
        let channel = graph.channel();
        let (a, _) = graph.state(0);

        let first = graph.subscribe(&channel, &a, |_| Ok(())).unwrap();
        let second = graph.subscribe(&channel, &a, |_| Ok(())).unwrap();

        assert_eq!(list(&graph, a.id()), vec![first.key, second.key]);
        assert_eq!(first.atom(), a.id());
        assert_eq!(graph.stats().subscribers, 2);
    }

    #[test]
    fn tombstones_are_spliced_on_the_next_emission() {
        let graph = Graph::new();
        let channel = graph.channel();
        let (a, set_a) = graph.state(0);

        let first = graph.subscribe(&channel, &a, |_| Ok(())).unwrap();
        let second = graph.subscribe(&channel, &a, |_| Ok(())).unwrap();
        let third = graph.subscribe(&channel, &a, |_| Ok(())).unwrap();
        let (middle, last) = (second.key, third.key);

        assert!(second.dispose(&graph));
        // Still on the list until something walks it
        assert_eq!(list(&graph, a.id()).len(), 3);

        set_a.set(&graph, 1).unwrap();
        assert_eq!(list(&graph, a.id()), vec![first.key, last]);
        assert_eq!(graph.stats().subscribers, 2);
        assert!(graph.store().subscribers.entries.get(middle).is_none());

        // Removing the tail keeps the list consistent
        assert!(third.dispose(&graph));
        set_a.set(&graph, 2).unwrap();
        assert_eq!(list(&graph, a.id()), vec![first.key]);
        let _ = graph.subscribe(&channel, &a, |_| Ok(())).unwrap();
        assert_eq!(list(&graph, a.id()).len(), 2);
    }

    #[test]
    fn disposing_twice_reports_false() {
        let graph = Graph::new();
        let channel = graph.channel();
        let (a, _) = graph.state(0);

        let sub = graph.subscribe(&channel, &a, |_| Ok(())).unwrap();
        let again = Subscription {
            graph: sub.graph,
            key: sub.key,
            serial: sub.serial,
            atom: sub.atom,
        };
        assert!(sub.dispose(&graph));
        assert!(!again.dispose(&graph));
    }

    #[test]
    fn subscribing_to_a_disposed_atom_fails() {
        let graph = Graph::new();
        let channel = graph.channel();
        let (a, _) = graph.state(0);
        graph.dispose(&a);

        assert!(matches!(
            graph.subscribe(&channel, &a, |_| Ok(())),
            Err(Error::Lifecycle(_))
        ));
    }

    #[test]
    fn disposing_the_atom_releases_its_subscribers() {
        let graph = Graph::new();
        let channel = graph.channel();
        let (a, _) = graph.state(0);
        let sub = graph.subscribe(&channel, &a, |_| Ok(())).unwrap();

        graph.dispose(&a);
        assert_eq!(graph.stats().subscribers, 0);
        assert!(!sub.dispose(&graph));
    }

    #[test]
    fn foreign_channels_are_rejected() {
        let g1 = Graph::new();
        let g2 = Graph::new();
        let channel = g1.channel();
        let (a, _) = g2.state(0);

        let result = g2.subscribe(&channel, &a, |_| Ok(()));
        assert!(matches!(result, Err(Error::ForeignChannel(c)) if c == channel));
        assert_eq!(g2.stats().subscribers, 0);
    }
}
