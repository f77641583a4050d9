//! Change Propagation
//!
//! `transmit` is the push half of the engine. It runs whenever a state atom
//! is written or a compute atom settles on a new value, and marks everything
//! downstream that may now be stale.
//!
//! # How It Works
//!
//! Starting from the changed atom's consumer ring:
//!
//! 1. Links whose consumer is gone are taken off the ring.
//! 2. Links the consumer did not confirm in its latest evaluation are
//!    skipped; they belong to a dependency that no longer exists.
//! 3. Consumers already dirty are skipped; their consumers were reached when
//!    they turned dirty.
//! 4. Anything else is marked dirty. Unowned compute atoms are queued in the
//!    depth heap and the walk stops there; they push further only if their
//!    value actually changes. Derive and owned atoms cannot be scheduled, so
//!    the walk continues through their consumers right away.
//!
//! The walk uses an explicit stack, so deep chains of lazy atoms do not grow
//! the call stack.

use smallvec::SmallVec;

use super::runtime::{lookup_mut, Store};
use crate::graph::{AtomId, LinkId};

impl Store {
    /// Mark everything downstream of `origin` dirty.
    pub fn transmit(&mut self, origin: AtomId) {
        self.emit(origin);

        let mut stack: SmallVec<[LinkId; 16]> = SmallVec::new();
        if let Some(head) = self.node(origin).and_then(|node| node.consumers) {
            stack.push(head);
        }

        while let Some(id) = stack.pop() {
            let link = &self.links[id];
            let (consumer, version) = (link.consumer, link.version);
            if let Some(next) = link.next_consumer {
                stack.push(next);
            }

            let Some(node) = lookup_mut(&mut self.nodes, self.id, consumer) else {
                self.unlink_from_source(id);
                continue;
            };

            let confirmed = node.relay().is_some_and(|relay| relay.run == version);
            if !confirmed || node.flags.dirty {
                continue;
            }
            node.flags.dirty = true;

            if node.can_heap() {
                self.schedule(consumer);
            } else {
                let ring = node.consumers;
                self.emit(consumer);
                if let Some(ring) = ring {
                    stack.push(ring);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::reactive::Graph;

    #[test]
    fn write_marks_the_lazy_chain_dirty() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(1);
        let b = graph.derive(move |r| Ok(r.read(&a)? + 1));
        let c = graph.derive(move |r| Ok(r.read(&b)? + 1));
        assert_eq!(graph.get(&c).unwrap(), 3);

        set_a.set(&graph, 5).unwrap();
        assert!(graph.is_dirty(b.id()));
        assert!(graph.is_dirty(c.id()));
        assert_eq!(graph.stats().queued, 0);
    }

    #[test]
    fn compute_consumers_are_queued_not_walked() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(1);
        let b = graph.compute(move |r| Ok(r.read(&a)? + 1));
        let c = graph.derive(move |r| Ok(r.read(&b)? + 1));
        graph.stabilize();
        assert_eq!(graph.get(&c).unwrap(), 3);

        set_a.set(&graph, 5).unwrap();
        assert!(graph.is_dirty(b.id()));
        assert!(!graph.is_dirty(c.id()));
        assert_eq!(graph.stats().queued, 1);

        graph.stabilize();
        assert!(graph.is_dirty(c.id()));
        assert_eq!(graph.get(&c).unwrap(), 7);
    }

    #[test]
    fn unchanged_compute_stops_propagation() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(1);
        let parity = graph.compute(move |r| Ok(r.read(&a)? % 2));
        let label = graph.derive(move |r| Ok(if r.read(&parity)? == 0 { "even" } else { "odd" }));
        graph.stabilize();
        assert_eq!(graph.get(&label).unwrap(), "odd");

        set_a.set(&graph, 3).unwrap();
        graph.stabilize();
        assert!(!graph.is_dirty(label.id()));
    }

    #[test]
    fn equal_write_is_a_no_op() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(String::from("x"));
        let len = graph.derive(move |r| Ok(r.read(&a)?.len()));
        graph.get(&len).unwrap();

        set_a.set(&graph, String::from("x")).unwrap();
        assert!(!graph.is_dirty(len.id()));
    }

    #[test]
    fn owned_compute_is_walked_through() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(1);
        let owner = graph.compute(|_| Ok(()));
        let inner = graph.compute(move |r| Ok(r.read(&a)? * 2));
        let outer = graph.derive(move |r| Ok(r.read(&inner)? + 1));
        graph.set_owner(&inner, &owner).unwrap();
        graph.stabilize();
        assert_eq!(graph.get(&outer).unwrap(), 3);

        set_a.set(&graph, 2).unwrap();
        assert!(graph.is_dirty(inner.id()));
        assert!(graph.is_dirty(outer.id()));
        assert_eq!(graph.stats().queued, 0);
        assert_eq!(graph.get(&outer).unwrap(), 5);
    }
}
