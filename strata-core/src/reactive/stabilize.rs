//! Stabilization
//!
//! The pull half of the engine: bringing dirty relays up to date in an order
//! that never lets a relay observe a half-updated set of sources.
//!
//! # How It Works
//!
//! There are two ways in.
//!
//! **The heap drain.** `stabilize()` pops dirty compute atoms from the depth
//! heap, shallowest first, and evaluates each one. Every atom is evaluated
//! after all queued atoms at lower depths, so by the time it runs its sources
//! are consistent. Atoms whose depth grew since they were queued are moved to
//! their new bucket instead of evaluated.
//!
//! **Inline reads.** Reading a relay (`get`, or a read inside another
//! evaluation) while the heap still holds entries at or below the relay's
//! depth cannot simply evaluate it: a queued ancestor might not have run yet.
//! The fallback walk handles this:
//!
//! 1. Walk the relay's current source chain depth first, using an explicit
//!    stack of `(atom, cursor)` frames.
//! 2. Descend into every unowned relay source whose depth the heap still
//!    covers, or that is dirty and queued, flagging it `in_fallback` so
//!    shared ancestors are visited once.
//! 3. On the way back up, evaluate each visited atom that is (or has become)
//!    dirty, then finally the relay itself.
//!
//! The flags are cleared in bulk when the outermost walk finishes.
//!
//! # Evaluation
//!
//! `receive` runs a relay's function with a fresh [`Reader`] and run
//! identity, then settles the outcome. A compute atom whose value changed (or
//! failed) transmits to its consumers; a derive atom just caches the result.
//!
//! If the evaluation left the relay deeper than before, the new depth is
//! pushed down its consumer rings first, even when the value is unchanged.
//! Otherwise a consumer could keep a depth at or below its ancestor's and be
//! drained before it.

use smallvec::{smallvec, SmallVec};

use super::context::{EvaluationGuard, Reader};
use super::runtime::{lookup, lookup_mut, Graph, Store};
use crate::error::{Error, Result};
use crate::graph::{AtomId, DepthHeap, LinkId, Value};

/// One level of the fallback walk.
struct Frame {
    atom: AtomId,
    /// Next link of `atom`'s source chain to inspect.
    cursor: Option<LinkId>,
}

/// Closes a fallback walk when dropped.
struct FallbackScope<'g> {
    graph: &'g Graph,
}

impl<'g> FallbackScope<'g> {
    fn enter(graph: &'g Graph) -> Self {
        graph.store_mut().fallback_depth += 1;
        Self { graph }
    }
}

impl Drop for FallbackScope<'_> {
    fn drop(&mut self) {
        let mut store = self.graph.store_mut();
        store.fallback_depth -= 1;
        if store.fallback_depth == 0 {
            store.clear_fallback_marks();
        }
    }
}

impl Store {
    /// Flag an atom as visited by the active fallback walk.
    fn mark_fallback(&mut self, id: AtomId) {
        if let Some(node) = self.node_mut(id) {
            node.flags.in_fallback = true;
            self.fallback_marked.push(id);
        }
    }

    fn clear_fallback_marks(&mut self) {
        for id in std::mem::take(&mut self.fallback_marked) {
            if let Some(node) = self.node_mut(id) {
                node.flags.in_fallback = false;
            }
        }
    }

    fn source_head(&self, id: AtomId) -> Option<LinkId> {
        self.node(id)
            .and_then(|node| node.relay())
            .and_then(|relay| relay.source_head)
    }

    /// Advance a frame to the next source the walk has to descend into.
    fn fallback_step(&mut self, frame: &mut Frame) -> Option<AtomId> {
        while let Some(id) = frame.cursor {
            let source = self.links[id].source;
            frame.cursor = self.links[id].next_source;

            let descend = lookup(&self.nodes, self.id, source).is_some_and(|node| {
                let queued = node.flags.dirty && node.flags.queued.is_some();
                node.relay().is_some()
                    && node.owner.is_none()
                    && !node.flags.in_fallback
                    && !node.flags.evaluating
                    && (queued || self.heap.covers(node.depth()))
            });
            if descend {
                self.mark_fallback(source);
                return Some(source);
            }
        }
        None
    }

    /// Raise the depth of everything downstream of `origin` after its own
    /// depth grew, so no consumer shares a bucket with its ancestor.
    ///
    /// Consumers of atoms `origin` owns fold its depth too. Queued consumers
    /// keep their entry; the drain moves them when it pops it.
    fn deepen_consumers(&mut self, origin: AtomId) {
        let mut stack: SmallVec<[AtomId; 16]> = smallvec![origin];
        while let Some(source) = stack.pop() {
            let Some(node) = self.node(source) else {
                continue;
            };
            let depth = node.depth();
            let mut rings: SmallVec<[LinkId; 4]> = node.consumers.into_iter().collect();
            rings.extend(
                node.owned
                    .iter()
                    .filter_map(|owned| self.node(*owned))
                    .filter_map(|owned| owned.consumers),
            );

            for head in rings {
                let mut cursor = Some(head);
                while let Some(id) = cursor {
                    let link = &self.links[id];
                    let (consumer, version) = (link.consumer, link.version);
                    cursor = link.next_consumer;

                    let Some(node) = lookup_mut(&mut self.nodes, self.id, consumer) else {
                        continue;
                    };
                    if !node.relay().is_some_and(|relay| relay.run == version) {
                        continue;
                    }
                    let before = node.depth();
                    node.fold_depth(depth);
                    if node.depth() > before {
                        stack.push(consumer);
                    }
                }
            }
        }
    }

    /// Cache an evaluation outcome. Compute atoms transmit when it changed.
    fn settle(&mut self, id: AtomId, outcome: Result<Value>) {
        let Some(node) = lookup_mut(&mut self.nodes, self.id, id) else {
            return;
        };
        let is_compute = node.is_compute();
        let Some(relay) = node.relay_mut() else {
            return;
        };

        let changed = match (&relay.cached, &outcome) {
            (Some(Ok(old)), Ok(new)) => !(relay.eq)(&**old, &**new),
            _ => true,
        };
        if !changed {
            return;
        }
        if let Err(error) = &outcome {
            tracing::trace!(atom = %id, %error, "evaluation failed");
        }
        relay.cached = Some(outcome);

        if is_compute {
            self.transmit(id);
        }
    }
}

impl Graph {
    /// Evaluate every queued compute atom, in depth order.
    ///
    /// Calling this from inside an evaluation does nothing; the reads of the
    /// running evaluation already keep it consistent.
    pub fn stabilize(&self) {
        if self.store().evaluating > 0 {
            return;
        }

        let mut evaluated = 0usize;
        let mut moved = 0usize;
        loop {
            let target = {
                let mut store = self.store_mut();
                let Some((bucket, id)) = store.heap.pop() else {
                    break;
                };
                let Some(node) = store.node_mut(id) else {
                    continue;
                };
                // Superseded by a newer entry
                if node.flags.queued != Some(bucket) {
                    continue;
                }
                node.flags.queued = None;
                if !node.flags.dirty {
                    continue;
                }
                if DepthHeap::bucket_of(node.depth()) != bucket {
                    store.schedule(id);
                    moved += 1;
                    continue;
                }
                id
            };
            self.receive(target);
            evaluated += 1;
        }

        let mut store = self.store_mut();
        let threshold = store.config.auto_clean_threshold;
        let reclaimed = match threshold {
            Some(threshold) if store.stale.len() >= threshold => store.clean(),
            _ => 0,
        };
        tracing::debug!(evaluated, moved, reclaimed, "stabilized");
    }

    /// Bring a single relay up to date, walking its ancestors first when the
    /// heap could still hold one of them.
    pub(crate) fn stabilize_relay(&self, id: AtomId) {
        let (walk, dirty) = {
            let store = self.store();
            let Some(node) = store.node(id) else {
                return;
            };
            if node.relay().is_none() || node.flags.evaluating {
                return;
            }
            let walk = !node.flags.in_fallback && store.heap.covers(node.depth());
            (walk, node.flags.dirty)
        };

        if walk {
            self.fallback(id);
        } else if dirty {
            self.receive(id);
        }
    }

    fn fallback(&self, target: AtomId) {
        let _scope = FallbackScope::enter(self);

        let mut stack: SmallVec<[Frame; 16]> = SmallVec::new();
        {
            let mut store = self.store_mut();
            store.mark_fallback(target);
            let cursor = store.source_head(target);
            stack.push(Frame {
                atom: target,
                cursor,
            });
        }

        while let Some(frame) = stack.last_mut() {
            let next = self.store_mut().fallback_step(frame);
            match next {
                Some(source) => {
                    let cursor = self.store().source_head(source);
                    stack.push(Frame {
                        atom: source,
                        cursor,
                    });
                }
                None => {
                    let atom = frame.atom;
                    stack.pop();
                    let due = self
                        .store()
                        .node(atom)
                        .is_some_and(|node| node.flags.dirty && !node.flags.evaluating);
                    if due {
                        self.receive(atom);
                    }
                }
            }
        }
    }

    /// Evaluate a relay and settle its outcome.
    fn receive(&self, id: AtomId) {
        let (compute, run, previous) = {
            let mut store = self.store_mut();
            let run = store.next_run();
            let Some(node) = store.node_mut(id) else {
                return;
            };
            if node.flags.evaluating {
                return;
            }
            let (compute, previous) = match node.relay_mut() {
                Some(relay) => {
                    let previous = relay.depth;
                    relay.run = run;
                    relay.source_tail = None;
                    relay.depth = 0;
                    (relay.compute.clone(), previous)
                }
                None => return,
            };
            node.flags.dirty = false;
            node.flags.evaluating = true;
            store.evaluating += 1;
            (compute, run, previous)
        };
        tracing::trace!(atom = %id, run, "evaluating");

        let outcome = {
            let _guard = EvaluationGuard::new(self, id);
            let mut reader = Reader::new(self, id, run);
            compute(&mut reader)
        };

        let mut store = self.store_mut();
        if store.node(id).is_some_and(|node| node.depth() > previous) {
            store.deepen_consumers(id);
        }
        store.settle(id, outcome);
    }

    /// Read `source` on behalf of the evaluation `run` of `consumer`.
    pub(crate) fn read_for(&self, consumer: AtomId, run: u64, source: AtomId) -> Result<Value> {
        let (owner, is_relay) = {
            let store = self.store();
            let node = store.node(consumer).ok_or(Error::Lifecycle(consumer))?;
            debug_assert!(
                node.relay().is_some_and(|relay| relay.run == run),
                "reader used outside its evaluation"
            );
            let source_node = store.node(source).ok_or(Error::Lifecycle(source))?;
            if source_node.flags.evaluating {
                return Err(Error::CyclicRead(source));
            }
            (source_node.owner, source_node.relay().is_some())
        };

        if let Some(owner) = owner {
            self.stabilize_relay(owner);
        }
        if is_relay {
            self.stabilize_relay(source);
        }

        let mut store = self.store_mut();
        let source_node = store.node(source).ok_or(Error::Lifecycle(source))?;
        let value = source_node.cached().unwrap_or(Err(Error::Lifecycle(source)));
        let folded = match owner {
            Some(owner) => store.node(owner).map(|node| node.depth()),
            None if is_relay => Some(source_node.depth()),
            None => None,
        };

        store.link(consumer, source, run)?;
        if let Some(depth) = folded {
            if let Some(node) = store.node_mut(consumer) {
                node.fold_depth(depth);
            }
        }
        value
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::reactive::Atom;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn counter() -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
        let count = Rc::new(Cell::new(0));
        (count.clone(), count)
    }

    #[test]
    fn diamond_evaluates_the_join_once() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(1);
        let b = graph.compute(move |r| Ok(r.read(&a)? + 1));
        let c = graph.compute(move |r| Ok(r.read(&a)? * 10));
        let (runs, runs_clone) = counter();
        let d = graph.compute(move |r| {
            runs_clone.set(runs_clone.get() + 1);
            Ok((r.read(&b)?, r.read(&c)?))
        });

        graph.stabilize();
        assert_eq!(graph.get(&d).unwrap(), (2, 10));
        assert_eq!(runs.get(), 1);

        set_a.set(&graph, 2).unwrap();
        graph.stabilize();
        assert_eq!(graph.get(&d).unwrap(), (3, 20));
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn compute_is_deeper_than_its_sources() {
        let graph = Graph::new();
        let (a, _) = graph.state(1);
        let b = graph.compute(move |r| r.read(&a));
        let c = graph.derive(move |r| r.read(&b));
        let d = graph.compute(move |r| r.read(&c));
        graph.stabilize();

        assert_eq!(graph.depth(b.id()), Some(0));
        assert_eq!(graph.depth(c.id()), Some(0));
        assert_eq!(graph.depth(d.id()), Some(1));
    }

    #[test]
    fn inline_read_walks_queued_ancestors() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(1);
        let b = graph.compute(move |r| Ok(r.read(&a)? + 1));
        let c = graph.compute(move |r| Ok(r.read(&a)? + 2));
        let (runs, runs_clone) = counter();
        let d = graph.compute(move |r| {
            runs_clone.set(runs_clone.get() + 1);
            Ok(r.read(&b)? + r.read(&c)?)
        });
        graph.stabilize();
        assert_eq!(runs.get(), 1);

        // `b` and `c` are queued; `d` is not dirty yet
        set_a.set(&graph, 10).unwrap();
        assert!(!graph.is_dirty(d.id()));

        assert_eq!(graph.get(&d).unwrap(), 23);
        assert_eq!(runs.get(), 2);

        // The drain finds nothing left to do
        graph.stabilize();
        assert_eq!(runs.get(), 2);
        assert_eq!(graph.stats().queued, 0);
    }

    #[test]
    fn fallback_marks_are_cleared() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(1);
        let b = graph.compute(move |r| Ok(r.read(&a)? + 1));
        let c = graph.derive(move |r| Ok(r.read(&b)? + 1));
        graph.stabilize();
        graph.get(&c).unwrap();

        set_a.set(&graph, 2).unwrap();
        assert_eq!(graph.get(&c).unwrap(), 4);

        let store = graph.store();
        assert!(store.fallback_marked.is_empty());
        assert_eq!(store.fallback_depth, 0);
        assert!(store.nodes.iter().all(|(_, node)| !node.flags.in_fallback));
    }

    #[test]
    fn depth_grows_with_deeper_sources() {
        let graph = Graph::new();
        let (deep, set_deep) = graph.state(false);
        let (a, set_a) = graph.state(1);
        let b = graph.compute(move |r| Ok(r.read(&a)? + 1));
        let c = graph.compute(move |r| Ok(r.read(&b)? + 1));
        let (runs, runs_clone) = counter();
        let e = graph.compute(move |r| {
            runs_clone.set(runs_clone.get() + 1);
            if r.read(&deep)? {
                r.read(&c)
            } else {
                r.read(&a)
            }
        });
        graph.stabilize();
        assert_eq!(graph.depth(e.id()), Some(0));

        set_deep.set(&graph, true).unwrap();
        graph.stabilize();
        assert_eq!(graph.get(&e).unwrap(), 3);
        assert_eq!(graph.depth(e.id()), Some(2));

        set_a.set(&graph, 5).unwrap();
        graph.stabilize();
        assert_eq!(graph.get(&e).unwrap(), 7);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn compute_errors_are_cached_and_transmitted() {
        let graph = Graph::new();
        let (a, set_a) = graph.state(0);
        let (runs, runs_clone) = counter();
        let checked = graph.compute(move |r| {
            runs_clone.set(runs_clone.get() + 1);
            let value = r.read(&a)?;
            if value < 0 {
                return Err(anyhow::anyhow!("negative: {value}").into());
            }
            Ok(value)
        });
        let doubled = graph.derive(move |r| Ok(r.read(&checked)? * 2));
        graph.stabilize();
        assert_eq!(graph.get(&doubled).unwrap(), 0);

        set_a.set(&graph, -1).unwrap();
        graph.stabilize();
        assert!(graph.has_error(checked.id()));
        assert!(graph.is_dirty(doubled.id()));

        let first = graph.get(&doubled).unwrap_err();
        let second = graph.get(&checked).unwrap_err();
        let (Error::Computation(first), Error::Computation(second)) = (first, second) else {
            panic!("expected computation errors");
        };
        assert!(first.ptr_eq(&second));
        assert_eq!(runs.get(), 2);

        set_a.set(&graph, 4).unwrap();
        graph.stabilize();
        assert!(!graph.has_error(checked.id()));
        assert_eq!(graph.get(&doubled).unwrap(), 8);
    }

    #[test]
    fn stabilize_inside_an_evaluation_is_ignored() {
        let graph = Graph::new();
        let queued = graph.compute(|_| Ok(1));
        let nested: Atom<i32> = graph.derive(|r| {
            r.graph().stabilize();
            Ok(0)
        });

        graph.get(&nested).unwrap();
        assert!(graph.is_dirty(queued.id()));
        assert_eq!(graph.get(&queued).unwrap(), 1);
    }

    #[test]
    fn auto_clean_runs_after_the_drain() {
        let config = GraphConfig {
            auto_clean_threshold: Some(1),
            ..GraphConfig::default()
        };
        let graph = Graph::with_config(config);
        let (flag, set_flag) = graph.state(true);
        let (a, _) = graph.state(1);
        let (b, _) = graph.state(2);
        let pick = graph.compute(move |r| if r.read(&flag)? { r.read(&a) } else { r.read(&b) });
        graph.stabilize();

        set_flag.set(&graph, false).unwrap();
        graph.stabilize();
        assert_eq!(graph.get(&pick).unwrap(), 2);

        let stats = graph.stats();
        assert_eq!(stats.stale_chains, 0);
        assert_eq!(stats.links_pooled, 1);
    }

    #[test]
    fn inline_read_after_a_depth_drop_sees_the_new_value() {
        let graph = Graph::new();
        let (flag, set_flag) = graph.state(true);
        let (t, set_t) = graph.state(1);
        let c = graph.compute(|_| Ok(1));
        let x = graph.compute(move |r| if r.read(&flag)? { r.read(&c) } else { r.read(&t) });
        let y = graph.compute(move |r| Ok(r.read(&x)? + 1));
        graph.stabilize();
        assert_eq!(graph.depth(x.id()), Some(1));

        // `x` runs outside the drain and drops to depth 0, leaving its entry
        // in bucket 1
        set_flag.set(&graph, false).unwrap();
        assert_eq!(graph.get(&x).unwrap(), 1);
        assert_eq!(graph.depth(x.id()), Some(0));
        assert_eq!(graph.get(&y).unwrap(), 2);

        set_t.set(&graph, 5).unwrap();
        assert_eq!(graph.get(&y).unwrap(), 6);

        graph.stabilize();
        assert_eq!(graph.get(&y).unwrap(), 6);
        assert_eq!(graph.stats().queued, 0);
    }

    #[test]
    fn depth_growth_reaches_consumers_of_an_unchanged_relay() {
        let graph = Graph::new();
        let (flag, set_flag) = graph.state(false);
        let (s0, set_s0) = graph.state(1);
        let q = graph.compute(|_| Ok(0));
        let p = graph.compute(move |r| {
            if r.read(&flag)? {
                r.read(&q)?;
            }
            r.read(&s0)
        });
        let d = graph.derive(move |r| r.read(&p));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let e = graph.compute(move |r| {
            let pair = (r.read(&d)?, r.read(&s0)?);
            seen_clone.borrow_mut().push(pair);
            Ok(pair.0 + pair.1)
        });
        graph.stabilize();

        // `p` now reads a compute atom and grows deeper, with the same value
        set_flag.set(&graph, true).unwrap();
        graph.stabilize();
        assert_eq!(graph.depth(p.id()), Some(1));
        assert_eq!(graph.depth(d.id()), Some(1));
        assert_eq!(graph.depth(e.id()), Some(2));

        set_s0.set(&graph, 5).unwrap();
        graph.stabilize();
        assert_eq!(graph.get(&e).unwrap(), 10);
        assert_eq!(*seen.borrow(), vec![(1, 1), (5, 5)]);
    }

    #[test]
    fn drain_moves_consumers_whose_depth_grew() {
        let graph = Graph::new();
        let (flag, set_flag) = graph.state(false);
        let (s0, set_s0) = graph.state(1);
        let q = graph.compute(|_| Ok(0));
        let p = graph.compute(move |r| {
            if r.read(&flag)? {
                r.read(&q)?;
            }
            r.read(&s0)
        });
        let d = graph.derive(move |r| r.read(&p));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let e = graph.compute(move |r| {
            let pair = (r.read(&d)?, r.read(&s0)?);
            seen_clone.borrow_mut().push(pair);
            Ok(pair.0 + pair.1)
        });
        graph.stabilize();
        assert_eq!(graph.depth(e.id()), Some(1));

        // `e` is queued at depth 1 before `p` grows under it
        set_flag.set(&graph, true).unwrap();
        set_s0.set(&graph, 5).unwrap();
        {
            let store = graph.store();
            let queued = store.node(e.id()).and_then(|node| node.flags.queued);
            assert_eq!(queued, Some(1));
        }

        graph.stabilize();
        assert_eq!(graph.depth(e.id()), Some(2));
        assert_eq!(*seen.borrow(), vec![(1, 1), (5, 5)]);
        assert_eq!(graph.stats().queued, 0);
    }
}
