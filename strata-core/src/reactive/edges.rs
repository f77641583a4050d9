//! Edge Maintenance
//!
//! Confirms, creates, detaches and reclaims the links between relays and
//! their sources.
//!
//! # How It Works
//!
//! Every evaluation re-reads its sources, and in the common case it reads the
//! same sources in the same order as last time. The relay keeps a
//! `source_tail` cursor, reset to "before the head" when evaluation starts:
//!
//! 1. A read of the source the tail already points at is a repeat; nothing
//!    to do.
//! 2. If the link right after the tail reads the same source, it is confirmed
//!    in place: stamped with the current run and the tail moves forward. No
//!    allocation, no ring surgery.
//! 3. Otherwise a link is taken from the pool, spliced in after the tail, and
//!    appended to the source's consumer ring.
//!
//! When evaluation ends, whatever follows the tail was not read this time.
//! The suffix is cut off and parked on the stale list; `clean()` later takes
//! its links off their rings and back to the pool. Until then they are
//! harmless: their run stamp no longer matches the consumer's, so
//! propagation skips them.

use super::runtime::{lookup_mut, Graph, Store};
use crate::error::{Error, Result};
use crate::graph::{AtomId, LinkId};

impl Store {
    /// Record that `consumer`, during evaluation `run`, read `source`.
    pub fn link(&mut self, consumer: AtomId, source: AtomId, run: u64) -> Result<()> {
        let relay = lookup_mut(&mut self.nodes, self.id, consumer)
            .and_then(|node| node.relay_mut())
            .ok_or(Error::Lifecycle(consumer))?;

        if let Some(tail) = relay.source_tail {
            if self.links[tail].source == source {
                return Ok(());
            }
        }

        let candidate = match relay.source_tail {
            Some(tail) => self.links[tail].next_source,
            None => relay.source_head,
        };

        if let Some(next) = candidate {
            if self.links[next].source == source {
                self.links[next].version = run;
                relay.source_tail = Some(next);
                return Ok(());
            }
        }

        let id = self.links.acquire(run, consumer, source);
        self.links[id].next_source = candidate;
        match relay.source_tail {
            Some(tail) => self.links[tail].next_source = Some(id),
            None => relay.source_head = Some(id),
        }
        relay.source_tail = Some(id);

        let node = lookup_mut(&mut self.nodes, self.id, source).ok_or(Error::Lifecycle(source))?;
        self.links.ring_push(&mut node.consumers, id);
        Ok(())
    }

    /// Cut off the links an evaluation of `atom` did not confirm.
    pub fn detach_stale(&mut self, atom: AtomId) {
        let Some(relay) = lookup_mut(&mut self.nodes, self.id, atom).and_then(|node| node.relay_mut())
        else {
            return;
        };

        let suffix = match relay.source_tail {
            Some(tail) => self.links[tail].next_source.take(),
            None => relay.source_head.take(),
        };
        if let Some(head) = suffix {
            self.stale.push(head);
        }
    }

    /// Take a link off its source's consumer ring.
    pub fn unlink_from_source(&mut self, id: LinkId) {
        let source = self.links[id].source;
        match lookup_mut(&mut self.nodes, self.id, source) {
            Some(node) => self.links.ring_remove(&mut node.consumers, id),
            // The ring went away with its atom.
            None => self.links[id].in_ring = false,
        }
    }

    /// Return every detached link to the pool.
    ///
    /// Returns the number of links reclaimed, or 0 when an evaluation or
    /// fallback walk still holds cursors into source chains.
    pub fn clean(&mut self) -> usize {
        if self.evaluating > 0 || self.fallback_depth > 0 {
            return 0;
        }

        let chains = std::mem::take(&mut self.stale);
        let mut reclaimed = 0;
        for head in chains {
            let mut cursor = Some(head);
            while let Some(id) = cursor {
                cursor = self.links[id].next_source;
                self.unlink_from_source(id);
                self.links.release(id);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

impl Graph {
    /// Reclaim links detached by earlier evaluations and disposals.
    ///
    /// Call this from the outside, between updates. Returns the number of
    /// links returned to the pool.
    pub fn clean(&self) -> usize {
        let mut store = self.store_mut();
        let chains = store.stale.len();
        let reclaimed = store.clean();
        if reclaimed > 0 {
            tracing::debug!(chains, reclaimed, "reclaimed detached links");
        }
        reclaimed
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
