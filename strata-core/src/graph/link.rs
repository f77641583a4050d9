//! Links
//!
//! A link is the edge between a consumer relay and a source atom. Every link
//! sits on two lists at once:
//!
//! - the consumer's **source chain**, a singly linked list in read order
//!   (`next_source`), which lets a re-evaluation confirm edges positionally;
//! - the source's **consumer ring**, a doubly linked list anchored at the
//!   source's `consumers` head. `prev_consumer` is circular (the head points
//!   back at the last entry, a sole entry points at itself) while
//!   `next_consumer` ends at the last entry. Appending and unlinking are O(1)
//!   without scanning.
//!
//! Links are never freed. Detached links go back to a recycle pool, chained
//! through `next_source`, and are handed out again by [`LinkPool::acquire`].

use std::ops::{Index, IndexMut};

use super::node::AtomId;

/// Index of a link in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LinkId(u32);

impl LinkId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// An edge between a consumer relay and a source atom.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    /// Run identity of the consumer evaluation that last confirmed this link.
    pub version: u64,
    pub consumer: AtomId,
    pub source: AtomId,
    pub next_source: Option<LinkId>,
    pub next_consumer: Option<LinkId>,
    pub prev_consumer: LinkId,
    /// Whether the link is currently threaded on its source's consumer ring.
    pub in_ring: bool,
}

/// Arena of links with an intrusive free list.
pub(crate) struct LinkPool {
    links: Vec<Link>,
    free: Option<LinkId>,
    free_len: usize,
}

impl LinkPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            links: Vec::with_capacity(capacity),
            free: None,
            free_len: 0,
        }
    }

    /// Take a link from the pool, or allocate one.
    pub fn acquire(&mut self, version: u64, consumer: AtomId, source: AtomId) -> LinkId {
        if let Some(id) = self.free {
            let link = &mut self.links[id.index()];
            self.free = link.next_source;
            self.free_len -= 1;
            *link = Link {
                version,
                consumer,
                source,
                next_source: None,
                next_consumer: None,
                prev_consumer: id,
                in_ring: false,
            };
            return id;
        }

        let id = LinkId(self.links.len() as u32);
        tracing::trace!(link = id.0, %consumer, %source, "allocating link");
        self.links.push(Link {
            version,
            consumer,
            source,
            next_source: None,
            next_consumer: None,
            prev_consumer: id,
            in_ring: false,
        });
        id
    }

    /// Return a link to the pool. The link must already be off its ring.
    pub fn release(&mut self, id: LinkId) {
        debug_assert!(!self[id].in_ring, "releasing a link still on a consumer ring");
        let free = self.free;
        let link = &mut self[id];
        link.next_source = free;
        link.next_consumer = None;
        link.prev_consumer = id;
        self.free = Some(id);
        self.free_len += 1;
    }

    /// Append a link to the ring whose head is `head`.
    pub fn ring_push(&mut self, head: &mut Option<LinkId>, id: LinkId) {
        debug_assert!(!self[id].in_ring);
        match *head {
            None => {
                let link = &mut self[id];
                link.prev_consumer = id;
                link.next_consumer = None;
                *head = Some(id);
            }
            Some(first) => {
                let last = self[first].prev_consumer;
                self[last].next_consumer = Some(id);
                self[id].prev_consumer = last;
                self[id].next_consumer = None;
                self[first].prev_consumer = id;
            }
        }
        self[id].in_ring = true;
    }

    /// Unlink a link from the ring whose head is `head`.
    pub fn ring_remove(&mut self, head: &mut Option<LinkId>, id: LinkId) {
        if !self[id].in_ring {
            return;
        }
        let prev = self[id].prev_consumer;
        let next = self[id].next_consumer;

        if *head == Some(id) {
            // The head's `prev_consumer` is the last entry (or itself).
            *head = next;
            if let Some(next) = next {
                self[next].prev_consumer = prev;
            }
        } else {
            self[prev].next_consumer = next;
            match next {
                Some(next) => self[next].prev_consumer = prev,
                None => {
                    // Removed the last entry: the head now points back at `prev`.
                    if let Some(first) = *head {
                        self[first].prev_consumer = prev;
                    }
                }
            }
        }

        let link = &mut self[id];
        link.in_ring = false;
        link.next_consumer = None;
        link.prev_consumer = id;
    }

    /// Total links ever allocated.
    pub fn allocated(&self) -> usize {
        self.links.len()
    }

    /// Links waiting in the recycle pool.
    pub fn pooled(&self) -> usize {
        self.free_len
    }

    /// Links currently attached to a chain.
    pub fn live(&self) -> usize {
        self.links.len() - self.free_len
    }
}

impl Index<LinkId> for LinkPool {
    type Output = Link;

    fn index(&self, id: LinkId) -> &Link {
        &self.links[id.index()]
    }
}

impl IndexMut<LinkId> for LinkPool {
    fn index_mut(&mut self, id: LinkId) -> &mut Link {
        &mut self.links[id.index()]
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
