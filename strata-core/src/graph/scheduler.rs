//! Update Scheduler
//!
//! The scheduler determines the order in which dirty compute atoms are
//! re-evaluated. It ensures that sources are always updated before their
//! consumers.
//!
//! # Algorithm
//!
//! Instead of sorting the dirty set on every change, each relay carries a
//! topological `depth` that is maintained as it reads its sources. Dirty
//! compute atoms are dropped into the bucket matching their depth, and the
//! heap is drained from the shallowest bucket to the deepest:
//!
//! 1. Pop an atom from the lowest non-empty bucket.
//! 2. If its depth changed since it was queued, move it to the right bucket.
//! 3. Otherwise evaluate it if it is still dirty. Consumers it dirties land in
//!    deeper buckets and extend the range.
//!
//! `min` and `max` bound the occupied buckets so the drain never scans the
//! whole bucket array.

use super::node::AtomId;

/// Depth-indexed bucket queue of dirty compute atoms.
pub(crate) struct DepthHeap {
    buckets: Vec<Vec<AtomId>>,
    min: usize,
    max: usize,
    len: usize,
}

impl DepthHeap {
    pub fn with_buckets(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| Vec::new()).collect(),
            min: usize::MAX,
            max: 0,
            len: 0,
        }
    }

    /// Bucket index for a relay depth. Uninitialized relays (`-1`) share
    /// bucket 0.
    pub fn bucket_of(depth: i32) -> usize {
        depth.max(0) as usize
    }

    /// Queue an atom in the bucket for `depth`.
    ///
    /// Callers record the bucket on the node; entries whose bucket no longer
    /// matches the node's record are stale.
    pub fn insert(&mut self, atom: AtomId, depth: i32) -> usize {
        let bucket = Self::bucket_of(depth);
        if bucket >= self.buckets.len() {
            self.buckets.resize_with(bucket + 1, Vec::new);
        }
        self.buckets[bucket].push(atom);
        self.min = self.min.min(bucket);
        self.max = self.max.max(bucket);
        self.len += 1;
        bucket
    }

    /// Pop an atom from the shallowest occupied bucket.
    pub fn pop(&mut self) -> Option<(usize, AtomId)> {
        if self.is_empty() {
            return None;
        }
        let mut bucket = self.min;
        while bucket <= self.max {
            if let Some(atom) = self.buckets[bucket].pop() {
                self.len -= 1;
                if self.len == 0 {
                    self.reset();
                } else {
                    self.min = bucket;
                    while self.buckets[self.min].is_empty() {
                        self.min += 1;
                    }
                }
                return Some((bucket, atom));
            }
            bucket += 1;
        }
        // `len` said otherwise; the bounds were stale.
        debug_assert!(false, "depth heap length out of sync with its buckets");
        self.reset();
        None
    }

    /// Whether an atom at `depth` could still have a queued ancestor.
    pub fn covers(&self, depth: i32) -> bool {
        !self.is_empty() && Self::bucket_of(depth) >= self.min
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn reset(&mut self) {
        self.min = usize::MAX;
        self.max = 0;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
