//! Dependency Graph
//!
//! This module implements the raw data structures of the computation graph:
//! nodes, the links between them, and the depth-indexed scheduler.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent atoms: state leaves, lazily pulled derivations, and
//!   eagerly scheduled computations
//! - Edges are pooled links from a consumer relay to each source it read
//!
//! # Design Decisions
//!
//! 1. Edges are intrusive linked lists rather than per-node hash sets:
//!    - A re-evaluation that reads the same sources in the same order
//!      confirms its existing links in place, with no allocation
//!    - Edges that were not confirmed are detached as one suffix and
//!      reclaimed later, never diffed against the new read order
//!
//! 2. Nodes live in a slab arena addressed by generational ids, so stale
//!    handles are detected instead of aliasing a reused slot.
//!
//! 3. Scheduling order comes from a per-relay topological depth kept up to
//!    date during evaluation, not from sorting the dirty set.

mod link;
mod node;
mod scheduler;

pub use node::{AtomId, AtomKind};

pub(crate) use link::{LinkId, LinkPool};
pub(crate) use node::{value_eq, Body, ComputeFn, Node, Relay, Value};
pub(crate) use scheduler::DepthHeap;
