//! Strata Core
//!
//! This crate provides an incremental computation engine: a graph of
//! memoized values where some atoms hold state and others are pure functions
//! of other atoms, re-evaluated only when their transitive inputs change.
//! It implements:
//!
//! - State, lazily pulled (derive) and eagerly scheduled (compute) atoms
//! - Automatic dependency tracking with pooled, reused edges
//! - Depth-ordered stabilization with glitch-free inline reads
//! - Ownership, disposal and subscriber delivery channels
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `graph`: Raw data structures (nodes, links, the depth heap)
//! - `reactive`: The [`Graph`] runtime and its handles
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_core::Graph;
//!
//! let graph = Graph::new();
//! let (count, set_count) = graph.state(1);
//! let doubled = graph.derive(move |r| Ok(r.read(&count)? * 2));
//! let total = graph.compute(move |r| Ok(r.read(&doubled)? + r.read(&count)?));
//!
//! graph.stabilize();
//! assert_eq!(graph.get(&total)?, 3);
//!
//! set_count.set(&graph, 5)?;
//! graph.stabilize();
//! assert_eq!(graph.get(&total)?, 15);
//! ```

pub mod graph;
pub mod reactive;

mod config;
mod error;

pub use config::{GraphConfig, GraphStats};
pub use error::{ComputeError, Error, OwnershipViolation, Result};
pub use graph::{AtomId, AtomKind};
pub use reactive::{Atom, Channel, Graph, Reader, Setter, Subscription};
