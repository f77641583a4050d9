//! Reactive Runtime
//!
//! This module implements the user-facing engine: the [`Graph`] that owns
//! every atom, the handles used to read and write them, and the algorithms
//! that keep derived values consistent.
//!
//! # Concepts
//!
//! ## State
//!
//! A state atom is a leaf holding a plain value. It is written through its
//! [`Setter`]; writing an equal value does nothing.
//!
//! ## Derive
//!
//! A derive atom is a lazily pulled function of other atoms. It is evaluated
//! the first time it is read, and again on the next read after one of its
//! sources changed. Nothing evaluates it in the background.
//!
//! ## Compute
//!
//! A compute atom is an eagerly scheduled function of other atoms. When a
//! source changes it is queued, and [`Graph::stabilize`] evaluates the queue
//! in topological order. Its consumers are only notified if its value
//! actually changed.
//!
//! # Implementation Notes
//!
//! Dependencies are discovered, not declared: an evaluation function receives
//! a [`Reader`], and every atom it reads becomes a source. Reads always return
//! consistent values. A relay read while the heap still holds one of its
//! possible ancestors forces those ancestors first, so no evaluation ever
//! sees one updated parent next to a stale one.
//!
//! Notifications to the outside world go through subscribers, which are
//! queued on a [`Channel`] and run only when the channel is run.

mod atom;
mod channel;
mod context;
mod edges;
mod propagate;
mod runtime;
mod stabilize;
mod subscriber;

pub use atom::{Atom, Setter};
pub use channel::Channel;
pub use context::Reader;
pub use runtime::Graph;
pub use subscriber::Subscription;
