//! Error Types
//!
//! Everything that can go wrong while reading, writing, or wiring atoms.
//!
//! There are two families of errors:
//!
//! - **Graph errors** (`Lifecycle`, `CyclicRead`, `Ownership`,
//!   `ForeignChannel`) describe misuse of the graph itself: reading a
//!   destroyed atom, reading an atom from inside its own evaluation, building
//!   an invalid ownership relation, or subscribing through a foreign channel.
//!
//! - **Computation errors** are failures raised by an evaluation function.
//!   They are cached as the relay's value and handed out again, as the same
//!   object, on every read until one of the relay's sources changes.
//!
//! Because a cached error is returned on every read, [`Error`] is `Clone`.
//! User errors are stored behind an `Rc` so cloning never duplicates them.

use std::fmt;
use std::rc::Rc;

use crate::graph::AtomId;
use crate::reactive::Channel;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors produced by the graph.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The atom has been destroyed, or the handle belongs to another graph.
    #[error("atom {0} is destroyed or does not belong to this graph")]
    Lifecycle(AtomId),

    /// The atom was read while it was being evaluated.
    #[error("cyclic read of atom {0} during its own evaluation")]
    CyclicRead(AtomId),

    /// An ownership relation could not be established.
    #[error("cannot make {owner} the owner of {atom}: {reason}")]
    Ownership {
        /// The atom that would have been owned.
        atom: AtomId,
        /// The rejected owner.
        owner: AtomId,
        /// Why the relation was rejected.
        reason: OwnershipViolation,
    },

    /// The channel was created by another graph.
    #[error("channel {0:?} does not belong to this graph")]
    ForeignChannel(Channel),

    /// The link pool was found in an inconsistent state.
    ///
    /// Reserved: internal checks treat pool corruption as fatal, so this
    /// variant is never produced by a healthy graph.
    #[error("link pool invariant violated")]
    RecycleInvariant,

    /// An evaluation function failed.
    #[error("computation failed: {0}")]
    Computation(ComputeError),
}

impl Error {
    /// Wrap any user error as a computation failure.
    pub fn computation(err: impl Into<anyhow::Error>) -> Self {
        Error::Computation(ComputeError(Rc::new(err.into())))
    }

    /// Returns the user error if this is a computation failure.
    pub fn as_computation(&self) -> Option<&ComputeError> {
        match self {
            Error::Computation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::computation(err)
    }
}

/// Why [`Error::Ownership`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipViolation {
    /// The atom already has an owner.
    AlreadyOwned,
    /// Only unowned compute atoms may own other atoms.
    OwnerNotEager,
    /// An atom cannot own itself.
    SelfOwned,
    /// The atom owns other atoms, which need an eager owner.
    OwnsOthers,
}

impl fmt::Display for OwnershipViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipViolation::AlreadyOwned => write!(f, "atom already has an owner"),
            OwnershipViolation::OwnerNotEager => {
                write!(f, "owner is not an eagerly scheduled compute atom")
            }
            OwnershipViolation::SelfOwned => write!(f, "an atom cannot own itself"),
            OwnershipViolation::OwnsOthers => write!(f, "atom already owns other atoms"),
        }
    }
}

/// A user error raised by an evaluation function.
///
/// Clones share the underlying error; [`ComputeError::ptr_eq`] tells whether
/// two reads observed the very same failure.
#[derive(Clone)]
pub struct ComputeError(Rc<anyhow::Error>);

impl ComputeError {
    /// The wrapped user error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to downcast the user error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether both values refer to the same error object.
    pub fn ptr_eq(&self, other: &ComputeError) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
