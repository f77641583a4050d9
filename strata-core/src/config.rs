//! Graph configuration and statistics.

use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`Graph`](crate::Graph).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust,ignore
/// let config = GraphConfig::from_json(r#"{ "auto_clean_threshold": 32 }"#)?;
/// let graph = Graph::with_config(config);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Number of depth buckets allocated up front. The heap grows past this
    /// on demand.
    pub depth_buckets: usize,

    /// Initial capacity of the link arena.
    pub link_capacity: usize,

    /// When set, `stabilize()` reclaims detached links once this many
    /// detached source chains are waiting. When unset, reclamation only
    /// happens on an explicit `clean()`.
    pub auto_clean_threshold: Option<usize>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            depth_buckets: 16,
            link_capacity: 64,
            auto_clean_threshold: None,
        }
    }
}

impl GraphConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A snapshot of a graph's bookkeeping, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// Atoms currently alive.
    pub atoms: usize,
    /// Links ever allocated by the pool.
    pub links_allocated: usize,
    /// Links attached to a source chain or awaiting reclamation.
    pub links_live: usize,
    /// Links sitting in the recycle pool.
    pub links_pooled: usize,
    /// Detached source chains waiting for `clean()`.
    pub stale_chains: usize,
    /// Atoms queued in the depth heap.
    pub queued: usize,
    /// Subscriber entries, including tombstones not yet spliced out.
    pub subscribers: usize,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
