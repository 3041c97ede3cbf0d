//! Cluster Error Taxonomy
//!
//! Every fallible operation in the library returns [`ClusterError`]. The enum is
//! serializable so a remote node's failure crosses the HTTP transport with its
//! kind intact, and cloneable so coalesced cache waiters can share one outcome.

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum ClusterError {
    /// Metadata store unreachable, RPC timeout, CAS retries exhausted.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("shard {shard} of index '{index}' has no reachable healthy replica")]
    ShardUnavailable { index: String, shard: u32 },

    /// The caller's cached view of primary/replica placement is outdated.
    #[error("stale assignment for shard {shard} of index '{index}'")]
    StaleAssignment { index: String, shard: u32 },

    /// Internal signal only. Never returned to clients.
    #[error("replica {node} of shard {shard} of '{index}' lags the primary by {lag} commits")]
    ReplicationLag {
        index: String,
        shard: u32,
        node: String,
        lag: u64,
    },

    #[error("configuration error: {0}")]
    FatalConfig(String),

    #[error("index '{0}' not found")]
    IndexNotFound(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("lock '{0}' is no longer held")]
    LockLost(String),

    #[error("write quorum not reached: {acked} of {required} acknowledgments")]
    QuorumNotReached { acked: usize, required: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ClusterError {
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        ClusterError::Transient(msg.to_string())
    }

    /// Whether the caller may retry the same request (possibly after
    /// refreshing its view of the cluster).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Transient(_)
                | ClusterError::QuorumNotReached { .. }
                | ClusterError::StaleAssignment { .. }
        )
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(e: bincode::Error) -> Self {
        ClusterError::Storage(format!("record encoding: {}", e))
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::InvalidRequest(format!("json: {}", e))
    }
}
