use crate::directory::types::{CommitToken, NodeId, ShardId};
use crate::index::types::{IndexSnapshot, WriteOp};
use serde::{Deserialize, Serialize};

/// An operation committed by a shard's primary, shipped to its replicas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationEntry {
    pub shard: ShardId,
    pub token: CommitToken,
    /// Assignment epoch at which the issuing primary took over.
    pub term: u64,
    pub op: WriteOp,
}

/// A replica's report of how far it has applied the shard's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaAck {
    pub shard: ShardId,
    pub node: NodeId,
    pub applied: CommitToken,
    /// Term of the primary whose history `applied` refers to.
    #[serde(default)]
    pub term: u64,
    /// The replica cannot serve reads yet: it was never synced, it holds a
    /// gap, or it is pulling a fresh copy.
    #[serde(default)]
    pub needs_resync: bool,
}

/// Catch-up request sent by a replica to the shard's primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    pub shard: ShardId,
    /// Last token the replica applied.
    pub from: CommitToken,
    /// Term of the primary that issued `from`.
    pub term: u64,
    /// Skip log replay and ship a snapshot.
    #[serde(default)]
    pub full: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncResponse {
    /// Every operation after the requested token, in order.
    Ops { term: u64, entries: Vec<ReplicationEntry> },
    /// Whole-index copy as of `token`. The replica's state is replaced.
    Snapshot {
        token: CommitToken,
        term: u64,
        snapshot: IndexSnapshot,
    },
}

/// Returned to the writer once the write is durable under the index quorum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteResult {
    pub shard: u32,
    pub token: CommitToken,
    /// Index generation published for the write. `None` while the metadata
    /// store is unreachable; the bump is retried in the background.
    #[serde(default)]
    pub generation: Option<u64>,
    /// Copies holding the write when it was reported, primary included.
    pub acked: usize,
}
