//! Node-to-Node Protocol
//!
//! Endpoints and DTOs of the internal RPCs. Bodies are JSON; a failed call
//! answers with a non-2xx status and a serialized `ClusterError`.

use crate::directory::types::ShardId;
use crate::index::types::{ShardQuery, WriteOp};
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// A write forwarded by a router to the shard's primary.
pub const ENDPOINT_WRITE: &str = "/internal/write";
/// Primary -> replica operation shipping.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// Replica -> primary applied-token report.
pub const ENDPOINT_ACK: &str = "/internal/ack";
/// Shard-local query execution.
pub const ENDPOINT_SEARCH: &str = "/internal/search";
/// Replica catch-up and resync.
pub const ENDPOINT_SYNC: &str = "/internal/sync";
/// Single-document read from a shard copy.
pub const ENDPOINT_FETCH: &str = "/internal/fetch";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardWrite {
    pub shard: ShardId,
    pub op: WriteOp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardSearch {
    pub shard: ShardId,
    pub query: ShardQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardFetch {
    pub shard: ShardId,
    pub doc_id: String,
}
