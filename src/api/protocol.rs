//! Client-Facing Protocol
//!
//! Endpoints and DTOs of the public HTTP surface. Document and query bodies
//! reuse the router's request types.

use crate::directory::types::IndexRecord;
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

pub const ENDPOINT_DOCUMENTS: &str = "/documents";
pub const ENDPOINT_DOCUMENTS_DELETE: &str = "/documents/delete";
pub const ENDPOINT_DOCUMENTS_FETCH: &str = "/documents/fetch";
pub const ENDPOINT_QUERY: &str = "/query";
pub const ENDPOINT_INDEXES: &str = "/indexes";
pub const ENDPOINT_INDEXES_DELETE: &str = "/indexes/delete";
pub const ENDPOINT_HEARTBEAT: &str = "/heartbeat";
pub const ENDPOINT_CLUSTER: &str = "/cluster";
pub const ENDPOINT_CACHE_STATS: &str = "/cache/stats";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    pub name: String,
    pub shard_count: u32,
    pub replication_factor: u32,
    #[serde(default)]
    pub write_quorum: Option<u32>,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl CreateIndexRequest {
    pub fn into_record(self) -> IndexRecord {
        let mut record = IndexRecord::new(&self.name, self.shard_count, self.replication_factor);
        if let Some(quorum) = self.write_quorum {
            record = record.with_quorum(quorum);
        }
        if let Some(weight) = self.weight {
            record = record.with_weight(weight);
        }
        record
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteIndexRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatResponse {
    /// The node joined or came back.
    pub state_changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Empty {}
