//! Node Transport
//!
//! The RPC seam between cluster nodes. Routers and the replication layer only
//! talk to other nodes through [`NodeTransport`].
//!
//! ## Implementations
//! - **`http`**: JSON over HTTP with bounded retries, used by deployed nodes.
//! - **`local`**: In-process dispatch for single-process clusters and tests.

pub mod http;
pub mod local;
pub mod protocol;


use crate::directory::types::NodeId;
use crate::error::Result;
use crate::index::types::LocalSearchResult;
use crate::replication::types::{ReplicaAck, ReplicationEntry, SyncRequest, SyncResponse, WriteResult};
use async_trait::async_trait;
use protocol::{ShardFetch, ShardSearch, ShardWrite};
use serde_json::Value;

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn forward_write(&self, node: &NodeId, request: ShardWrite) -> Result<WriteResult>;

    async fn replicate(&self, node: &NodeId, entry: ReplicationEntry) -> Result<ReplicaAck>;

    async fn acknowledge(&self, node: &NodeId, ack: ReplicaAck) -> Result<()>;

    async fn shard_search(&self, node: &NodeId, request: ShardSearch) -> Result<LocalSearchResult>;

    async fn shard_sync(&self, node: &NodeId, request: SyncRequest) -> Result<SyncResponse>;

    async fn fetch(&self, node: &NodeId, request: ShardFetch) -> Result<Option<Value>>;
}
