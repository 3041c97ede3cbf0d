use super::NodeTransport;
use super::protocol::{ShardFetch, ShardSearch, ShardWrite};
use crate::directory::types::NodeId;
use crate::error::{ClusterError, Result};
use crate::index::types::LocalSearchResult;
use crate::replication::manager::ReplicationManager;
use crate::replication::types::{ReplicaAck, ReplicationEntry, SyncRequest, SyncResponse, WriteResult};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Dispatches RPCs straight to the target node's `ReplicationManager` in the
/// same process. Nodes can be cut off to simulate crashes and partitions.
#[derive(Default)]
pub struct LocalTransport {
    nodes: DashMap<NodeId, Weak<ReplicationManager>>,
    down: DashSet<NodeId>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeId, manager: &Arc<ReplicationManager>) {
        self.nodes.insert(node, Arc::downgrade(manager));
    }

    /// Makes every call to `node` fail as if it were unreachable.
    pub fn set_down(&self, node: &NodeId, down: bool) {
        if down {
            self.down.insert(node.clone());
        } else {
            self.down.remove(node);
        }
    }

    fn target(&self, node: &NodeId) -> Result<Arc<ReplicationManager>> {
        if self.down.contains(node) {
            return Err(ClusterError::transient(format!("node {} unreachable", node)));
        }
        self.nodes
            .get(node)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| ClusterError::transient(format!("node {} unreachable", node)))
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn forward_write(&self, node: &NodeId, request: ShardWrite) -> Result<WriteResult> {
        self.target(node)?.write(&request.shard, request.op).await
    }

    async fn replicate(&self, node: &NodeId, entry: ReplicationEntry) -> Result<ReplicaAck> {
        self.target(node)?.apply_replicated(entry).await
    }

    async fn acknowledge(&self, node: &NodeId, ack: ReplicaAck) -> Result<()> {
        self.target(node)?.acknowledge(ack).await
    }

    async fn shard_search(&self, node: &NodeId, request: ShardSearch) -> Result<LocalSearchResult> {
        self.target(node)?.search_local(&request.shard, &request.query)
    }

    async fn shard_sync(&self, node: &NodeId, request: SyncRequest) -> Result<SyncResponse> {
        self.target(node)?.shard_sync(&request)
    }

    async fn fetch(&self, node: &NodeId, request: ShardFetch) -> Result<Option<Value>> {
        self.target(node)?.fetch_local(&request.shard, &request.doc_id)
    }
}
