use super::hashing::shard_for;
use super::types::{DeleteRequest, WriteRequest};
use super::view::AssignmentView;
use crate::directory::types::ShardId;
use crate::error::{ClusterError, Result};
use crate::index::types::WriteOp;
use crate::replication::types::WriteResult;
use crate::transport::NodeTransport;
use crate::transport::protocol::ShardWrite;

use std::sync::Arc;

/// Sends each mutation to the primary of the shard that owns it.
pub struct WriteRouter {
    transport: Arc<dyn NodeTransport>,
    view: Arc<AssignmentView>,
}

impl WriteRouter {
    pub fn new(transport: Arc<dyn NodeTransport>, view: Arc<AssignmentView>) -> Self {
        Self { transport, view }
    }

    pub async fn write_document(&self, request: WriteRequest) -> Result<WriteResult> {
        let op = WriteOp::Index {
            doc_id: request.doc_id.clone(),
            payload: request.payload,
        };
        self.route(&request.index, request.routing_key.as_deref(), op)
            .await
    }

    pub async fn delete_document(&self, request: DeleteRequest) -> Result<WriteResult> {
        let op = WriteOp::Delete {
            doc_id: request.doc_id.clone(),
        };
        self.route(&request.index, request.routing_key.as_deref(), op)
            .await
    }

    async fn route(&self, index: &str, routing_key: Option<&str>, op: WriteOp) -> Result<WriteResult> {
        if op.doc_id().is_empty() {
            return Err(ClusterError::InvalidRequest("document id is required".to_string()));
        }
        let key = routing_key.unwrap_or(op.doc_id());

        // A stale view gets one refresh and retry
        let mut refreshed = false;
        loop {
            let view = self.view.get(index).await?;
            let shard = shard_for(key, view.index.shard_count);
            let shard_id = ShardId::new(index, shard);

            let primary = match view.primary(shard) {
                Some(primary) if view.is_alive(&primary.node) => primary.node.clone(),
                Some(primary) => {
                    self.view.invalidate(index);
                    return Err(ClusterError::transient(format!(
                        "primary {} of {} is not alive; awaiting promotion",
                        primary.node, shard_id
                    )));
                }
                None => {
                    return Err(ClusterError::ShardUnavailable {
                        index: index.to_string(),
                        shard,
                    });
                }
            };

            let request = ShardWrite {
                shard: shard_id.clone(),
                op: op.clone(),
            };
            match self.transport.forward_write(&primary, request).await {
                Ok(result) => {
                    tracing::debug!(shard = %shard_id, token = %result.token, "Write acknowledged");
                    return Ok(result);
                }
                Err(ClusterError::StaleAssignment { .. }) if !refreshed => {
                    tracing::debug!(shard = %shard_id, "Stale assignment for {}; refreshing", primary);
                    self.view.invalidate(index);
                    refreshed = true;
                }
                Err(e @ ClusterError::Transient(_)) => {
                    tracing::warn!(shard = %shard_id, "Primary {} unreachable: {}", primary, e);
                    self.view.invalidate(index);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
