use super::NodeTransport;
use super::protocol::*;
use crate::directory::service::ClusterDirectory;
use crate::directory::types::NodeId;
use crate::error::{ClusterError, Result};
use crate::index::types::LocalSearchResult;
use crate::replication::types::{ReplicaAck, ReplicationEntry, SyncRequest, SyncResponse, WriteResult};
use crate::retry::RetryPolicy;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// JSON-over-HTTP transport. Peer addresses come from the directory's node
/// records and are cached until a call to that peer fails.
pub struct HttpTransport {
    http_client: reqwest::Client,
    directory: Arc<ClusterDirectory>,
    addresses: DashMap<NodeId, SocketAddr>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(directory: Arc<ClusterDirectory>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            directory,
            addresses: DashMap::new(),
            retry,
            timeout,
        }
    }

    async fn resolve(&self, node: &NodeId) -> Result<SocketAddr> {
        if let Some(addr) = self.addresses.get(node) {
            return Ok(*addr);
        }
        let record = self
            .directory
            .get_node(node)
            .await?
            .ok_or_else(|| ClusterError::NodeNotFound(node.to_string()))?;
        self.addresses.insert(node.clone(), record.address);
        Ok(record.address)
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        endpoint: &str,
        url: &str,
        payload: &T,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut attempt = 0;
        loop {
            let response = self
                .http_client
                .post(url)
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 >= self.retry.attempts || !resend_allowed(endpoint, &e) => return Err(e),
                Err(e) => {
                    tracing::debug!(attempt, "POST {} failed: {}", url, e);
                    self.retry.backoff(attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn call<Req, Resp>(&self, node: &NodeId, endpoint: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let addr = self.resolve(node).await?;
        let url = format!("http://{}{}", addr, endpoint);

        let response = match self.post_with_retry(endpoint, &url, body).await {
            Ok(response) => response,
            Err(e) => {
                self.addresses.remove(node);
                return Err(ClusterError::transient(format!("{} unreachable: {}", node, e)));
            }
        };

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClusterError::transient(format!("reading response from {}: {}", node, e)))?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| {
                ClusterError::transient(format!("malformed response from {}: {}", node, e))
            });
        }
        match serde_json::from_slice::<ClusterError>(&bytes) {
            Ok(remote) => Err(remote),
            Err(_) => Err(ClusterError::transient(format!(
                "{} answered {} on {}",
                node, status, endpoint
            ))),
        }
    }
}

/// Whether a failed POST may be sent again. A forwarded write that timed out
/// may already be committed on the primary, and resending it would commit it
/// a second time under a new token.
fn resend_allowed(endpoint: &str, error: &reqwest::Error) -> bool {
    !(endpoint == ENDPOINT_WRITE && error.is_timeout())
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn forward_write(&self, node: &NodeId, request: ShardWrite) -> Result<WriteResult> {
        self.call(node, ENDPOINT_WRITE, &request).await
    }

    async fn replicate(&self, node: &NodeId, entry: ReplicationEntry) -> Result<ReplicaAck> {
        self.call(node, ENDPOINT_REPLICATE, &entry).await
    }

    async fn acknowledge(&self, node: &NodeId, ack: ReplicaAck) -> Result<()> {
        self.call(node, ENDPOINT_ACK, &ack).await
    }

    async fn shard_search(&self, node: &NodeId, request: ShardSearch) -> Result<LocalSearchResult> {
        self.call(node, ENDPOINT_SEARCH, &request).await
    }

    async fn shard_sync(&self, node: &NodeId, request: SyncRequest) -> Result<SyncResponse> {
        self.call(node, ENDPOINT_SYNC, &request).await
    }

    async fn fetch(&self, node: &NodeId, request: ShardFetch) -> Result<Option<Value>> {
        self.call(node, ENDPOINT_FETCH, &request).await
    }
}
