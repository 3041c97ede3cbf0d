//! In-process cluster harness shared by the integration tests.
//!
//! Nodes talk through `LocalTransport` and share one `MemoryMetadataStore`.
//! No background loops run: `settle` drives heartbeats, planning and
//! reconciliation by hand until the cluster converges.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::json;
use sharded_search::config::NodeConfig;
use sharded_search::directory::service::{ClusterDirectory, LockHandle, PLANNER_LOCK};
use sharded_search::directory::store::MemoryMetadataStore;
use sharded_search::directory::types::*;
use sharded_search::index::engine::MemoryIndexFactory;
use sharded_search::node::SearchNode;
use sharded_search::replication::types::WriteResult;
use sharded_search::retry::RetryPolicy;
use sharded_search::router::types::WriteRequest;
use sharded_search::transport::local::LocalTransport;

/// Test harness for a cluster of in-process search nodes.
pub struct TestCluster {
    pub store: Arc<MemoryMetadataStore>,
    pub directory: Arc<ClusterDirectory>,
    pub transport: Arc<LocalTransport>,
    nodes: Vec<Arc<SearchNode>>,
    alive: Vec<NodeId>,
    lock: LockHandle,
}

impl TestCluster {
    /// Starts `n` nodes named `n1..=n{n}` with the default test configuration.
    pub async fn start(n: usize) -> Result<Self> {
        Self::start_with(n, test_config()).await
    }

    pub async fn start_with(n: usize, config: NodeConfig) -> Result<Self> {
        let store = Arc::new(MemoryMetadataStore::new());
        let directory = Arc::new(ClusterDirectory::new(store.clone(), RetryPolicy::immediate(3)));
        let transport = LocalTransport::new();

        let mut nodes = Vec::new();
        let mut alive = Vec::new();
        for i in 0..n {
            let id = NodeId::from(format!("n{}", i + 1).as_str());
            let address = format!("127.0.0.1:{}", 7000 + i).parse()?;
            let node = SearchNode::new(
                id.clone(),
                address,
                config.clone(),
                directory.clone(),
                transport.clone(),
                Arc::new(MemoryIndexFactory),
            );
            transport.register(id.clone(), node.manager());
            node.heartbeat().await?;
            nodes.push(node);
            alive.push(id);
        }

        let Some(lock) = directory
            .acquire_lock(PLANNER_LOCK, &alive[0], Duration::from_secs(60))
            .await?
        else {
            bail!("planner lock unavailable in a fresh cluster");
        };

        Ok(Self {
            store,
            directory,
            transport,
            nodes,
            alive,
            lock,
        })
    }

    pub fn node(&self, id: &NodeId) -> &Arc<SearchNode> {
        self.nodes
            .iter()
            .find(|node| node.id() == id)
            .unwrap_or_else(|| panic!("unknown node {}", id))
    }

    /// First node still alive; used as the client entry point.
    pub fn entry(&self) -> &Arc<SearchNode> {
        self.node(&self.alive[0])
    }

    /// An alive node other than `id`.
    pub fn entry_except(&self, id: &NodeId) -> &Arc<SearchNode> {
        let other = self
            .alive
            .iter()
            .find(|alive| *alive != id)
            .unwrap_or_else(|| panic!("no alive node besides {}", id));
        self.node(other)
    }

    pub async fn create_index(&self, index: IndexRecord) -> Result<()> {
        self.entry().create_index(index).await?;
        Ok(())
    }

    /// Heartbeats, plans and reconciles until every shard has a full, healthy
    /// and hosted replica set.
    pub async fn settle(&self) -> Result<()> {
        for _ in 0..50 {
            for id in &self.alive {
                self.node(id).heartbeat().await?;
            }
            self.entry().planner().rebalance(&self.lock).await?;
            for id in &self.alive {
                self.node(id).reconcile().await?;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;

            if self.converged().await? {
                for id in &self.alive {
                    self.node(id).view().invalidate_all();
                }
                return Ok(());
            }
        }
        bail!("cluster did not converge:\n{:#?}", self.directory.get_topology().await?.assignments)
    }

    async fn converged(&self) -> Result<bool> {
        let topology = self.directory.get_topology().await?;
        for index in topology.indexes.values() {
            let wanted = (index.replication_factor as usize).min(self.alive.len());
            for shard in index.shards() {
                let Some(assignment) = topology.assignments.get(&shard) else {
                    return Ok(false);
                };
                if assignment.primary_count() != 1 || assignment.replicas.len() < wanted {
                    return Ok(false);
                }
                for replica in &assignment.replicas {
                    if replica.health != ReplicaHealth::Ok || !self.alive.contains(&replica.node) {
                        return Ok(false);
                    }
                    let Ok(hosted) = self.node(&replica.node).manager().hosted(&shard) else {
                        return Ok(false);
                    };
                    if hosted.role().kind() != replica.role {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Cuts `id` off and records it as dead, as the registry sweep would
    /// after the dead timeout.
    pub async fn kill(&mut self, id: &NodeId) -> Result<()> {
        self.transport.set_down(id, true);
        self.directory
            .update_node(id, |record| {
                Ok(record.map(|mut record| {
                    record.state = NodeState::Dead;
                    record
                }))
            })
            .await?;
        self.alive.retain(|alive| alive != id);
        Ok(())
    }

    pub async fn assignment(&self, index: &str, shard: u32) -> Result<ShardAssignment> {
        match self.directory.get_assignment(&ShardId::new(index, shard)).await? {
            Some(assignment) => Ok(assignment),
            None => bail!("no assignment for {}/{}", index, shard),
        }
    }

    pub async fn primary_of(&self, index: &str, shard: u32) -> Result<NodeId> {
        match self.assignment(index, shard).await?.primary() {
            Some(primary) => Ok(primary.node.clone()),
            None => bail!("no primary for {}/{}", index, shard),
        }
    }

    /// Indexes `{"title": title}` as `doc_id` through the entry node.
    pub async fn write(&self, index: &str, doc_id: &str, title: &str) -> Result<WriteResult> {
        let request = WriteRequest {
            index: index.to_string(),
            doc_id: doc_id.to_string(),
            routing_key: None,
            payload: json!({ "title": title }),
        };
        Ok(self.entry().writes().write_document(request).await?)
    }
}

/// Fast timeouts and no backoff so failures surface quickly.
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.retry.attempts = 2;
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.replication.write_timeout_ms = 500;
    config.query.deadline_ms = 500;
    config
}

/// Copies of `shard` whose published applied token is at least `token`.
pub async fn copies_at(directory: &ClusterDirectory, shard: &ShardId, token: CommitToken) -> usize {
    match directory.get_assignment(shard).await {
        Ok(Some(assignment)) => assignment
            .replicas
            .iter()
            .filter(|replica| replica.applied_token >= token)
            .count(),
        _ => 0,
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
