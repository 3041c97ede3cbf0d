//! Search Node
//!
//! Wires the components one cluster member runs and drives its background
//! loops.
//!
//! ## Background Loops
//! - **Heartbeat**: refreshes this node's record and publishes primary progress.
//! - **Reconcile**: re-aligns hosted shards whenever an assignment changes.
//! - **View**: keeps the routers' assignment view in step with the directory.
//! - **Planner**: competes for the planner lock and places shards while holding it.
//! - **Stats**: periodic cluster summary in the log.

use crate::cache::service::QueryCache;
use crate::config::NodeConfig;
use crate::directory::registry::{Heartbeat, NodeRegistry};
use crate::directory::service::{ClusterDirectory, DirectorySubscription};
use crate::directory::types::*;
use crate::error::Result;
use crate::index::engine::IndexFactory;
use crate::planner::planner::ShardPlanner;
use crate::replication::manager::ReplicationManager;
use crate::retry::RetryPolicy;
use crate::router::query::QueryRouter;
use crate::router::view::AssignmentView;
use crate::router::write::WriteRouter;
use crate::transport::NodeTransport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const STATS_INTERVAL: Duration = Duration::from_secs(10);
/// Assignment notifications arriving this close together share one reconcile.
const RECONCILE_DEBOUNCE: Duration = Duration::from_millis(25);

pub struct SearchNode {
    id: NodeId,
    address: SocketAddr,
    config: NodeConfig,
    directory: Arc<ClusterDirectory>,
    registry: Arc<NodeRegistry>,
    manager: Arc<ReplicationManager>,
    planner: Arc<ShardPlanner>,
    view: Arc<AssignmentView>,
    writes: WriteRouter,
    queries: QueryRouter,
}

impl SearchNode {
    pub fn new(
        id: NodeId,
        address: SocketAddr,
        config: NodeConfig,
        directory: Arc<ClusterDirectory>,
        transport: Arc<dyn NodeTransport>,
        factory: Arc<dyn IndexFactory>,
    ) -> Arc<Self> {
        let retry = RetryPolicy::from_config(&config.retry);
        let registry = NodeRegistry::new(directory.clone(), &config.cluster);
        let manager = ReplicationManager::new(
            id.clone(),
            directory.clone(),
            transport.clone(),
            factory,
            config.replication.clone(),
            retry,
        );
        let planner = ShardPlanner::new(id.clone(), directory.clone(), registry.clone(), &config.cluster);
        let view = AssignmentView::new(directory.clone(), config.query.assignment_ttl());
        let cache = Arc::new(QueryCache::new(config.query.cache_capacity));
        let writes = WriteRouter::new(transport.clone(), view.clone());
        let queries = QueryRouter::new(
            directory.clone(),
            transport,
            view.clone(),
            cache,
            config.query.clone(),
        );

        Arc::new(Self {
            id,
            address,
            config,
            directory,
            registry,
            manager,
            planner,
            view,
            writes,
            queries,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ReplicationManager> {
        &self.manager
    }

    pub fn planner(&self) -> &Arc<ShardPlanner> {
        &self.planner
    }

    pub fn view(&self) -> &Arc<AssignmentView> {
        &self.view
    }

    pub fn writes(&self) -> &WriteRouter {
        &self.writes
    }

    pub fn queries(&self) -> &QueryRouter {
        &self.queries
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        self.queries.cache()
    }

    /// Refreshes this node's liveness record, then publishes the applied
    /// token of every shard it leads.
    pub async fn heartbeat(&self) -> Result<()> {
        let heartbeat = Heartbeat {
            node_id: self.id.clone(),
            address: self.address,
            capacity: self.config.cluster.capacity,
            stats: self.manager.stats(),
        };
        self.registry.record_heartbeat(heartbeat).await?;
        self.manager.report_progress().await
    }

    pub async fn reconcile(&self) -> Result<()> {
        self.manager.reconcile().await
    }

    pub async fn create_index(&self, index: IndexRecord) -> Result<IndexRecord> {
        let created = self.directory.create_index(index).await?;
        tracing::info!(
            "Index '{}' ready: {} shards, replication factor {}, write quorum {}",
            created.name,
            created.shard_count,
            created.replication_factor,
            created.write_quorum
        );
        Ok(created)
    }

    /// Spawns every background loop. Aborting the returned handles stops them.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting node {} on {}", self.id, self.address);

        let heartbeat = {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(node.config.cluster.heartbeat_interval());
                loop {
                    interval.tick().await;
                    if let Err(e) = node.heartbeat().await {
                        tracing::warn!("Heartbeat failed: {}", e);
                    }
                }
            })
        };

        let reconcile = {
            let node = self.clone();
            let events = self.directory.subscribe();
            tokio::spawn(async move { node.reconcile_loop(events).await })
        };

        let view = {
            let view = self.view.clone();
            let events = self.directory.subscribe();
            tokio::spawn(async move { view.follow(events).await })
        };

        let planner = tokio::spawn(self.planner.clone().run());

        let stats = {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STATS_INTERVAL);
                loop {
                    interval.tick().await;
                    node.log_stats().await;
                }
            })
        };

        vec![heartbeat, reconcile, view, planner, stats]
    }

    async fn reconcile_loop(&self, mut events: DirectorySubscription) {
        // Periodic pass picks up index setting changes and anything missed
        let period = self.config.cluster.heartbeat_interval() * 5;
        loop {
            if let Err(e) = self.reconcile().await {
                tracing::warn!("Reconcile failed: {}", e);
            }

            let deadline = tokio::time::sleep(period);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.next() => match event {
                        Some(DirectoryEvent::AssignmentChanged(_)) | Some(DirectoryEvent::Resync) => {
                            tokio::time::sleep(RECONCILE_DEBOUNCE).await;
                            break;
                        }
                        Some(_) => continue,
                        None => return,
                    },
                }
            }
        }
    }

    async fn log_stats(&self) {
        let alive = match self.registry.alive_nodes().await {
            Ok(alive) => alive,
            Err(e) => {
                tracing::warn!("Cluster stats unavailable: {}", e);
                return;
            }
        };
        let hosted = self.manager.hosted_shards();
        let cache = self.cache().stats();
        tracing::info!(
            "Cluster stats: {} alive nodes, {} shards hosted here, cache {} hits / {} misses",
            alive.len(),
            hosted.len(),
            cache.hits,
            cache.misses
        );
        for (shard, role) in hosted {
            tracing::debug!(shard = %shard, "  - {:?}", role);
        }
    }
}
