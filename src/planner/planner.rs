use super::load::NodeLoads;
use super::plan::{ShardPlan, plan_shard};
use crate::config::ClusterConfig;
use crate::directory::registry::NodeRegistry;
use crate::directory::service::{ClusterDirectory, DirectorySubscription, LockHandle, PLANNER_LOCK};
use crate::directory::types::*;
use crate::error::{ClusterError, Result};

use std::sync::Arc;
use std::time::Duration;

/// What one planning pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanReport {
    pub transitions: Vec<(NodeId, NodeState)>,
    pub published: Vec<ShardAssignment>,
    /// Shards whose every copy is on a dead node.
    pub unavailable: Vec<ShardId>,
}

/// Computes and publishes shard placement. Only the holder of the planner
/// lock mutates assignments, and it stops the moment the lock is lost.
pub struct ShardPlanner {
    node_id: NodeId,
    directory: Arc<ClusterDirectory>,
    registry: Arc<NodeRegistry>,
    lock_ttl: Duration,
    interval: Duration,
}

impl ShardPlanner {
    pub fn new(
        node_id: NodeId,
        directory: Arc<ClusterDirectory>,
        registry: Arc<NodeRegistry>,
        config: &ClusterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            directory,
            registry,
            lock_ttl: config.lock_ttl(),
            interval: Duration::from_millis(config.planner_interval_ms),
        })
    }

    /// One planning pass: applies heartbeat timeouts, then re-plans every
    /// shard of every index and publishes the ones that changed.
    pub async fn rebalance(&self, lock: &LockHandle) -> Result<PlanReport> {
        lock.ensure_valid()?;
        let mut report = PlanReport {
            transitions: self.registry.sweep().await?,
            ..Default::default()
        };

        let topology = self.directory.get_topology().await?;
        let mut loads = NodeLoads::from_topology(&topology);
        if loads.is_empty() {
            tracing::debug!("No alive nodes; nothing to place");
        }

        for index in topology.indexes.values() {
            for shard in index.shards() {
                // Checked per shard so a lost lock stops the pass mid-way
                lock.ensure_valid()?;
                let current = topology
                    .assignments
                    .get(&shard)
                    .cloned()
                    .unwrap_or_else(|| ShardAssignment::empty(shard.clone()));

                match plan_shard(&current, index, &topology.nodes, &mut loads) {
                    ShardPlan::Unchanged => {}
                    ShardPlan::Updated(planned) => {
                        let published = self.directory.publish_assignment(lock, planned).await?;
                        tracing::info!(
                            shard = %shard,
                            epoch = published.epoch,
                            "Published assignment: {}",
                            describe(&published)
                        );
                        report.published.push(published);
                    }
                    ShardPlan::NoLiveCopy => {
                        tracing::warn!(shard = %shard, "No live copy left; shard unavailable");
                        report.unavailable.push(shard);
                    }
                }
            }
        }
        Ok(report)
    }

    /// Competes for the planner lock forever. While held, the lock is renewed
    /// and a pass runs every interval or when an index changes.
    pub async fn run(self: Arc<Self>) {
        tracing::info!("Planner loop started on {}", self.node_id);
        let mut events = self.directory.subscribe();
        let mut held: Option<LockHandle> = None;

        loop {
            held = self.hold_lock(held).await;

            if let Some(lock) = &held {
                match self.rebalance(lock).await {
                    Ok(report) => {
                        if !report.published.is_empty() {
                            tracing::debug!("Planning pass published {} assignments", report.published.len());
                        }
                    }
                    Err(ClusterError::LockLost(_)) => {
                        tracing::warn!("Planner lock lost mid-pass; stopping mutations");
                        held = None;
                    }
                    Err(e) => tracing::warn!("Planning pass failed: {}", e),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = index_changed(&mut events) => {}
            }
        }
    }

    async fn hold_lock(&self, held: Option<LockHandle>) -> Option<LockHandle> {
        match held {
            Some(lock) => match self.directory.renew_lock(&lock, self.lock_ttl).await {
                Ok(true) => Some(lock),
                Ok(false) => {
                    tracing::warn!("Planner lock renewal refused; no longer planning");
                    None
                }
                Err(e) => {
                    tracing::warn!("Planner lock renewal failed: {}", e);
                    // Still usable until its expiry passes
                    lock.is_valid().then_some(lock)
                }
            },
            None => match self
                .directory
                .acquire_lock(PLANNER_LOCK, &self.node_id, self.lock_ttl)
                .await
            {
                Ok(Some(lock)) => {
                    tracing::info!("{} is now the planner", self.node_id);
                    Some(lock)
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::debug!("Planner lock not acquired: {}", e);
                    None
                }
            },
        }
    }
}

/// Resolves on the next index change. Node heartbeats are ignored; their
/// state transitions are caught by the periodic sweep.
async fn index_changed(events: &mut DirectorySubscription) {
    loop {
        match events.next().await {
            Some(DirectoryEvent::IndexChanged(_)) | Some(DirectoryEvent::Resync) => return,
            Some(_) => continue,
            None => std::future::pending::<()>().await,
        }
    }
}

fn describe(assignment: &ShardAssignment) -> String {
    assignment
        .replicas
        .iter()
        .map(|r| match (r.role, r.health) {
            (ReplicaRole::Primary, _) => format!("{}*", r.node),
            (ReplicaRole::Replica, ReplicaHealth::Stale) => format!("{}(stale)", r.node),
            (ReplicaRole::Replica, ReplicaHealth::Ok) => r.node.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
