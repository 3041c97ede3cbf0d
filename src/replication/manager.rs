use super::primary::PrimaryShard;
use super::replica::ReplicaShard;
use super::types::*;
use crate::config::ReplicationConfig;
use crate::directory::registry::NodeStats;
use crate::directory::service::ClusterDirectory;
use crate::directory::types::*;
use crate::error::{ClusterError, Result};
use crate::index::engine::{IndexFactory, LocalIndex};
use crate::index::types::{LocalSearchResult, ShardQuery, WriteOp};
use crate::retry::RetryPolicy;
use crate::transport::NodeTransport;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shortest pause between background generation bumps.
const PUBLISH_RETRY_FLOOR: Duration = Duration::from_millis(20);

/// This node's role for one hosted shard.
#[derive(Clone)]
pub enum LocalRole {
    Primary(Arc<PrimaryShard>),
    Replica(Arc<ReplicaShard>),
}

impl LocalRole {
    pub fn kind(&self) -> ReplicaRole {
        match self {
            LocalRole::Primary(_) => ReplicaRole::Primary,
            LocalRole::Replica(_) => ReplicaRole::Replica,
        }
    }
}

/// A shard copy living on this node, with the assignment and index settings
/// it was last reconciled against.
pub struct HostedShard {
    pub shard: ShardId,
    index: Arc<dyn LocalIndex>,
    role: RwLock<LocalRole>,
    assignment: RwLock<ShardAssignment>,
    settings: RwLock<IndexRecord>,
}

impl HostedShard {
    pub fn role(&self) -> LocalRole {
        self.role.read().clone()
    }

    pub fn assignment(&self) -> ShardAssignment {
        self.assignment.read().clone()
    }

    /// Last token reflected in the local index.
    pub fn applied(&self) -> CommitToken {
        match &*self.role.read() {
            LocalRole::Primary(primary) => primary.last_token(),
            LocalRole::Replica(replica) => replica.applied(),
        }
    }

    fn primary_node(&self) -> Option<NodeId> {
        self.assignment.read().primary().map(|p| p.node.clone())
    }

    /// Nodes holding non-primary copies.
    fn followers(&self) -> Vec<NodeId> {
        self.assignment
            .read()
            .replicas
            .iter()
            .filter(|r| !r.is_primary())
            .map(|r| r.node.clone())
            .collect()
    }
}

/// Per-node owner of every hosted shard: orders and ships writes for shards
/// this node leads, applies shipped writes for shards it follows, and moves
/// shards between roles as the published assignment changes.
pub struct ReplicationManager {
    node_id: NodeId,
    directory: Arc<ClusterDirectory>,
    transport: Arc<dyn NodeTransport>,
    factory: Arc<dyn IndexFactory>,
    shards: DashMap<ShardId, Arc<HostedShard>>,
    config: ReplicationConfig,
    retry: RetryPolicy,
}

impl ReplicationManager {
    pub fn new(
        node_id: NodeId,
        directory: Arc<ClusterDirectory>,
        transport: Arc<dyn NodeTransport>,
        factory: Arc<dyn IndexFactory>,
        config: ReplicationConfig,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            directory,
            transport,
            factory,
            shards: DashMap::new(),
            config,
            retry,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn hosted(&self, shard: &ShardId) -> Result<Arc<HostedShard>> {
        self.shards
            .get(shard)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| stale(shard))
    }

    pub fn hosted_shards(&self) -> Vec<(ShardId, ReplicaRole)> {
        let mut shards: Vec<(ShardId, ReplicaRole)> = self
            .shards
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().role().kind()))
            .collect();
        shards.sort_by(|a, b| a.0.cmp(&b.0));
        shards
    }

    pub fn stats(&self) -> NodeStats {
        let hosted = self.hosted_shards();
        NodeStats {
            primary_shards: hosted
                .iter()
                .filter(|(_, role)| *role == ReplicaRole::Primary)
                .count(),
            hosted_shards: hosted.len(),
        }
    }

    // --- Primary side ---

    /// Commits `op` on this node as the shard's primary, ships it to every
    /// follower and waits for the index's write quorum.
    pub async fn write(self: &Arc<Self>, shard: &ShardId, op: WriteOp) -> Result<WriteResult> {
        let hosted = self.hosted(shard)?;
        let LocalRole::Primary(primary) = hosted.role() else {
            return Err(stale(shard));
        };
        let followers = hosted.followers();
        let quorum = hosted.settings.read().write_quorum as usize;

        let entry = primary.commit(op)?;
        tracing::debug!(shard = %shard, token = %entry.token, "Committed {}", entry.op.doc_id());

        for node in &followers {
            self.spawn_ship(node.clone(), entry.clone());
        }
        self.mark_lagging(&hosted, &primary, &followers).await;

        let generation = self.publish_commit(shard, entry.token).await;
        let deadline = Instant::now() + self.config.write_timeout();
        let acked = primary
            .wait_for_quorum(entry.token, quorum, &followers, deadline)
            .await?;

        Ok(WriteResult {
            shard: shard.shard,
            token: entry.token,
            generation,
            acked,
        })
    }

    /// Bumps the index generation for a committed write. The write stands
    /// whether or not the store is reachable, so a failed bump is retried in
    /// the background instead of failing the caller.
    async fn publish_commit(self: &Arc<Self>, shard: &ShardId, token: CommitToken) -> Option<u64> {
        let error = match self.directory.publish_commit(shard, token).await {
            Ok(generation) => return Some(generation),
            Err(e) => e,
        };
        tracing::warn!(shard = %shard, token = %token, "Generation bump failed, retrying in background: {}", error);

        let manager = self.clone();
        let shard = shard.clone();
        tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                tokio::time::sleep(manager.retry.delay_for(attempt).max(PUBLISH_RETRY_FLOOR)).await;
                match manager.directory.publish_commit(&shard, token).await {
                    Ok(generation) => {
                        tracing::info!(shard = %shard, token = %token, "Published generation {}", generation);
                        return;
                    }
                    Err(ClusterError::IndexNotFound(_)) => return,
                    Err(e) => {
                        tracing::debug!(shard = %shard, attempt, "Generation bump still failing: {}", e);
                        attempt += 1;
                    }
                }
            }
        });
        None
    }

    fn spawn_ship(self: &Arc<Self>, node: NodeId, entry: ReplicationEntry) {
        let manager = self.clone();
        tokio::spawn(async move {
            let shipped = manager
                .retry
                .run("replicate", || manager.transport.replicate(&node, entry.clone()))
                .await;
            match shipped {
                Ok(ack) => {
                    if let Err(e) = manager.acknowledge(ack).await {
                        tracing::debug!(shard = %entry.shard, node = %node, "Ack not recorded: {}", e);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        shard = %entry.shard,
                        node = %node,
                        token = %entry.token,
                        "Replication failed: {}",
                        e
                    );
                }
            }
        });
    }

    /// Flags followers that fell too far behind as STALE.
    async fn mark_lagging(&self, hosted: &HostedShard, primary: &PrimaryShard, followers: &[NodeId]) {
        for (node, applied) in primary.lagging(followers) {
            let already_stale = hosted
                .assignment
                .read()
                .replica_for(&node)
                .is_some_and(|r| r.health == ReplicaHealth::Stale);
            if already_stale {
                continue;
            }
            tracing::warn!(shard = %hosted.shard, node = %node, "Replica lagging at {}; marking STALE", applied);
            if let Err(e) = self
                .directory
                .report_replica_progress(&hosted.shard, &node, applied, ReplicaHealth::Stale)
                .await
            {
                tracing::warn!(shard = %hosted.shard, "Could not mark {} STALE: {}", node, e);
            }
        }
    }

    /// Records a follower's progress and publishes its health.
    pub async fn acknowledge(&self, ack: ReplicaAck) -> Result<()> {
        let hosted = self.hosted(&ack.shard)?;
        let LocalRole::Primary(primary) = hosted.role() else {
            return Err(stale(&ack.shard));
        };

        let (applied, health) = match primary.record_ack(&ack) {
            Ok(()) if ack.needs_resync => (ack.applied, ReplicaHealth::Stale),
            Ok(()) => (ack.applied, ReplicaHealth::Ok),
            Err(ClusterError::ReplicationLag { node, lag, .. }) => {
                tracing::warn!(shard = %ack.shard, node = %node, lag, "Replica lags the primary");
                (ack.applied, ReplicaHealth::Stale)
            }
            Err(ClusterError::StaleAssignment { .. }) => {
                // Its token belongs to another primary's history; publish none
                tracing::debug!(shard = %ack.shard, node = %ack.node, "Ack from term {} ignored", ack.term);
                (CommitToken::ZERO, ReplicaHealth::Stale)
            }
            Err(e) => return Err(e),
        };

        self.directory
            .report_replica_progress(&ack.shard, &ack.node, applied, health)
            .await
    }

    /// Serves a follower's catch-up request.
    pub fn shard_sync(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let hosted = self.hosted(&request.shard)?;
        let LocalRole::Primary(primary) = hosted.role() else {
            return Err(stale(&request.shard));
        };
        primary.sync_response(request)
    }

    /// Publishes the primary's own applied token for every shard it leads, so
    /// a promotion can compare it against the followers.
    pub async fn report_progress(&self) -> Result<()> {
        let leaders: Vec<(ShardId, Arc<PrimaryShard>)> = self
            .shards
            .iter()
            .filter_map(|entry| match entry.value().role() {
                LocalRole::Primary(primary) => Some((entry.key().clone(), primary)),
                LocalRole::Replica(_) => None,
            })
            .collect();
        for (shard, primary) in leaders {
            self.directory
                .report_replica_progress(&shard, &self.node_id, primary.last_token(), ReplicaHealth::Ok)
                .await?;
        }
        Ok(())
    }

    // --- Replica side ---

    /// Applies an operation shipped by the shard's primary.
    pub async fn apply_replicated(self: &Arc<Self>, entry: ReplicationEntry) -> Result<ReplicaAck> {
        let shard = entry.shard.clone();
        let hosted = self.hosted(&shard)?;
        let LocalRole::Replica(replica) = hosted.role() else {
            return Err(stale(&shard));
        };

        let outcome = replica.apply(entry)?;
        if outcome.needs_resync {
            self.spawn_resync(shard.clone(), false);
        }
        // A held gap means missing history; the copy must not serve reads
        // until the gap closes
        Ok(ReplicaAck {
            shard,
            node: self.node_id.clone(),
            applied: outcome.applied,
            term: replica.term(),
            needs_resync: outcome.needs_resync || outcome.buffered > 0 || !replica.is_seeded(),
        })
    }

    /// Pulls missing operations (or a snapshot when `full`, or when replay is
    /// impossible) from the current primary and reports the result to it.
    pub async fn resync(&self, shard: &ShardId, full: bool) -> Result<CommitToken> {
        let hosted = self.hosted(shard)?;
        let LocalRole::Replica(replica) = hosted.role() else {
            return Err(stale(shard));
        };
        if !replica.begin_sync() {
            return Ok(replica.applied());
        }
        replica.take_missed();
        let mut result = self.pull(&hosted, &replica, full).await;
        // Ops of the new term that arrived mid-sync were dropped
        if result.is_ok() && replica.take_missed() {
            result = self.pull(&hosted, &replica, false).await;
        }
        replica.end_sync();
        result
    }

    async fn pull(&self, hosted: &HostedShard, replica: &ReplicaShard, full: bool) -> Result<CommitToken> {
        let primary = hosted
            .primary_node()
            .ok_or_else(|| ClusterError::ShardUnavailable {
                index: hosted.shard.index.clone(),
                shard: hosted.shard.shard,
            })?;
        let request = SyncRequest {
            shard: hosted.shard.clone(),
            from: replica.applied(),
            term: replica.term(),
            full,
        };

        let response = self
            .retry
            .run("shard sync", || self.transport.shard_sync(&primary, request.clone()))
            .await?;
        let outcome = replica.install(response)?;
        tracing::info!(
            shard = %hosted.shard,
            "Synced from {} ({} -> {})",
            primary,
            request.from,
            outcome.applied
        );

        let ack = ReplicaAck {
            shard: hosted.shard.clone(),
            node: self.node_id.clone(),
            applied: outcome.applied,
            term: replica.term(),
            needs_resync: outcome.buffered > 0,
        };
        self.transport.acknowledge(&primary, ack).await?;
        Ok(outcome.applied)
    }

    fn spawn_resync(self: &Arc<Self>, shard: ShardId, full: bool) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.resync(&shard, full).await {
                tracing::warn!(shard = %shard, "Resync failed: {}", e);
            }
        });
    }

    // --- Either role ---

    /// Runs `query` on the local copy, stamped with the token it reflects.
    pub fn search_local(&self, shard: &ShardId, query: &ShardQuery) -> Result<LocalSearchResult> {
        let hosted = self.hosted(shard)?;
        let applied = hosted.applied();
        let mut result = hosted.index.search(query)?;
        result.applied = applied;
        Ok(result)
    }

    pub fn fetch_local(&self, shard: &ShardId, doc_id: &str) -> Result<Option<Value>> {
        self.hosted(shard)?.index.get(doc_id)
    }

    /// Aligns hosted shards with the published assignments: opens newly
    /// assigned shards, promotes or demotes on role changes, and drops shards
    /// no longer assigned here.
    pub async fn reconcile(self: &Arc<Self>) -> Result<()> {
        let topology = self.directory.get_topology().await?;
        let mut assigned: HashSet<ShardId> = HashSet::new();

        for (shard, assignment) in &topology.assignments {
            let Some(mine) = assignment.replica_for(&self.node_id) else {
                continue;
            };
            let Some(settings) = topology.indexes.get(&shard.index) else {
                continue;
            };
            assigned.insert(shard.clone());
            self.reconcile_shard(assignment, mine, settings)?;
        }

        let dropped: Vec<ShardId> = self
            .shards
            .iter()
            .filter(|entry| !assigned.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for shard in dropped {
            self.shards.remove(&shard);
            tracing::info!(shard = %shard, "Shard no longer hosted here");
        }
        Ok(())
    }

    fn reconcile_shard(
        self: &Arc<Self>,
        assignment: &ShardAssignment,
        mine: &ReplicaAssignment,
        settings: &IndexRecord,
    ) -> Result<()> {
        let shard = &assignment.shard;
        let Some(hosted) = self.shards.get(shard).map(|e| e.value().clone()) else {
            let index = self.factory.open(shard)?;
            let role = match mine.role {
                ReplicaRole::Primary => LocalRole::Primary(Arc::new(self.new_primary(
                    shard,
                    index.clone(),
                    assignment.epoch,
                    CommitToken::ZERO,
                ))),
                ReplicaRole::Replica => LocalRole::Replica(Arc::new(self.new_replica(shard, index.clone()))),
            };
            self.shards.insert(
                shard.clone(),
                Arc::new(HostedShard {
                    shard: shard.clone(),
                    index,
                    role: RwLock::new(role),
                    assignment: RwLock::new(assignment.clone()),
                    settings: RwLock::new(settings.clone()),
                }),
            );
            tracing::info!(shard = %shard, "Now hosting as {:?}", mine.role);
            if mine.role == ReplicaRole::Replica {
                self.spawn_resync(shard.clone(), true);
            }
            return Ok(());
        };

        let previous_primary = hosted.primary_node();
        *hosted.assignment.write() = assignment.clone();
        *hosted.settings.write() = settings.clone();

        match (hosted.role(), mine.role) {
            (LocalRole::Replica(replica), ReplicaRole::Primary) => {
                let applied = replica.applied();
                let primary = self
                    .new_primary(shard, hosted.index.clone(), assignment.epoch, applied)
                    .inheriting(replica.term());
                *hosted.role.write() = LocalRole::Primary(Arc::new(primary));
                tracing::info!(shard = %shard, "Promoted to primary at {}", applied);
            }
            (LocalRole::Primary(_), ReplicaRole::Replica) => {
                let replica = self.new_replica(shard, hosted.index.clone());
                *hosted.role.write() = LocalRole::Replica(Arc::new(replica));
                tracing::warn!(shard = %shard, "Demoted to replica; resyncing");
                self.spawn_resync(shard.clone(), true);
            }
            (LocalRole::Replica(replica), ReplicaRole::Replica) => {
                let primary_changed = assignment.primary().map(|p| &p.node) != previous_primary.as_ref();
                if primary_changed {
                    // Buffered operations came from the old primary
                    replica.truncate_pending();
                }
                let behind = mine.health == ReplicaHealth::Stale || replica.pending_len() > 0;
                if assignment.primary().is_some() && (primary_changed || behind) {
                    self.spawn_resync(shard.clone(), false);
                }
            }
            (LocalRole::Primary(_), ReplicaRole::Primary) => {}
        }
        Ok(())
    }

    fn new_primary(
        &self,
        shard: &ShardId,
        index: Arc<dyn LocalIndex>,
        term: u64,
        applied: CommitToken,
    ) -> PrimaryShard {
        PrimaryShard::new(
            shard.clone(),
            index,
            term,
            applied,
            self.config.retained_ops,
            self.config.stale_lag_threshold,
        )
    }

    fn new_replica(&self, shard: &ShardId, index: Arc<dyn LocalIndex>) -> ReplicaShard {
        ReplicaShard::new(
            shard.clone(),
            index,
            CommitToken::ZERO,
            0,
            self.config.max_pending_ops,
        )
    }
}

fn stale(shard: &ShardId) -> ClusterError {
    ClusterError::StaleAssignment {
        index: shard.index.clone(),
        shard: shard.shard,
    }
}
