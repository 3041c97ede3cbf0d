use crate::directory::service::{ClusterDirectory, DirectorySubscription};
use crate::directory::types::*;
use crate::error::Result;

use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A router's read of one index: its settings, every shard's replica set and
/// the nodes currently alive.
#[derive(Debug, Clone)]
pub struct IndexView {
    pub index: IndexRecord,
    pub assignments: BTreeMap<u32, ShardAssignment>,
    pub alive: HashSet<NodeId>,
    fetched_at: Instant,
}

impl IndexView {
    pub fn assignment(&self, shard: u32) -> Option<&ShardAssignment> {
        self.assignments.get(&shard)
    }

    pub fn primary(&self, shard: u32) -> Option<&ReplicaAssignment> {
        self.assignment(shard).and_then(|a| a.primary())
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.alive.contains(node)
    }
}

/// TTL cache of [`IndexView`]s. Entries are dropped on directory change
/// notifications and whenever a node reports a stale assignment.
pub struct AssignmentView {
    directory: Arc<ClusterDirectory>,
    ttl: Duration,
    views: DashMap<String, Arc<IndexView>>,
}

impl AssignmentView {
    pub fn new(directory: Arc<ClusterDirectory>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            directory,
            ttl,
            views: DashMap::new(),
        })
    }

    pub async fn get(&self, index: &str) -> Result<Arc<IndexView>> {
        if let Some(view) = self.views.get(index)
            && view.fetched_at.elapsed() < self.ttl
        {
            return Ok(view.clone());
        }
        self.refresh(index).await
    }

    pub async fn refresh(&self, index: &str) -> Result<Arc<IndexView>> {
        let record = self.directory.require_index(index).await?;
        let assignments = self
            .directory
            .list_assignments(index)
            .await?
            .into_iter()
            .map(|a| (a.shard.shard, a))
            .collect();
        let alive = self
            .directory
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.is_alive())
            .map(|n| n.id)
            .collect();

        let view = Arc::new(IndexView {
            index: record,
            assignments,
            alive,
            fetched_at: Instant::now(),
        });
        self.views.insert(index.to_string(), view.clone());
        Ok(view)
    }

    pub fn invalidate(&self, index: &str) {
        if self.views.remove(index).is_some() {
            tracing::debug!(index, "Assignment view invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        self.views.clear();
    }

    pub fn apply(&self, event: &DirectoryEvent) {
        match event {
            DirectoryEvent::AssignmentChanged(shard) => self.invalidate(&shard.index),
            DirectoryEvent::IndexChanged(name) => self.invalidate(name),
            DirectoryEvent::Resync => self.invalidate_all(),
            // Every heartbeat rewrites a node record; `follow` looks up
            // whether liveness actually changed
            DirectoryEvent::NodeChanged(_) | DirectoryEvent::LockChanged(_) => {}
        }
    }

    /// Drops the views that disagree with `node`'s current liveness.
    pub fn node_liveness(&self, node: &NodeId, alive: bool) {
        self.views.retain(|index, view| {
            let current = view.is_alive(node) == alive;
            if !current {
                tracing::debug!(index = %index, node = %node, alive, "Assignment view invalidated");
            }
            current
        });
    }

    /// Applies notifications until the subscription closes.
    pub async fn follow(&self, mut subscription: DirectorySubscription) {
        while let Some(event) = subscription.next().await {
            let DirectoryEvent::NodeChanged(node) = &event else {
                self.apply(&event);
                continue;
            };
            match self.directory.get_node(node).await {
                Ok(record) => self.node_liveness(node, record.is_some_and(|r| r.is_alive())),
                Err(e) => {
                    tracing::debug!(node = %node, "Node lookup failed: {}", e);
                    self.invalidate_all();
                }
            }
        }
    }
}
