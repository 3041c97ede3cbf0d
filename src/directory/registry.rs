//! Node Registry & Heartbeat Monitor
//!
//! Heartbeats create or refresh a node's record. A periodic sweep walks every
//! record and applies the silence-based `Alive -> Suspect -> Dead` transitions.

use super::service::ClusterDirectory;
use super::types::{NodeId, NodeRecord, NodeState, now_ms};
use crate::config::ClusterConfig;
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Payload of the fire-and-forget `NodeHeartbeat` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub capacity: f64,
    pub stats: NodeStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStats {
    pub hosted_shards: usize,
    pub primary_shards: usize,
}

pub struct NodeRegistry {
    directory: Arc<ClusterDirectory>,
    suspect_after: Duration,
    dead_after: Duration,
}

impl NodeRegistry {
    pub fn new(directory: Arc<ClusterDirectory>, config: &ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            directory,
            suspect_after: config.suspect_after(),
            dead_after: config.dead_after(),
        })
    }

    /// Registers the node on its first heartbeat, refreshes it afterwards.
    /// Returns `true` when the node's state changed (join or recovery).
    pub async fn record_heartbeat(&self, heartbeat: Heartbeat) -> Result<bool> {
        self.record_heartbeat_at(heartbeat, now_ms()).await
    }

    pub async fn record_heartbeat_at(&self, heartbeat: Heartbeat, now: u64) -> Result<bool> {
        let mut changed = false;
        self.directory
            .update_node(&heartbeat.node_id, |current| {
                let record = match current {
                    Some(existing) => {
                        changed = existing.state != NodeState::Alive
                            || existing.address != heartbeat.address;
                        NodeRecord {
                            state: existing.state.on_heartbeat(),
                            address: heartbeat.address,
                            capacity: heartbeat.capacity,
                            last_seen: now.max(existing.last_seen),
                            ..existing
                        }
                    }
                    None => {
                        changed = true;
                        NodeRecord {
                            id: heartbeat.node_id.clone(),
                            address: heartbeat.address,
                            state: NodeState::Alive,
                            last_seen: now,
                            capacity: heartbeat.capacity,
                        }
                    }
                };
                Ok(Some(record))
            })
            .await?;

        if changed {
            tracing::info!(
                "Node {} is alive at {} ({} shards hosted)",
                heartbeat.node_id,
                heartbeat.address,
                heartbeat.stats.hosted_shards
            );
        } else {
            tracing::trace!("Heartbeat from {}", heartbeat.node_id);
        }
        Ok(changed)
    }

    /// Applies timeout transitions to every node. Returns the nodes whose
    /// state changed, with their new state.
    pub async fn sweep(&self) -> Result<Vec<(NodeId, NodeState)>> {
        self.sweep_at(now_ms()).await
    }

    pub async fn sweep_at(&self, now: u64) -> Result<Vec<(NodeId, NodeState)>> {
        let mut transitions = Vec::new();

        for node in self.directory.list_nodes().await? {
            let silence = Duration::from_millis(now.saturating_sub(node.last_seen));
            let target = node
                .state
                .after_silence(silence, self.suspect_after, self.dead_after);
            if target == node.state {
                continue;
            }

            let updated = self
                .directory
                .update_node(&node.id, |current| {
                    Ok(current.map(|mut record| {
                        // A heartbeat may have landed since the listing.
                        let silence = Duration::from_millis(now.saturating_sub(record.last_seen));
                        record.state =
                            record
                                .state
                                .after_silence(silence, self.suspect_after, self.dead_after);
                        record
                    }))
                })
                .await?;

            if let Some(record) = updated
                && record.state != node.state
            {
                match record.state {
                    NodeState::Suspect => {
                        tracing::warn!("Node {} suspected (no heartbeat for {:?})", node.id, silence)
                    }
                    NodeState::Dead => {
                        tracing::warn!("Node {} declared DEAD (no heartbeat for {:?})", node.id, silence)
                    }
                    NodeState::Alive => {}
                }
                transitions.push((record.id, record.state));
            }
        }

        Ok(transitions)
    }

    /// Removes a node for good. Its replicas are dropped by the next planning pass.
    pub async fn decommission(&self, id: &NodeId) -> Result<()> {
        self.directory.remove_node(id).await?;
        tracing::info!("Node {} decommissioned", id);
        Ok(())
    }

    pub async fn alive_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self
            .directory
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.is_alive())
            .collect())
    }
}
