use crate::directory::types::{IndexRecord, NodeId, ReplicaRole, Topology};

use std::collections::{BTreeMap, HashSet};

/// Replicas weigh this much less than primaries, so primaries spread first.
pub const REPLICA_WEIGHT_DELTA: f64 = 0.01;

/// Weighted shard load per placeable node.
///
/// A hosted shard costs `index weight / shard count` (less
/// `REPLICA_WEIGHT_DELTA` for a replica); a node's load is the sum of its
/// costs divided by its advertised capacity.
#[derive(Debug, Clone, Default)]
pub struct NodeLoads {
    raw: BTreeMap<NodeId, f64>,
    capacity: BTreeMap<NodeId, f64>,
}

impl NodeLoads {
    /// Loads of every alive node in `topology`, counting all current assignments.
    pub fn from_topology(topology: &Topology) -> Self {
        let mut loads = NodeLoads::default();
        for node in topology.alive_nodes() {
            loads.add_node(node.id.clone(), node.capacity);
        }
        for assignment in topology.assignments.values() {
            let Some(index) = topology.indexes.get(&assignment.shard.index) else {
                continue;
            };
            for replica in &assignment.replicas {
                loads.add_shard(&replica.node, index, replica.role);
            }
        }
        loads
    }

    pub fn add_node(&mut self, node: NodeId, capacity: f64) {
        self.capacity.insert(node.clone(), capacity);
        self.raw.entry(node).or_insert(0.0);
    }

    pub fn add_shard(&mut self, node: &NodeId, index: &IndexRecord, role: ReplicaRole) {
        if let Some(load) = self.raw.get_mut(node) {
            *load += shard_cost(index, role);
        }
    }

    pub fn remove_shard(&mut self, node: &NodeId, index: &IndexRecord, role: ReplicaRole) {
        if let Some(load) = self.raw.get_mut(node) {
            *load = (*load - shard_cost(index, role)).max(0.0);
        }
    }

    pub fn load(&self, node: &NodeId) -> Option<f64> {
        let raw = self.raw.get(node)?;
        let capacity = self.capacity.get(node).copied().unwrap_or(1.0);
        Some(if capacity > 0.0 { raw / capacity } else { f64::INFINITY })
    }

    /// Least-loaded node outside `exclude`; ties go to the lowest id.
    pub fn least_loaded(&self, exclude: &HashSet<NodeId>) -> Option<NodeId> {
        self.raw
            .keys()
            .filter(|node| !exclude.contains(*node))
            .filter_map(|node| self.load(node).map(|load| (node, load)))
            // BTreeMap order makes the first minimum the lowest id
            .fold(None, |best: Option<(&NodeId, f64)>, (node, load)| match best {
                Some((_, best_load)) if best_load <= load => best,
                _ => Some((node, load)),
            })
            .map(|(node, _)| node.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

pub fn shard_cost(index: &IndexRecord, role: ReplicaRole) -> f64 {
    let per_shard = f64::from(index.weight.max(1)) / f64::from(index.shard_count.max(1));
    match role {
        ReplicaRole::Primary => per_shard,
        ReplicaRole::Replica => (per_shard - REPLICA_WEIGHT_DELTA).max(0.0),
    }
}
