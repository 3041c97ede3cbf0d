//! Placement of one shard's replica set.
//!
//! Pure over its inputs so the planner's decisions can be tested without a
//! directory. Rules, in order:
//! 1. Copies on nodes that are gone (`Dead` or decommissioned) are dropped.
//!    `Suspect` nodes keep their copies but receive no new ones.
//! 2. Without a surviving primary, the surviving copy with the highest applied
//!    token is promoted (ties: healthy first, then lowest node id). Copies
//!    behind it are marked STALE until they resync from it.
//! 3. Copies beyond the replication factor are removed, worst first.
//! 4. Empty slots go to the least-loaded alive nodes, never two copies per node.

use super::load::NodeLoads;
use crate::directory::types::*;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub enum ShardPlan {
    Unchanged,
    Updated(ShardAssignment),
    /// Every copy sits on a dead node. Writes fail until one comes back.
    NoLiveCopy,
}

pub fn plan_shard(
    current: &ShardAssignment,
    index: &IndexRecord,
    nodes: &BTreeMap<NodeId, NodeRecord>,
    loads: &mut NodeLoads,
) -> ShardPlan {
    let target = index.replication_factor.max(1) as usize;

    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut replicas: Vec<ReplicaAssignment> = current
        .replicas
        .iter()
        .filter(|r| is_retained(nodes, &r.node))
        .filter(|r| seen.insert(r.node.clone()))
        .cloned()
        .collect();
    if replicas.is_empty() && !current.replicas.is_empty() {
        return ShardPlan::NoLiveCopy;
    }

    demote_extra_primaries(&mut replicas, index, loads);
    if !replicas.is_empty() && !replicas.iter().any(|r| r.is_primary()) {
        promote(&mut replicas, index, loads);
    }

    while replicas.len() > target {
        let Some(worst) = replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_primary())
            .max_by(|(_, a), (_, b)| removal_order(a, b))
            .map(|(i, _)| i)
        else {
            break;
        };
        let removed = replicas.remove(worst);
        loads.remove_shard(&removed.node, index, removed.role);
    }

    while replicas.len() < target {
        let taken: HashSet<NodeId> = replicas.iter().map(|r| r.node.clone()).collect();
        let Some(node) = loads.least_loaded(&taken) else {
            break;
        };
        let replica = if replicas.iter().any(|r| r.is_primary()) {
            ReplicaAssignment::pending_replica(node)
        } else {
            ReplicaAssignment::primary(node)
        };
        loads.add_shard(&replica.node, index, replica.role);
        replicas.push(replica);
    }

    replicas.sort_by(|a, b| b.is_primary().cmp(&a.is_primary()).then_with(|| a.node.cmp(&b.node)));

    if same_layout(&current.replicas, &replicas) {
        return ShardPlan::Unchanged;
    }
    ShardPlan::Updated(ShardAssignment {
        shard: current.shard.clone(),
        replicas,
        epoch: current.epoch + 1,
    })
}

fn is_retained(nodes: &BTreeMap<NodeId, NodeRecord>, node: &NodeId) -> bool {
    nodes.get(node).is_some_and(|n| n.state != NodeState::Dead)
}

fn promote(replicas: &mut [ReplicaAssignment], index: &IndexRecord, loads: &mut NodeLoads) {
    let Some(best) = replicas
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| promotion_order(a, b))
        .map(|(i, _)| i)
    else {
        return;
    };

    let chosen = &mut replicas[best];
    loads.remove_shard(&chosen.node, index, ReplicaRole::Replica);
    loads.add_shard(&chosen.node, index, ReplicaRole::Primary);
    chosen.role = ReplicaRole::Primary;
    chosen.health = ReplicaHealth::Ok;
    let baseline = chosen.applied_token;

    for replica in replicas.iter_mut().filter(|r| !r.is_primary()) {
        if replica.applied_token < baseline {
            replica.health = ReplicaHealth::Stale;
        }
    }
}

/// Keeps the furthest-ahead primary if a stale record lists several.
fn demote_extra_primaries(replicas: &mut [ReplicaAssignment], index: &IndexRecord, loads: &mut NodeLoads) {
    if replicas.iter().filter(|r| r.is_primary()).count() <= 1 {
        return;
    }
    let keep = replicas
        .iter()
        .filter(|r| r.is_primary())
        .min_by(|a, b| promotion_order(a, b))
        .map(|r| r.node.clone());
    for replica in replicas.iter_mut() {
        if replica.is_primary() && Some(&replica.node) != keep.as_ref() {
            loads.remove_shard(&replica.node, index, ReplicaRole::Primary);
            loads.add_shard(&replica.node, index, ReplicaRole::Replica);
            replica.role = ReplicaRole::Replica;
            replica.health = ReplicaHealth::Stale;
        }
    }
}

/// Best promotion candidate sorts first.
fn promotion_order(a: &ReplicaAssignment, b: &ReplicaAssignment) -> Ordering {
    b.applied_token
        .cmp(&a.applied_token)
        .then_with(|| health_rank(a).cmp(&health_rank(b)))
        .then_with(|| a.node.cmp(&b.node))
}

/// Best removal candidate sorts last.
fn removal_order(a: &ReplicaAssignment, b: &ReplicaAssignment) -> Ordering {
    health_rank(a)
        .cmp(&health_rank(b))
        .then_with(|| b.applied_token.cmp(&a.applied_token))
        .then_with(|| a.node.cmp(&b.node))
}

fn health_rank(replica: &ReplicaAssignment) -> u8 {
    match replica.health {
        ReplicaHealth::Ok => 0,
        ReplicaHealth::Stale => 1,
    }
}

fn same_layout(a: &[ReplicaAssignment], b: &[ReplicaAssignment]) -> bool {
    let layout = |replicas: &[ReplicaAssignment]| {
        let mut pairs: Vec<(NodeId, bool)> = replicas.iter().map(|r| (r.node.clone(), r.is_primary())).collect();
        pairs.sort();
        pairs
    };
    layout(a) == layout(b)
}
