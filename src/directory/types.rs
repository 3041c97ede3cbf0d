use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Liveness of a node as judged by heartbeat silence.
///
/// `Alive -> Suspect -> Dead` on missed heartbeats; any heartbeat moves a node
/// back to `Alive`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl NodeState {
    /// State a node should be in after `silence` without a heartbeat.
    /// States only move forward here; recovery happens on heartbeat.
    pub fn after_silence(self, silence: Duration, suspect_after: Duration, dead_after: Duration) -> Self {
        match self {
            NodeState::Alive if silence > dead_after => NodeState::Dead,
            NodeState::Alive if silence > suspect_after => NodeState::Suspect,
            NodeState::Suspect if silence > dead_after => NodeState::Dead,
            other => other,
        }
    }

    pub fn on_heartbeat(self) -> Self {
        NodeState::Alive
    }
}

/// A cluster member as recorded in the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: SocketAddr,
    pub state: NodeState,
    /// Wall-clock millis of the last heartbeat.
    pub last_seen: u64,
    /// Relative capacity. Load is divided by it when placing shards.
    pub capacity: f64,
}

impl NodeRecord {
    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexRecord {
    pub name: String,
    /// Fixed at creation.
    pub shard_count: u32,
    pub replication_factor: u32,
    /// Acknowledgments (primary included) required before a write is durable.
    pub write_quorum: u32,
    /// Relative cost of hosting this index; spread over its shards.
    pub weight: u32,
    /// Incremented on every committed write batch.
    pub generation: u64,
    /// Highest token committed on each shard as of `generation`. A copy
    /// that has applied less cannot answer for this generation.
    #[serde(default)]
    pub shard_tokens: BTreeMap<u32, CommitToken>,
}

impl IndexRecord {
    pub fn new(name: &str, shard_count: u32, replication_factor: u32) -> Self {
        Self {
            name: name.to_string(),
            shard_count,
            replication_factor,
            write_quorum: 1,
            weight: 1,
            generation: 0,
            shard_tokens: BTreeMap::new(),
        }
    }

    pub fn with_quorum(mut self, quorum: u32) -> Self {
        self.write_quorum = quorum;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn committed(&self, shard: u32) -> CommitToken {
        self.shard_tokens.get(&shard).copied().unwrap_or_default()
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..self.shard_count).map(move |n| ShardId::new(&self.name, n))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId {
    pub index: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: &str, shard: u32) -> Self {
        Self {
            index: index.to_string(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.shard)
    }
}

/// Per-shard, strictly increasing sequence number assigned by the primary at
/// local commit time. `CommitToken::ZERO` means nothing applied yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CommitToken(pub u64);

impl CommitToken {
    pub const ZERO: CommitToken = CommitToken(0);

    pub fn next(self) -> Self {
        CommitToken(self.0 + 1)
    }

    pub fn lag_behind(self, leader: CommitToken) -> u64 {
        leader.0.saturating_sub(self.0)
    }
}

impl fmt::Display for CommitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicaRole {
    Primary,
    Replica,
}

/// `Stale` replicas are excluded from query selection until they catch up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicaHealth {
    Ok,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaAssignment {
    pub node: NodeId,
    pub role: ReplicaRole,
    pub applied_token: CommitToken,
    pub health: ReplicaHealth,
}

impl ReplicaAssignment {
    pub fn primary(node: NodeId) -> Self {
        Self {
            node,
            role: ReplicaRole::Primary,
            applied_token: CommitToken::ZERO,
            health: ReplicaHealth::Ok,
        }
    }

    /// A freshly placed replica starts STALE until its snapshot resync lands.
    pub fn pending_replica(node: NodeId) -> Self {
        Self {
            node,
            role: ReplicaRole::Replica,
            applied_token: CommitToken::ZERO,
            health: ReplicaHealth::Stale,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == ReplicaRole::Primary
    }
}

/// Replica set of one shard. Published as a single record so readers never
/// observe a half-updated set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardAssignment {
    pub shard: ShardId,
    pub replicas: Vec<ReplicaAssignment>,
    /// Incremented by the planner on every role or membership change.
    pub epoch: u64,
}

impl ShardAssignment {
    pub fn empty(shard: ShardId) -> Self {
        Self {
            shard,
            replicas: Vec::new(),
            epoch: 0,
        }
    }

    pub fn primary(&self) -> Option<&ReplicaAssignment> {
        self.replicas.iter().find(|r| r.is_primary())
    }

    pub fn replica_for(&self, node: &NodeId) -> Option<&ReplicaAssignment> {
        self.replicas.iter().find(|r| &r.node == node)
    }

    pub fn hosts(&self, node: &NodeId) -> bool {
        self.replica_for(node).is_some()
    }

    pub fn primary_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_primary()).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub name: String,
    pub owner: NodeId,
    /// Wall-clock millis after which the lock may be taken over.
    pub expiry: u64,
}

/// Point-in-time read of the whole directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    pub indexes: BTreeMap<String, IndexRecord>,
    /// Serialized as a list; every assignment carries its own shard id.
    #[serde(with = "assignment_list")]
    pub assignments: BTreeMap<ShardId, ShardAssignment>,
}

mod assignment_list {
    use super::{ShardAssignment, ShardId};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ShardId, ShardAssignment>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ShardId, ShardAssignment>, D::Error> {
        let list = Vec::<ShardAssignment>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|a| (a.shard.clone(), a)).collect())
    }
}

impl Topology {
    pub fn alive_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values().filter(|n| n.is_alive())
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.nodes.get(node).map(|n| n.is_alive()).unwrap_or(false)
    }

    pub fn shards_of<'a>(&'a self, index: &'a str) -> impl Iterator<Item = &'a ShardAssignment> + 'a {
        self.assignments
            .values()
            .filter(move |a| a.shard.index == index)
    }
}

/// Change notification pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    NodeChanged(NodeId),
    IndexChanged(String),
    AssignmentChanged(ShardId),
    LockChanged(String),
    /// Notifications were dropped; subscribers should re-read everything.
    Resync,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
