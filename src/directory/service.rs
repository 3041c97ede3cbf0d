use super::store::{CasOutcome, MetadataStore};
use super::types::*;
use crate::error::{ClusterError, Result};
use crate::retry::RetryPolicy;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const NODES: &str = "nodes/";
const INDEXES: &str = "indexes/";
const SHARDS: &str = "shards/";
const LOCKS: &str = "locks/";

/// Name of the lock whose holder runs the shard planner.
pub const PLANNER_LOCK: &str = "planner";

/// Typed access to node, index, assignment and lock records.
///
/// Every mutation is an optimistic read-modify-CAS loop. A CAS conflict backs
/// off and retries; an unreachable store surfaces as `ClusterError::Transient`.
pub struct ClusterDirectory {
    store: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
    cas_attempts: usize,
}

/// Proof of holding a directory lock. Cloned handles share validity, and a
/// failed renewal invalidates every clone immediately.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<LockHandleInner>,
}

struct LockHandleInner {
    name: String,
    owner: NodeId,
    version: AtomicU64,
    expiry: AtomicU64,
    valid: AtomicBool,
}

impl LockHandle {
    fn new(name: &str, owner: &NodeId, version: u64, expiry: u64) -> Self {
        Self {
            inner: Arc::new(LockHandleInner {
                name: name.to_string(),
                owner: owner.clone(),
                version: AtomicU64::new(version),
                expiry: AtomicU64::new(expiry),
                valid: AtomicBool::new(true),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn owner(&self) -> &NodeId {
        &self.inner.owner
    }

    pub fn expiry(&self) -> u64 {
        self.inner.expiry.load(Ordering::SeqCst)
    }

    /// False once renewal failed, the lock was released, or it expired.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst) && now_ms() < self.expiry()
    }

    pub fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::SeqCst);
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ClusterError::LockLost(self.inner.name.clone()))
        }
    }
}

/// Receives directory change notifications.
pub struct DirectorySubscription {
    rx: broadcast::Receiver<String>,
}

impl DirectorySubscription {
    /// Next change, or `None` once the store's notification channel closes.
    pub async fn next(&mut self) -> Option<DirectoryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(key) => {
                    if let Some(event) = event_for_key(&key) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("Directory subscriber lagged by {} events", missed);
                    return Some(DirectoryEvent::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl ClusterDirectory {
    pub fn new(store: Arc<dyn MetadataStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            cas_attempts: retry.attempts.max(1) * 4,
        }
    }

    // --- Nodes ---

    pub async fn put_node_state(&self, record: NodeRecord) -> Result<()> {
        let key = node_key(&record.id);
        self.update::<NodeRecord, _>(&key, |_| Ok(Some(record.clone())))
            .await?;
        Ok(())
    }

    /// Read-modify-write of one node record. `f` sees the current record and
    /// returns the new one (`None` deletes).
    pub async fn update_node<F>(&self, id: &NodeId, f: F) -> Result<Option<NodeRecord>>
    where
        F: FnMut(Option<NodeRecord>) -> Result<Option<NodeRecord>>,
    {
        self.update(&node_key(id), f).await
    }

    pub async fn get_node(&self, id: &NodeId) -> Result<Option<NodeRecord>> {
        Ok(self.read(&node_key(id)).await?.map(|(node, _)| node))
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.list(NODES).await
    }

    pub async fn remove_node(&self, id: &NodeId) -> Result<()> {
        self.update::<NodeRecord, _>(&node_key(id), |_| Ok(None))
            .await?;
        Ok(())
    }

    // --- Indexes ---

    /// Creates an index, or updates replication settings of an existing one.
    /// Changing the shard count of an existing index is a `FatalConfig` error.
    pub async fn create_index(&self, record: IndexRecord) -> Result<IndexRecord> {
        validate_index(&record)?;
        let stored = self
            .update::<IndexRecord, _>(&index_key(&record.name), |current| match current {
                Some(existing) if existing.shard_count != record.shard_count => {
                    Err(ClusterError::FatalConfig(format!(
                        "index '{}' has {} shards; shard count is immutable (requested {})",
                        existing.name, existing.shard_count, record.shard_count
                    )))
                }
                Some(existing) => Ok(Some(IndexRecord {
                    replication_factor: record.replication_factor,
                    write_quorum: record.write_quorum,
                    weight: record.weight,
                    ..existing
                })),
                None => Ok(Some(IndexRecord {
                    generation: 0,
                    shard_tokens: Default::default(),
                    ..record.clone()
                })),
            })
            .await?;
        stored.ok_or_else(|| ClusterError::Storage("index record vanished".to_string()))
    }

    pub async fn delete_index(&self, name: &str) -> Result<()> {
        for (key, _) in self.store_list(&format!("{}{}/", SHARDS, name)).await? {
            self.update::<ShardAssignment, _>(&key, |_| Ok(None)).await?;
        }
        self.update::<IndexRecord, _>(&index_key(name), |_| Ok(None))
            .await?;
        Ok(())
    }

    pub async fn get_index(&self, name: &str) -> Result<Option<IndexRecord>> {
        Ok(self.read(&index_key(name)).await?.map(|(index, _)| index))
    }

    pub async fn require_index(&self, name: &str) -> Result<IndexRecord> {
        self.get_index(name)
            .await?
            .ok_or_else(|| ClusterError::IndexNotFound(name.to_string()))
    }

    pub async fn list_indexes(&self) -> Result<Vec<IndexRecord>> {
        self.list(INDEXES).await
    }

    /// Bumps the index generation for a write committed at `token` on
    /// `shard`, orphaning cached results, and records the token as that
    /// shard's watermark.
    pub async fn publish_commit(&self, shard: &ShardId, token: CommitToken) -> Result<u64> {
        let updated = self
            .update::<IndexRecord, _>(&index_key(&shard.index), |current| match current {
                Some(mut index) => {
                    index.generation += 1;
                    let committed = index.shard_tokens.entry(shard.shard).or_default();
                    *committed = (*committed).max(token);
                    Ok(Some(index))
                }
                None => Err(ClusterError::IndexNotFound(shard.index.clone())),
            })
            .await?;
        updated
            .map(|index| index.generation)
            .ok_or_else(|| ClusterError::IndexNotFound(shard.index.clone()))
    }

    // --- Shard assignments ---

    pub async fn get_assignment(&self, shard: &ShardId) -> Result<Option<ShardAssignment>> {
        Ok(self.read(&shard_key(shard)).await?.map(|(a, _)| a))
    }

    pub async fn list_assignments(&self, index: &str) -> Result<Vec<ShardAssignment>> {
        self.list(&format!("{}{}/", SHARDS, index)).await
    }

    /// Replaces one shard's replica set in a single CAS. Requires a valid
    /// planner lock; progress fields reported by the primary since the plan
    /// was computed are carried over for replicas that survive.
    pub async fn publish_assignment(
        &self,
        lock: &LockHandle,
        planned: ShardAssignment,
    ) -> Result<ShardAssignment> {
        lock.ensure_valid()?;
        let published = self
            .update::<ShardAssignment, _>(&shard_key(&planned.shard), |current| {
                lock.ensure_valid()?;
                let mut next = planned.clone();
                if let Some(current) = current {
                    // A plan that changes the set may force a replica STALE;
                    // otherwise health stays whatever the primary last reported
                    let reshaped = planned.epoch > current.epoch;
                    next.epoch = current.epoch.max(planned.epoch);
                    for replica in next.replicas.iter_mut() {
                        if let Some(existing) = current.replica_for(&replica.node) {
                            replica.applied_token = replica.applied_token.max(existing.applied_token);
                            let forced_stale = reshaped && replica.health == ReplicaHealth::Stale;
                            if replica.role == ReplicaRole::Replica
                                && existing.role == ReplicaRole::Replica
                                && !forced_stale
                            {
                                replica.health = existing.health;
                            }
                        }
                    }
                }
                Ok(Some(next))
            })
            .await?;
        published.ok_or_else(|| ClusterError::Storage("assignment vanished".to_string()))
    }

    /// Records a replica's applied token and health. Written by the shard's
    /// primary; roles and membership are left untouched.
    pub async fn report_replica_progress(
        &self,
        shard: &ShardId,
        node: &NodeId,
        applied: CommitToken,
        health: ReplicaHealth,
    ) -> Result<()> {
        self.update::<ShardAssignment, _>(&shard_key(shard), |current| {
            let Some(mut assignment) = current else {
                return Ok(None);
            };
            if let Some(replica) = assignment.replicas.iter_mut().find(|r| &r.node == node) {
                replica.applied_token = replica.applied_token.max(applied);
                replica.health = if replica.is_primary() {
                    ReplicaHealth::Ok
                } else {
                    health
                };
            }
            Ok(Some(assignment))
        })
        .await?;
        Ok(())
    }

    // --- Topology ---

    pub async fn get_topology(&self) -> Result<Topology> {
        let nodes: Vec<NodeRecord> = self.list(NODES).await?;
        let indexes: Vec<IndexRecord> = self.list(INDEXES).await?;
        let assignments: Vec<ShardAssignment> = self.list(SHARDS).await?;

        Ok(Topology {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            indexes: indexes.into_iter().map(|i| (i.name.clone(), i)).collect(),
            assignments: assignments
                .into_iter()
                .map(|a| (a.shard.clone(), a))
                .collect(),
        })
    }

    pub fn subscribe(&self) -> DirectorySubscription {
        DirectorySubscription {
            rx: self.store.watch(),
        }
    }

    // --- Locks ---

    /// Takes `name` if it is free, expired, or already ours. `Ok(None)` when
    /// another owner holds an unexpired lock.
    pub async fn acquire_lock(
        &self,
        name: &str,
        owner: &NodeId,
        ttl: Duration,
    ) -> Result<Option<LockHandle>> {
        let key = lock_key(name);
        for attempt in 0..self.cas_attempts {
            let current = self.read::<LockRecord>(&key).await?;
            let now = now_ms();
            if let Some((lock, _)) = &current
                && &lock.owner != owner
                && lock.expiry > now
            {
                return Ok(None);
            }

            let expiry = now + ttl.as_millis() as u64;
            let record = LockRecord {
                name: name.to_string(),
                owner: owner.clone(),
                expiry,
            };
            let expected = current.map(|(_, version)| version);
            match self.cas(&key, expected, Some(&record)).await? {
                CasOutcome::Applied { version } => {
                    tracing::info!("Lock '{}' acquired by {}", name, owner);
                    return Ok(Some(LockHandle::new(name, owner, version, expiry)));
                }
                CasOutcome::Conflict { .. } => {
                    tracing::debug!("Lock '{}' CAS conflict (attempt {})", name, attempt);
                    self.retry.backoff(attempt).await;
                }
            }
        }
        Err(ClusterError::transient(format!(
            "lock '{}' contention exceeded retry budget",
            name
        )))
    }

    /// Extends the lock. Returns `false` (and invalidates the handle) when the
    /// lock was taken over or has expired; the holder must stop acting on it.
    pub async fn renew_lock(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        if !handle.is_valid() {
            handle.invalidate();
            return Ok(false);
        }

        let key = lock_key(handle.name());
        let current = match self.read::<LockRecord>(&key).await {
            Ok(current) => current,
            Err(e) => {
                if !handle.is_valid() {
                    handle.invalidate();
                }
                return Err(e);
            }
        };

        let expected_version = handle.inner.version.load(Ordering::SeqCst);
        match current {
            Some((lock, version)) if &lock.owner == handle.owner() && version == expected_version => {
                let expiry = now_ms() + ttl.as_millis() as u64;
                let record = LockRecord { expiry, ..lock };
                match self.cas(&key, Some(version), Some(&record)).await? {
                    CasOutcome::Applied { version } => {
                        handle.inner.version.store(version, Ordering::SeqCst);
                        handle.inner.expiry.store(expiry, Ordering::SeqCst);
                        Ok(true)
                    }
                    CasOutcome::Conflict { .. } => {
                        tracing::warn!("Lock '{}' lost during renewal", handle.name());
                        handle.invalidate();
                        Ok(false)
                    }
                }
            }
            _ => {
                tracing::warn!("Lock '{}' no longer owned by {}", handle.name(), handle.owner());
                handle.invalidate();
                Ok(false)
            }
        }
    }

    pub async fn release_lock(&self, handle: &LockHandle) -> Result<()> {
        handle.invalidate();
        let key = lock_key(handle.name());
        let version = handle.inner.version.load(Ordering::SeqCst);
        match self.cas::<LockRecord>(&key, Some(version), None).await? {
            CasOutcome::Applied { .. } => {
                tracing::info!("Lock '{}' released by {}", handle.name(), handle.owner());
            }
            CasOutcome::Conflict { .. } => {
                tracing::debug!("Lock '{}' already taken over; nothing to release", handle.name());
            }
        }
        Ok(())
    }

    pub async fn current_lock(&self, name: &str) -> Result<Option<LockRecord>> {
        Ok(self.read(&lock_key(name)).await?.map(|(lock, _)| lock))
    }

    // --- Record plumbing ---

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, u64)>> {
        let stored = self.retry.run("metadata read", || self.store.get(key)).await?;
        match stored {
            Some(versioned) => {
                let value = bincode::deserialize(&versioned.value)?;
                Ok(Some((value, versioned.version)))
            }
            None => Ok(None),
        }
    }

    async fn store_list(&self, prefix: &str) -> Result<Vec<(String, super::store::Versioned)>> {
        self.retry
            .run("metadata list", || self.store.list(prefix))
            .await
    }

    async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.store_list(prefix)
            .await?
            .into_iter()
            .map(|(_, versioned)| Ok(bincode::deserialize(&versioned.value)?))
            .collect()
    }

    async fn cas<T: Serialize>(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Option<&T>,
    ) -> Result<CasOutcome> {
        let encoded = value.map(bincode::serialize).transpose()?;
        self.retry
            .run("metadata cas", || {
                self.store.compare_and_swap(key, expected, encoded.clone())
            })
            .await
    }

    async fn update<T, F>(&self, key: &str, mut f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnMut(Option<T>) -> Result<Option<T>>,
    {
        for attempt in 0..self.cas_attempts {
            let current = self.read::<T>(key).await?;
            let expected = current.as_ref().map(|(_, version)| *version);
            let next = f(current.map(|(value, _)| value))?;

            if expected.is_none() && next.is_none() {
                return Ok(None);
            }

            match self.cas(key, expected, next.as_ref()).await? {
                CasOutcome::Applied { .. } => return Ok(next),
                CasOutcome::Conflict { .. } => {
                    tracing::debug!("CAS conflict on '{}' (attempt {})", key, attempt);
                    self.retry.backoff(attempt).await;
                }
            }
        }
        Err(ClusterError::transient(format!(
            "CAS contention on '{}' exceeded retry budget",
            key
        )))
    }
}

fn validate_index(record: &IndexRecord) -> Result<()> {
    if record.name.is_empty() || record.name.contains('/') {
        return Err(ClusterError::FatalConfig(format!(
            "invalid index name '{}'",
            record.name
        )));
    }
    if record.shard_count == 0 {
        return Err(ClusterError::FatalConfig("shard count must be at least 1".to_string()));
    }
    if record.replication_factor == 0 {
        return Err(ClusterError::FatalConfig(
            "replication factor must be at least 1".to_string(),
        ));
    }
    if record.write_quorum == 0 || record.write_quorum > record.replication_factor {
        return Err(ClusterError::FatalConfig(format!(
            "write quorum {} must be between 1 and the replication factor {}",
            record.write_quorum, record.replication_factor
        )));
    }
    Ok(())
}

fn node_key(id: &NodeId) -> String {
    format!("{}{}", NODES, id.0)
}

fn index_key(name: &str) -> String {
    format!("{}{}", INDEXES, name)
}

fn shard_key(shard: &ShardId) -> String {
    format!("{}{}/{:06}", SHARDS, shard.index, shard.shard)
}

fn lock_key(name: &str) -> String {
    format!("{}{}", LOCKS, name)
}

fn event_for_key(key: &str) -> Option<DirectoryEvent> {
    if let Some(id) = key.strip_prefix(NODES) {
        return Some(DirectoryEvent::NodeChanged(NodeId(id.to_string())));
    }
    if let Some(name) = key.strip_prefix(INDEXES) {
        return Some(DirectoryEvent::IndexChanged(name.to_string()));
    }
    if let Some(rest) = key.strip_prefix(SHARDS) {
        let (index, shard) = rest.rsplit_once('/')?;
        let shard = shard.parse().ok()?;
        return Some(DirectoryEvent::AssignmentChanged(ShardId::new(index, shard)));
    }
    if let Some(name) = key.strip_prefix(LOCKS) {
        return Some(DirectoryEvent::LockChanged(name.to_string()));
    }
    None
}
