use super::types::{ReplicaAck, ReplicationEntry, SyncRequest, SyncResponse};
use crate::directory::types::{CommitToken, NodeId, ShardId};
use crate::error::{ClusterError, Result};
use crate::index::engine::LocalIndex;
use crate::index::types::WriteOp;

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Write authority of one shard on this node.
///
/// The `log` mutex is the per-shard write lock: arrival order at it decides
/// token order, so the later of two writes to one document wins.
pub struct PrimaryShard {
    shard: ShardId,
    index: Arc<dyn LocalIndex>,
    term: u64,
    /// Last token inherited when this primary took over.
    promoted_at: CommitToken,
    /// Term under which `promoted_at` was applied. Zero for a new shard.
    inherited_term: u64,
    log: Mutex<RetainedLog>,
    acks: Mutex<HashMap<NodeId, CommitToken>>,
    ack_notify: Notify,
    stale_lag: u64,
}

struct RetainedLog {
    last: CommitToken,
    entries: VecDeque<ReplicationEntry>,
    capacity: usize,
}

impl RetainedLog {
    /// Token just before the oldest retained entry.
    fn base(&self) -> CommitToken {
        self.entries
            .front()
            .map(|e| CommitToken(e.token.0 - 1))
            .unwrap_or(self.last)
    }
}

impl PrimaryShard {
    /// `applied` is the last token already in `index`: zero for a new shard,
    /// the replica's applied token on promotion.
    pub fn new(
        shard: ShardId,
        index: Arc<dyn LocalIndex>,
        term: u64,
        applied: CommitToken,
        retained: usize,
        stale_lag: u64,
    ) -> Self {
        Self {
            shard,
            index,
            term,
            promoted_at: applied,
            inherited_term: 0,
            log: Mutex::new(RetainedLog {
                last: applied,
                entries: VecDeque::new(),
                capacity: retained.max(1),
            }),
            acks: Mutex::new(HashMap::new()),
            ack_notify: Notify::new(),
            stale_lag,
        }
    }

    /// Records the term of the history inherited on promotion.
    pub fn inheriting(mut self, term: u64) -> Self {
        self.inherited_term = term;
        self
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn last_token(&self) -> CommitToken {
        self.log.lock().last
    }

    /// Applies and commits `op` locally and assigns it the next token.
    pub fn commit(&self, op: WriteOp) -> Result<ReplicationEntry> {
        let mut log = self.log.lock();
        self.index.write(&op)?;
        self.index.commit()?;

        let token = log.last.next();
        let entry = ReplicationEntry {
            shard: self.shard.clone(),
            token,
            term: self.term,
            op,
        };
        log.last = token;
        log.entries.push_back(entry.clone());
        while log.entries.len() > log.capacity {
            log.entries.pop_front();
        }
        Ok(entry)
    }

    /// Records a replica's applied token. Fails with `ReplicationLag` when the
    /// replica trails the primary by more than the stale threshold, and with
    /// `StaleAssignment` when the replica still follows another primary's
    /// history, whose tokens say nothing about this one's.
    pub fn record_ack(&self, ack: &ReplicaAck) -> Result<()> {
        if ack.term != self.term {
            return Err(ClusterError::StaleAssignment {
                index: self.shard.index.clone(),
                shard: self.shard.shard,
            });
        }
        {
            let mut acks = self.acks.lock();
            let current = acks.entry(ack.node.clone()).or_insert(CommitToken::ZERO);
            *current = (*current).max(ack.applied);
        }
        self.ack_notify.notify_waiters();
        self.check_lag(&ack.node, ack.applied)
    }

    pub fn check_lag(&self, node: &NodeId, applied: CommitToken) -> Result<()> {
        let lag = applied.lag_behind(self.last_token());
        if lag > self.stale_lag {
            return Err(ClusterError::ReplicationLag {
                index: self.shard.index.clone(),
                shard: self.shard.shard,
                node: node.to_string(),
                lag,
            });
        }
        Ok(())
    }

    /// Replicas among `replicas` whose last ack trails by more than the threshold.
    pub fn lagging(&self, replicas: &[NodeId]) -> Vec<(NodeId, CommitToken)> {
        let acks = self.acks.lock();
        let last = self.last_token();
        replicas
            .iter()
            .filter_map(|node| {
                let applied = acks.get(node).copied().unwrap_or(self.promoted_at);
                (applied.lag_behind(last) > self.stale_lag).then(|| (node.clone(), applied))
            })
            .collect()
    }

    fn acked_count(&self, token: CommitToken, replicas: &[NodeId]) -> usize {
        let acks = self.acks.lock();
        1 + replicas
            .iter()
            .filter(|node| acks.get(*node).is_some_and(|applied| *applied >= token))
            .count()
    }

    /// Waits until the primary plus `quorum - 1` of `replicas` hold `token`.
    /// Returns the number of copies holding it.
    pub async fn wait_for_quorum(
        &self,
        token: CommitToken,
        quorum: usize,
        replicas: &[NodeId],
        deadline: Instant,
    ) -> Result<usize> {
        loop {
            let notified = self.ack_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let acked = self.acked_count(token, replicas);
            if acked >= quorum {
                return Ok(acked);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let acked = self.acked_count(token, replicas);
                if acked >= quorum {
                    return Ok(acked);
                }
                return Err(ClusterError::QuorumNotReached {
                    acked,
                    required: quorum,
                });
            }
        }
    }

    /// Operations a replica needs to catch up from `request.from`, or a full
    /// snapshot when replay is impossible or the replica may have diverged.
    pub fn sync_response(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let log = self.log.lock();

        // Tokens of another term match ours only up to where we took over,
        // and only when they were applied under the term we inherited
        let foreign_history = request.term != self.term
            && (request.term != self.inherited_term || request.from > self.promoted_at);
        let replayable = !request.full
            && !foreign_history
            && request.from <= log.last
            && request.from >= log.base();

        if replayable {
            let entries = log
                .entries
                .iter()
                .filter(|e| e.token > request.from)
                .cloned()
                .collect();
            return Ok(SyncResponse::Ops {
                term: self.term,
                entries,
            });
        }

        // Taken under the log lock so the snapshot matches `last` exactly
        let snapshot = self.index.snapshot()?;
        Ok(SyncResponse::Snapshot {
            token: log.last,
            term: self.term,
            snapshot,
        })
    }

    pub fn index(&self) -> &Arc<dyn LocalIndex> {
        &self.index
    }
}
