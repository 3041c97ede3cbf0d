use super::log::PendingLog;
use super::types::{ReplicationEntry, SyncResponse};
use crate::directory::types::{CommitToken, ShardId};
use crate::error::Result;
use crate::index::engine::LocalIndex;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Follower copy of one shard. Applies the primary's operations strictly in
/// token order.
pub struct ReplicaShard {
    shard: ShardId,
    index: Arc<dyn LocalIndex>,
    state: Mutex<ReplicaState>,
    max_pending: usize,
    syncing: AtomicBool,
}

struct ReplicaState {
    applied: CommitToken,
    /// Term of the primary this copy follows. Changes only through a sync.
    term: u64,
    pending: PendingLog,
    /// Set once a sync from the primary established a common history.
    seeded: bool,
    /// An op of a newer term was dropped since the last `take_missed`.
    missed: bool,
}

impl ReplicaState {
    fn outcome(&self, needs_resync: bool) -> ApplyOutcome {
        ApplyOutcome {
            applied: self.applied,
            needs_resync,
            buffered: self.pending.len(),
        }
    }

    /// Switches to the sync source's term. Buffered operations of another
    /// term are discarded.
    fn adopt(&mut self, term: u64) {
        if term != self.term {
            self.pending.clear();
            self.term = term;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: CommitToken,
    /// The replica must pull from the primary before it can apply more: its
    /// buffer overflowed, or a new primary's history reached it.
    pub needs_resync: bool,
    /// Operations held behind a gap.
    pub buffered: usize,
}

impl ReplicaShard {
    pub fn new(
        shard: ShardId,
        index: Arc<dyn LocalIndex>,
        applied: CommitToken,
        term: u64,
        max_pending: usize,
    ) -> Self {
        Self {
            shard,
            index,
            state: Mutex::new(ReplicaState {
                applied,
                term,
                pending: PendingLog::new(),
                seeded: false,
                missed: false,
            }),
            max_pending: max_pending.max(1),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn applied(&self) -> CommitToken {
        self.state.lock().applied
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// False until the first successful sync. Until then the copy may be
    /// missing history and must not serve reads.
    pub fn is_seeded(&self) -> bool {
        self.state.lock().seeded
    }

    /// Buffers `entry` and applies every contiguous operation now available.
    ///
    /// Only operations issued under the replica's own term are applied. An
    /// older term comes from a deposed primary and is dropped. A newer term
    /// means a new primary whose history may differ from what this copy
    /// holds, so nothing is applied until a sync settles the common prefix.
    pub fn apply(&self, entry: ReplicationEntry) -> Result<ApplyOutcome> {
        let mut state = self.state.lock();
        if entry.term < state.term {
            tracing::debug!(shard = %self.shard, token = %entry.token, "Dropping op from term {}", entry.term);
            return Ok(state.outcome(false));
        }
        if entry.term > state.term {
            if !state.pending.is_empty() || state.seeded {
                tracing::warn!(
                    shard = %self.shard,
                    applied = %state.applied,
                    "Primary changed (term {} -> {}); requesting resync",
                    state.term,
                    entry.term
                );
            }
            state.pending.clear();
            state.missed = true;
            return Ok(state.outcome(true));
        }

        if entry.token > state.applied {
            state.pending.insert(entry);
        }
        self.drain(&mut state)?;

        let needs_resync = state.pending.len() > self.max_pending;
        if needs_resync {
            tracing::warn!(
                shard = %self.shard,
                applied = %state.applied,
                buffered = state.pending.len(),
                "Replica buffer overflow; requesting resync"
            );
        }
        Ok(state.outcome(needs_resync))
    }

    fn drain(&self, state: &mut ReplicaState) -> Result<()> {
        let mut advanced = false;
        while let Some(entry) = state.pending.take(state.applied.next()) {
            self.index.write(&entry.op)?;
            state.applied = entry.token;
            advanced = true;
        }
        if advanced {
            self.index.commit()?;
        }
        Ok(())
    }

    /// Applies a catch-up response from the primary and adopts its term.
    pub fn install(&self, response: SyncResponse) -> Result<ApplyOutcome> {
        let mut state = self.state.lock();
        match response {
            SyncResponse::Ops { term, entries } => {
                state.adopt(term);
                for entry in entries {
                    if entry.token > state.applied {
                        state.pending.insert(entry);
                    }
                }
            }
            SyncResponse::Snapshot {
                token,
                term,
                snapshot,
            } => {
                self.index.restore(snapshot)?;
                self.index.commit()?;
                tracing::info!(
                    shard = %self.shard,
                    "Installed snapshot at {} (was {})",
                    token,
                    state.applied
                );
                state.adopt(term);
                state.applied = token;
                state.pending.truncate_through(token);
            }
        }
        state.seeded = true;
        self.drain(&mut state)?;
        Ok(state.outcome(false))
    }

    /// Whether an op of a newer term was dropped since the last call.
    pub fn take_missed(&self) -> bool {
        std::mem::take(&mut self.state.lock().missed)
    }

    /// Drops buffered operations from a previous primary.
    pub fn truncate_pending(&self) {
        self.state.lock().pending.clear();
    }

    /// Claims the right to run a resync. `false` if one is already running.
    pub fn begin_sync(&self) -> bool {
        !self.syncing.swap(true, Ordering::SeqCst)
    }

    pub fn end_sync(&self) {
        self.syncing.store(false, Ordering::SeqCst);
    }

    pub fn index(&self) -> &Arc<dyn LocalIndex> {
        &self.index
    }
}
