use super::types::ReplicationEntry;
use crate::directory::types::CommitToken;
use std::collections::BTreeMap;

/// Out-of-order buffer of a replica.
///
/// Entries live in a slot arena; `by_token` maps each buffered token to its
/// slot. Freed slots are reused, so truncation never shifts other entries.
#[derive(Debug, Default)]
pub struct PendingLog {
    slots: Vec<Option<ReplicationEntry>>,
    free: Vec<usize>,
    by_token: BTreeMap<CommitToken, usize>,
}

impl PendingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `entry`. Returns `false` if its token is already buffered.
    pub fn insert(&mut self, entry: ReplicationEntry) -> bool {
        if self.by_token.contains_key(&entry.token) {
            return false;
        }
        let token = entry.token;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.by_token.insert(token, slot);
        true
    }

    pub fn take(&mut self, token: CommitToken) -> Option<ReplicationEntry> {
        let slot = self.by_token.remove(&token)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    /// Drops every entry at or below `token`.
    pub fn truncate_through(&mut self, token: CommitToken) {
        let keep = self.by_token.split_off(&token.next());
        for (_, slot) in std::mem::replace(&mut self.by_token, keep) {
            self.slots[slot] = None;
            self.free.push(slot);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_token.clear();
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn lowest(&self) -> Option<CommitToken> {
        self.by_token.keys().next().copied()
    }
}
