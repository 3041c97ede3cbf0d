//! Metadata Store Seam
//!
//! The directory persists its records in an external store that offers only
//! point reads, prefix listing and atomic compare-and-swap. [`MemoryMetadataStore`]
//! is the in-process implementation; one node hosts it and the others reach it
//! through [`super::remote::HttpMetadataStore`].

use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;

/// A stored value plus the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CasOutcome {
    Applied { version: u64 },
    Conflict { current: Option<Versioned> },
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Lists every key starting with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Writes `value` (or deletes when `None`) only if the current version
    /// equals `expected` (`None` = key must be absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Option<Vec<u8>>,
    ) -> Result<CasOutcome>;

    /// Keys of successfully applied mutations, pushed as they happen.
    fn watch(&self) -> broadcast::Receiver<String>;
}

pub struct MemoryMetadataStore {
    records: DashMap<String, Versioned>,
    next_version: AtomicU64,
    reachable: AtomicBool,
    changes: broadcast::Sender<String>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            records: DashMap::new(),
            next_version: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            changes,
        }
    }

    /// Simulates a store outage: every call fails transiently until restored.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClusterError::transient("metadata store unreachable"))
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.check_reachable()?;
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        self.check_reachable()?;
        let mut entries: Vec<(String, Versioned)> = self
            .records
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Option<Vec<u8>>,
    ) -> Result<CasOutcome> {
        self.check_reachable()?;

        let outcome = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get().version) {
                    return Ok(CasOutcome::Conflict {
                        current: Some(occupied.get().clone()),
                    });
                }
                match value {
                    Some(value) => {
                        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
                        occupied.insert(Versioned { version, value });
                        CasOutcome::Applied { version }
                    }
                    None => {
                        let removed = occupied.remove();
                        CasOutcome::Applied {
                            version: removed.version,
                        }
                    }
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(CasOutcome::Conflict { current: None });
                }
                match value {
                    Some(value) => {
                        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
                        vacant.insert(Versioned { version, value });
                        CasOutcome::Applied { version }
                    }
                    None => CasOutcome::Applied { version: 0 },
                }
            }
        };

        let _ = self.changes.send(key.to_string());
        Ok(outcome)
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}
