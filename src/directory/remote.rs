//! Remote Metadata Store
//!
//! Nodes that do not host the metadata store reach it over HTTP. Change
//! notifications are recovered by polling: the watcher lists every record and
//! pushes the keys whose version moved or that disappeared.

use super::store::{CasOutcome, MetadataStore, Versioned};
use crate::error::{ClusterError, Result};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// --- API Endpoints ---

pub const ENDPOINT_META_GET: &str = "/internal/meta/get";
pub const ENDPOINT_META_LIST: &str = "/internal/meta/list";
pub const ENDPOINT_META_CAS: &str = "/internal/meta/cas";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaGet {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaList {
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaCas {
    pub key: String,
    pub expected: Option<u64>,
    pub value: Option<Vec<u8>>,
}

pub struct HttpMetadataStore {
    http_client: reqwest::Client,
    host: SocketAddr,
    timeout: Duration,
    changes: broadcast::Sender<String>,
}

impl HttpMetadataStore {
    pub fn new(host: SocketAddr, timeout: Duration) -> Arc<Self> {
        let (changes, _) = broadcast::channel(1024);
        Arc::new(Self {
            http_client: reqwest::Client::new(),
            host,
            timeout,
            changes,
        })
    }

    /// Starts the polling loop that feeds `watch()` subscribers.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut known: HashMap<String, u64> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match store.list("").await {
                    Ok(records) => {
                        let current: HashMap<String, u64> =
                            records.into_iter().map(|(key, v)| (key, v.version)).collect();
                        for (key, version) in &current {
                            if known.get(key) != Some(version) {
                                let _ = store.changes.send(key.clone());
                            }
                        }
                        for key in known.keys().filter(|key| !current.contains_key(*key)) {
                            let _ = store.changes.send(key.clone());
                        }
                        known = current;
                    }
                    Err(e) => tracing::debug!("Metadata poll failed: {}", e),
                }
            }
        })
    }

    async fn post<Req, Resp>(&self, endpoint: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{}{}", self.host, endpoint);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ClusterError::transient(format!("metadata store unreachable: {}", e)))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClusterError::transient(format!("metadata store response: {}", e)))?;
        if status.is_success() {
            return serde_json::from_slice(&bytes)
                .map_err(|e| ClusterError::Storage(format!("malformed metadata response: {}", e)));
        }
        Err(serde_json::from_slice::<ClusterError>(&bytes).unwrap_or_else(|_| {
            ClusterError::transient(format!("metadata store answered {}", status))
        }))
    }
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.post(ENDPOINT_META_GET, &MetaGet { key: key.to_string() })
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        self.post(
            ENDPOINT_META_LIST,
            &MetaList {
                prefix: prefix.to_string(),
            },
        )
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Option<Vec<u8>>,
    ) -> Result<CasOutcome> {
        let request = MetaCas {
            key: key.to_string(),
            expected,
            value,
        };
        let outcome: CasOutcome = self.post(ENDPOINT_META_CAS, &request).await?;
        if matches!(outcome, CasOutcome::Applied { .. }) {
            let _ = self.changes.send(key.to_string());
        }
        Ok(outcome)
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}
