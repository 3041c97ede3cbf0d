use super::hashing::shard_for;
use super::merge::{ShardResponse, merge};
use super::types::*;
use super::view::{AssignmentView, IndexView};
use crate::cache::service::{CacheKey, QueryCache};
use crate::config::QueryConfig;
use crate::directory::service::ClusterDirectory;
use crate::directory::types::*;
use crate::error::{ClusterError, Result};
use crate::index::types::{LocalSearchResult, ShardQuery};
use crate::transport::NodeTransport;
use crate::transport::protocol::{ShardFetch, ShardSearch};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Fans a query out to one copy of every shard and merges the answers.
pub struct QueryRouter {
    directory: Arc<ClusterDirectory>,
    transport: Arc<dyn NodeTransport>,
    view: Arc<AssignmentView>,
    cache: Arc<QueryCache>,
    config: QueryConfig,
    round_robin: AtomicUsize,
}

enum ShardOutcome {
    Answered(LocalSearchResult),
    /// Every candidate copy failed or reported a stale assignment.
    Unreachable,
}

impl QueryRouter {
    pub fn new(
        directory: Arc<ClusterDirectory>,
        transport: Arc<dyn NodeTransport>,
        view: Arc<AssignmentView>,
        cache: Arc<QueryCache>,
        config: QueryConfig,
    ) -> Self {
        Self {
            directory,
            transport,
            view,
            cache,
            config,
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Answers from the cache when the index generation is unchanged,
    /// otherwise fans out.
    pub async fn query(&self, request: QueryRequest) -> Result<Arc<MergedResult>> {
        // Generation is read fresh so a write is never masked by a cached view
        let index = self.directory.require_index(&request.index).await?;
        let key = CacheKey {
            index: index.name.clone(),
            generation: index.generation,
            query: request.normalized(),
        };
        self.cache
            .get_or_compute(key, || self.execute(&request, &index))
            .await
    }

    /// `index` is the record the cache key was taken from; its per-shard
    /// watermarks decide whether the merged answer is current.
    async fn execute(&self, request: &QueryRequest, index: &IndexRecord) -> Result<MergedResult> {
        let view = self.view.get(&request.index).await?;
        let deadline = Instant::now() + self.config.deadline();
        let shard_query = request.shard_query();

        let mut missing: BTreeSet<u32> = BTreeSet::new();
        let mut tasks = JoinSet::new();
        for shard in 0..view.index.shard_count {
            let candidates = self.candidates(&view, shard, request.read_preference);
            if candidates.is_empty() {
                if !request.partial_allowed {
                    return Err(unavailable(&request.index, shard));
                }
                tracing::warn!(index = %request.index, shard, "No healthy replica; skipping shard");
                missing.insert(shard);
                continue;
            }
            tasks.spawn(search_shard(
                self.transport.clone(),
                ShardId::new(&request.index, shard),
                shard_query.clone(),
                candidates,
            ));
        }

        let mut responses: Vec<ShardResponse> = Vec::with_capacity(view.index.shard_count as usize);
        let mut saw_stale = false;
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((shard, outcome, stale)))) => {
                    saw_stale |= stale;
                    match outcome {
                        ShardOutcome::Answered(result) => responses.push(ShardResponse { shard, result }),
                        ShardOutcome::Unreachable => {
                            if !request.partial_allowed {
                                tasks.abort_all();
                                self.note_stale(saw_stale, &request.index);
                                return Err(unavailable(&request.index, shard));
                            }
                            missing.insert(shard);
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(index = %request.index, "Shard search task failed: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    tasks.abort_all();
                    break;
                }
            }
        }
        self.note_stale(saw_stale, &request.index);

        // Shards that never answered (deadline or a failed task)
        let answered: BTreeSet<u32> = responses.iter().map(|r| r.shard).collect();
        for shard in 0..view.index.shard_count {
            if !answered.contains(&shard) {
                missing.insert(shard);
            }
        }

        if !missing.is_empty() && !request.partial_allowed {
            if timed_out {
                return Err(ClusterError::transient(format!(
                    "query deadline of {:?} expired with shards {:?} outstanding",
                    self.config.deadline(),
                    missing
                )));
            }
            let first = missing.first().copied().unwrap_or_default();
            return Err(unavailable(&request.index, first));
        }
        if !missing.is_empty() {
            tracing::warn!(index = %request.index, ?missing, "Returning partial result");
        }

        responses.sort_by_key(|r| r.shard);
        let mut merged = merge(
            &request.sort,
            request.page,
            &request.facets,
            &responses,
            missing.into_iter().collect(),
        );
        let lagging: Vec<u32> = responses
            .iter()
            .filter(|r| r.result.applied < index.committed(r.shard))
            .map(|r| r.shard)
            .collect();
        if !lagging.is_empty() {
            tracing::debug!(index = %request.index, ?lagging, "Answered by copies behind generation {}", index.generation);
            merged.behind = true;
        }
        Ok(merged)
    }

    /// Reads one document from a copy of the shard that owns it. The shard is
    /// found with the same hash writes use; copies are tried in read
    /// preference order under the query deadline.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchedDocument> {
        if request.doc_id.is_empty() {
            return Err(ClusterError::InvalidRequest("document id is required".to_string()));
        }
        let view = self.view.get(&request.index).await?;
        let key = request.routing_key.as_deref().unwrap_or(&request.doc_id);
        let shard = shard_for(key, view.index.shard_count);
        let shard_id = ShardId::new(&request.index, shard);
        let deadline = Instant::now() + self.config.deadline();

        let mut saw_stale = false;
        for node in self.candidates(&view, shard, request.read_preference) {
            let fetch = ShardFetch {
                shard: shard_id.clone(),
                doc_id: request.doc_id.clone(),
            };
            match tokio::time::timeout_at(deadline, self.transport.fetch(&node, fetch)).await {
                Ok(Ok(document)) => {
                    self.note_stale(saw_stale, &request.index);
                    return Ok(FetchedDocument {
                        doc_id: request.doc_id,
                        shard,
                        document,
                    });
                }
                Ok(Err(e)) => {
                    saw_stale |= matches!(e, ClusterError::StaleAssignment { .. });
                    tracing::debug!(shard = %shard_id, node = %node, "Fetch failed: {}", e);
                }
                Err(_) => {
                    self.note_stale(saw_stale, &request.index);
                    return Err(ClusterError::transient(format!(
                        "fetch of '{}' from {} exceeded the deadline of {:?}",
                        request.doc_id,
                        shard_id,
                        self.config.deadline()
                    )));
                }
            }
        }
        self.note_stale(saw_stale, &request.index);
        Err(unavailable(&request.index, shard))
    }

    fn note_stale(&self, saw_stale: bool, index: &str) {
        if saw_stale {
            self.view.invalidate(index);
        }
    }

    /// Healthy, live copies of `shard` in the order they should be tried:
    /// the preferred set rotated round-robin, then every other healthy copy.
    fn candidates(&self, view: &IndexView, shard: u32, preference: ReadPreference) -> Vec<NodeId> {
        let Some(assignment) = view.assignment(shard) else {
            return Vec::new();
        };
        let healthy: Vec<&ReplicaAssignment> = assignment
            .replicas
            .iter()
            .filter(|r| r.health == ReplicaHealth::Ok && view.is_alive(&r.node))
            .collect();

        let (mut preferred, others): (Vec<&ReplicaAssignment>, Vec<&ReplicaAssignment>) =
            healthy.into_iter().partition(|r| match preference {
                ReadPreference::Any => true,
                ReadPreference::PrimaryOnly | ReadPreference::PrimaryPreferred => r.is_primary(),
                ReadPreference::ReplicaOnly => !r.is_primary(),
            });

        if !preferred.is_empty() && preference != ReadPreference::PrimaryPreferred {
            let turn = self.round_robin.fetch_add(1, Ordering::Relaxed) % preferred.len();
            preferred.rotate_left(turn);
        }
        preferred
            .into_iter()
            .chain(others)
            .map(|r| r.node.clone())
            .collect()
    }
}

/// Tries each candidate in turn. Returns whether any candidate reported a
/// stale assignment, so the caller can refresh its view.
async fn search_shard(
    transport: Arc<dyn NodeTransport>,
    shard: ShardId,
    query: ShardQuery,
    candidates: Vec<NodeId>,
) -> (u32, ShardOutcome, bool) {
    let mut stale = false;
    for node in candidates {
        let request = ShardSearch {
            shard: shard.clone(),
            query: query.clone(),
        };
        match transport.shard_search(&node, request).await {
            Ok(result) => return (shard.shard, ShardOutcome::Answered(result), stale),
            Err(e) => {
                stale |= matches!(e, ClusterError::StaleAssignment { .. });
                tracing::debug!(shard = %shard, node = %node, "Shard search failed: {}", e);
            }
        }
    }
    (shard.shard, ShardOutcome::Unreachable, stale)
}

fn unavailable(index: &str, shard: u32) -> ClusterError {
    ClusterError::ShardUnavailable {
        index: index.to_string(),
        shard,
    }
}
