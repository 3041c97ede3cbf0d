//! Integration tests for router failure handling: the shared query deadline
//! and the stale-assignment refresh on writes.
//!
//! The routers run over a wrapper transport that can stall a node's shard
//! searches or answer forwarded writes with a stale assignment.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::TestCluster;
use dashmap::DashSet;
use serde_json::{Value, json};
use sharded_search::cache::service::QueryCache;
use sharded_search::config::QueryConfig;
use sharded_search::directory::types::{CommitToken, IndexRecord, NodeId};
use sharded_search::error::{ClusterError, Result as ClusterResult};
use sharded_search::index::types::{LocalSearchResult, QuerySpec};
use sharded_search::replication::types::{ReplicaAck, ReplicationEntry, SyncRequest, SyncResponse, WriteResult};
use sharded_search::router::query::QueryRouter;
use sharded_search::router::types::{QueryRequest, WriteRequest};
use sharded_search::router::view::AssignmentView;
use sharded_search::router::write::WriteRouter;
use sharded_search::transport::NodeTransport;
use sharded_search::transport::local::LocalTransport;
use sharded_search::transport::protocol::{ShardFetch, ShardSearch, ShardWrite};
use tokio::time::Instant;

/// Delegates to the in-process transport unless told to misbehave.
struct FaultyTransport {
    inner: Arc<LocalTransport>,
    stalled: DashSet<NodeId>,
    stale_writes: AtomicUsize,
    forwarded: AtomicUsize,
}

impl FaultyTransport {
    fn new(inner: Arc<LocalTransport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            stalled: DashSet::new(),
            stale_writes: AtomicUsize::new(0),
            forwarded: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NodeTransport for FaultyTransport {
    async fn forward_write(&self, node: &NodeId, request: ShardWrite) -> ClusterResult<WriteResult> {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        let stale = self
            .stale_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if stale {
            return Err(ClusterError::StaleAssignment {
                index: request.shard.index.clone(),
                shard: request.shard.shard,
            });
        }
        self.inner.forward_write(node, request).await
    }

    async fn replicate(&self, node: &NodeId, entry: ReplicationEntry) -> ClusterResult<ReplicaAck> {
        self.inner.replicate(node, entry).await
    }

    async fn acknowledge(&self, node: &NodeId, ack: ReplicaAck) -> ClusterResult<()> {
        self.inner.acknowledge(node, ack).await
    }

    async fn shard_search(&self, node: &NodeId, request: ShardSearch) -> ClusterResult<LocalSearchResult> {
        if self.stalled.contains(node) {
            std::future::pending::<()>().await;
        }
        self.inner.shard_search(node, request).await
    }

    async fn shard_sync(&self, node: &NodeId, request: SyncRequest) -> ClusterResult<SyncResponse> {
        self.inner.shard_sync(node, request).await
    }

    async fn fetch(&self, node: &NodeId, request: ShardFetch) -> ClusterResult<Option<Value>> {
        self.inner.fetch(node, request).await
    }
}

fn query_router(cluster: &TestCluster, transport: Arc<FaultyTransport>, deadline_ms: u64) -> QueryRouter {
    let config = QueryConfig {
        deadline_ms,
        ..QueryConfig::default()
    };
    QueryRouter::new(
        cluster.directory.clone(),
        transport,
        AssignmentView::new(cluster.directory.clone(), config.assignment_ttl()),
        Arc::new(QueryCache::new(16)),
        config,
    )
}

fn write_request(doc_id: &str) -> WriteRequest {
    WriteRequest {
        index: "books".to_string(),
        doc_id: doc_id.to_string(),
        routing_key: None,
        payload: json!({ "title": "routing notes" }),
    }
}

#[tokio::test]
async fn test_query_deadline_fails_strict_and_trims_partial() -> Result<()> {
    // ARRANGE: shard 1's only copy stops answering searches
    let cluster = TestCluster::start(2).await?;
    cluster.create_index(IndexRecord::new("books", 2, 1)).await?;
    cluster.settle().await?;
    for i in 0..6 {
        cluster.write("books", &format!("doc-{}", i), "routing notes").await?;
    }
    let slow = cluster.primary_of("books", 1).await?;
    let other_is_fast = cluster.primary_of("books", 0).await? != slow;
    let transport = FaultyTransport::new(cluster.transport.clone());
    transport.stalled.insert(slow.clone());
    let router = query_router(&cluster, transport, 150);

    // ACT
    let started = Instant::now();
    let strict = router.query(QueryRequest::new("books", QuerySpec::MatchAll)).await;
    let waited = started.elapsed();
    let mut request = QueryRequest::new("books", QuerySpec::MatchAll);
    request.partial_allowed = true;
    let partial = router.query(request).await?;

    // ASSERT
    let Err(error) = strict else {
        panic!("strict query must fail once the deadline passes");
    };
    assert!(matches!(error, ClusterError::Transient(_)), "{:?}", error);
    assert!(waited >= Duration::from_millis(150));
    assert!(waited < Duration::from_secs(2), "stalled shard held the query for {:?}", waited);

    assert!(partial.partial);
    assert!(partial.missing_shards.contains(&1));
    assert!(partial.hits.iter().all(|hit| hit.shard != 1));
    if other_is_fast {
        assert_eq!(partial.missing_shards, vec![1]);
    }
    assert_eq!(router.cache().stats().entries, 0);
    Ok(())
}

#[tokio::test]
async fn test_stale_assignment_refreshes_and_retries_once() -> Result<()> {
    // ARRANGE
    let cluster = TestCluster::start(2).await?;
    cluster.create_index(IndexRecord::new("books", 2, 2)).await?;
    cluster.settle().await?;
    let transport = FaultyTransport::new(cluster.transport.clone());
    let view = AssignmentView::new(cluster.directory.clone(), Duration::from_secs(60));
    let router = WriteRouter::new(transport.clone(), view);

    // ACT: the first forward answers stale, the retry goes through
    transport.stale_writes.store(1, Ordering::SeqCst);
    let written = router.write_document(write_request("doc-1")).await?;

    // ASSERT
    assert_eq!(transport.forwarded.load(Ordering::SeqCst), 2);
    assert_eq!(written.token, CommitToken(1));

    // ACT: stale twice in a row is returned to the caller
    transport.forwarded.store(0, Ordering::SeqCst);
    transport.stale_writes.store(2, Ordering::SeqCst);
    let result = router.write_document(write_request("doc-2")).await;

    // ASSERT
    assert!(matches!(result, Err(ClusterError::StaleAssignment { .. })), "{:?}", result);
    assert_eq!(transport.forwarded.load(Ordering::SeqCst), 2);
    Ok(())
}
