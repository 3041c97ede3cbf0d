//! Integration tests for single-document reads by id.

mod common;

use anyhow::Result;
use common::TestCluster;
use serde_json::json;
use sharded_search::directory::types::IndexRecord;
use sharded_search::error::ClusterError;
use sharded_search::router::hashing::shard_for;
use sharded_search::router::types::{FetchRequest, ReadPreference, WriteRequest};

#[tokio::test]
async fn test_fetch_follows_routing_key() -> Result<()> {
    // ARRANGE
    let cluster = TestCluster::start(3).await?;
    cluster
        .create_index(IndexRecord::new("books", 4, 2).with_quorum(2))
        .await?;
    cluster.settle().await?;
    cluster
        .entry()
        .writes()
        .write_document(WriteRequest {
            index: "books".to_string(),
            doc_id: "D1".to_string(),
            routing_key: Some("r1".to_string()),
            payload: json!({ "title": "Rust search" }),
        })
        .await?;

    // ACT
    let mut routed = FetchRequest::new("books", "D1");
    routed.routing_key = Some("r1".to_string());
    let found = cluster.entry().queries().fetch(routed).await?;
    let by_id = cluster.entry().queries().fetch(FetchRequest::new("books", "D1")).await?;

    // ASSERT
    assert_eq!(found.shard, shard_for("r1", 4));
    assert_eq!(found.document, Some(json!({ "title": "Rust search" })));
    assert_eq!(by_id.shard, shard_for("D1", 4));
    if by_id.shard != found.shard {
        assert_eq!(by_id.document, None, "the id's own shard never saw the document");
    }
    Ok(())
}

#[tokio::test]
async fn test_fetch_reads_replica_when_preferred() -> Result<()> {
    let cluster = TestCluster::start(2).await?;
    cluster
        .create_index(IndexRecord::new("logs", 1, 2).with_quorum(2))
        .await?;
    cluster.settle().await?;
    cluster.write("logs", "event-1", "shipped").await?;
    let primary = cluster.primary_of("logs", 0).await?;

    // With the primary cut off only the replica can answer
    cluster.transport.set_down(&primary, true);
    let mut request = FetchRequest::new("logs", "event-1");
    request.read_preference = ReadPreference::ReplicaOnly;
    let fetched = cluster.entry_except(&primary).queries().fetch(request).await?;

    assert_eq!(fetched.document, Some(json!({ "title": "shipped" })));
    Ok(())
}

#[tokio::test]
async fn test_fetch_without_live_copy_is_unavailable() -> Result<()> {
    let cluster = TestCluster::start(2).await?;
    cluster.create_index(IndexRecord::new("logs", 1, 1)).await?;
    cluster.settle().await?;
    cluster.write("logs", "event-1", "shipped").await?;
    let primary = cluster.primary_of("logs", 0).await?;

    cluster.transport.set_down(&primary, true);
    let result = cluster
        .entry_except(&primary)
        .queries()
        .fetch(FetchRequest::new("logs", "event-1"))
        .await;

    let Err(error) = result else {
        panic!("fetch must fail while the only copy is down");
    };
    assert_eq!(
        error,
        ClusterError::ShardUnavailable {
            index: "logs".to_string(),
            shard: 0
        }
    );
    Ok(())
}
