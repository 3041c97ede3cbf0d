//! Integration tests for primary failover and replica resync.
//!
//! Node loss is simulated by cutting a node off the transport and marking it
//! dead in the directory; the planner and reconcile passes then run by hand.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{TestCluster, test_config, wait_until};
use sharded_search::directory::types::{CommitToken, IndexRecord, ReplicaHealth, ReplicaRole, ShardId};
use sharded_search::error::ClusterError;
use sharded_search::index::types::{QuerySpec, ShardQuery, SortSpec, WriteOp};
use sharded_search::replication::manager::LocalRole;
use sharded_search::replication::types::ReplicationEntry;
use sharded_search::router::types::{QueryRequest, ReadPreference, WriteRequest};

fn match_all() -> ShardQuery {
    ShardQuery {
        query: QuerySpec::MatchAll,
        sort: SortSpec::by_score(),
        window: 100,
        facets: Vec::new(),
        include_documents: false,
    }
}

#[tokio::test]
async fn test_replica_promoted_after_primary_loss() -> Result<()> {
    // ARRANGE
    let mut cluster = TestCluster::start(3).await?;
    cluster
        .create_index(IndexRecord::new("logs", 1, 2).with_quorum(2))
        .await?;
    cluster.settle().await?;
    let old_primary = cluster.primary_of("logs", 0).await?;
    let before = cluster.assignment("logs", 0).await?;

    let mut tokens = Vec::new();
    for i in 0..3 {
        tokens.push(cluster.write("logs", &format!("event-{}", i), "shipped").await?.token);
    }
    let survivor = before
        .replicas
        .iter()
        .find(|r| !r.is_primary())
        .map(|r| r.node.clone())
        .expect("replica placed");

    // ACT
    cluster.kill(&old_primary).await?;
    let during = cluster.entry_except(&old_primary).clone();
    let orphaned = during.writes().write_document(write_request("event-lost")).await;
    cluster.settle().await?;
    tokens.push(cluster.write("logs", "event-3", "shipped").await?.token);

    // ASSERT
    let Err(error) = orphaned else {
        panic!("write to a lost primary must fail before promotion");
    };
    assert!(error.is_retryable(), "{:?}", error);

    let after = cluster.assignment("logs", 0).await?;
    assert!(after.epoch > before.epoch);
    assert_eq!(after.primary().map(|p| &p.node), Some(&survivor));
    assert!(!after.hosts(&old_primary));
    assert_eq!(after.replicas.len(), 2);

    // No token reused across the promotion
    assert_eq!(tokens, vec![CommitToken(1), CommitToken(2), CommitToken(3), CommitToken(4)]);

    let result = cluster
        .entry()
        .queries()
        .query(QueryRequest::new("logs", QuerySpec::MatchAll))
        .await?;
    assert_eq!(result.total, 4);
    Ok(())
}

#[tokio::test]
async fn test_new_replica_seeded_by_snapshot() -> Result<()> {
    let mut cluster = TestCluster::start(3).await?;
    cluster
        .create_index(IndexRecord::new("logs", 1, 2).with_quorum(2))
        .await?;
    cluster.settle().await?;
    for i in 0..4 {
        cluster.write("logs", &format!("event-{}", i), "shipped").await?;
    }
    let assignment = cluster.assignment("logs", 0).await?;
    let replica = assignment
        .replicas
        .iter()
        .find(|r| !r.is_primary())
        .map(|r| r.node.clone())
        .expect("replica placed");

    cluster.kill(&replica).await?;
    cluster.settle().await?;

    let after = cluster.assignment("logs", 0).await?;
    let fresh = after
        .replicas
        .iter()
        .find(|r| r.role == ReplicaRole::Replica)
        .expect("replacement placed");
    assert_ne!(fresh.node, replica);
    assert_eq!(fresh.health, ReplicaHealth::Ok);
    assert_eq!(fresh.applied_token, CommitToken(4));

    let local = cluster
        .node(&fresh.node)
        .manager()
        .search_local(&after.shard, &match_all())?;
    assert_eq!(local.total, 4);
    Ok(())
}

#[tokio::test]
async fn test_lagging_replica_resyncs_before_serving() -> Result<()> {
    // ARRANGE
    let mut config = test_config();
    config.replication.stale_lag_threshold = 1;
    let cluster = TestCluster::start_with(2, config).await?;
    cluster
        .create_index(IndexRecord::new("logs", 1, 2).with_quorum(1))
        .await?;
    cluster.settle().await?;
    let primary = cluster.primary_of("logs", 0).await?;
    let replica = cluster.entry_except(&primary).id().clone();

    // ACT: the replica misses three operations
    cluster.transport.set_down(&replica, true);
    for i in 0..3 {
        cluster.write("logs", &format!("event-{}", i), "missed").await?;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    let lagging = cluster.assignment("logs", 0).await?;

    // ASSERT: excluded from reads while behind
    let stale = lagging.replica_for(&replica).expect("replica kept");
    assert_eq!(stale.health, ReplicaHealth::Stale);
    assert_eq!(stale.applied_token, CommitToken::ZERO);

    let mut request = QueryRequest::new("logs", QuerySpec::MatchAll);
    request.read_preference = ReadPreference::ReplicaOnly;
    let served = cluster.node(&primary).queries().query(request).await?;
    assert_eq!(served.total, 3);

    // ACT: back online, the next reconcile replays the gap
    cluster.transport.set_down(&replica, false);
    cluster.settle().await?;

    // ASSERT
    let healed = cluster.assignment("logs", 0).await?;
    let caught_up = healed.replica_for(&replica).expect("replica kept");
    assert_eq!(caught_up.health, ReplicaHealth::Ok);
    assert_eq!(caught_up.applied_token, CommitToken(3));
    let local = cluster
        .node(&replica)
        .manager()
        .search_local(&healed.shard, &match_all())?;
    assert_eq!(local.total, 3);
    Ok(())
}

#[tokio::test]
async fn test_replica_holding_gap_is_published_stale() -> Result<()> {
    // ARRANGE
    let cluster = TestCluster::start(2).await?;
    cluster
        .create_index(IndexRecord::new("logs", 1, 2).with_quorum(2))
        .await?;
    cluster.settle().await?;
    cluster.write("logs", "event-1", "shipped").await?;
    let shard = ShardId::new("logs", 0);
    let primary = cluster.primary_of("logs", 0).await?;
    let replica = cluster.entry_except(&primary).id().clone();

    let directory = cluster.directory.clone();
    let reported = wait_until(Duration::from_secs(2), || {
        let (directory, shard, replica) = (directory.clone(), shard.clone(), replica.clone());
        async move {
            matches!(
                directory.get_assignment(&shard).await,
                Ok(Some(a)) if a.replica_for(&replica).is_some_and(|r| r.health == ReplicaHealth::Ok && r.applied_token == CommitToken(1))
            )
        }
    })
    .await;
    assert!(reported, "replica never reported token 1");

    let leader = cluster.node(&primary).manager().hosted(&shard)?.role();
    let LocalRole::Primary(leader) = leader else {
        panic!("{} should lead {}", primary, shard);
    };

    // ACT: token 3 arrives while 2 is still in flight
    let ack = cluster
        .node(&replica)
        .manager()
        .apply_replicated(ReplicationEntry {
            shard: shard.clone(),
            token: CommitToken(3),
            term: leader.term(),
            op: WriteOp::Delete {
                doc_id: "event-9".to_string(),
            },
        })
        .await?;
    cluster.node(&primary).manager().acknowledge(ack.clone()).await?;

    // ASSERT
    assert_eq!(ack.applied, CommitToken(1));
    assert!(ack.needs_resync);
    let published = cluster.assignment("logs", 0).await?;
    let held = published.replica_for(&replica).expect("replica kept");
    assert_eq!(held.health, ReplicaHealth::Stale);
    Ok(())
}

#[tokio::test]
async fn test_shard_without_live_copy_is_unavailable() -> Result<()> {
    let mut cluster = TestCluster::start(2).await?;
    cluster.create_index(IndexRecord::new("logs", 1, 1)).await?;
    cluster.settle().await?;
    let primary = cluster.primary_of("logs", 0).await?;
    let other = cluster.entry_except(&primary).clone();

    cluster.kill(&primary).await?;
    other.view().invalidate_all();
    let result = other
        .queries()
        .query(QueryRequest::new("logs", QuerySpec::MatchAll))
        .await;

    let Err(error) = result else {
        panic!("query must fail while the only copy is down");
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

fn write_request(doc_id: &str) -> WriteRequest {
    WriteRequest {
        index: "logs".to_string(),
        doc_id: doc_id.to_string(),
        routing_key: None,
        payload: serde_json::json!({ "title": "lost" }),
    }
}
