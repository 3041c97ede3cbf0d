//! Replication Module Tests
//!
//! ## Test Scopes
//! - **Pending Log**: Arena slot reuse and truncation.
//! - **Primary**: Token assignment, quorum waits, lag detection, catch-up responses.
//! - **Replica**: In-order application, buffering, overflow, snapshot install, term changes.

#[cfg(test)]
mod tests {
    use crate::directory::types::{CommitToken, NodeId, ShardId};
    use crate::error::ClusterError;
    use crate::index::engine::{LocalIndex, MemoryIndex};
    use crate::index::types::{QuerySpec, ShardQuery, SortSpec, WriteOp};
    use crate::replication::log::PendingLog;
    use crate::replication::primary::PrimaryShard;
    use crate::replication::replica::ReplicaShard;
    use crate::replication::types::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn shard() -> ShardId {
        ShardId::new("books", 0)
    }

    fn put(id: &str) -> WriteOp {
        WriteOp::Index {
            doc_id: id.to_string(),
            payload: json!({"title": id}),
        }
    }

    fn entry(token: u64, id: &str) -> ReplicationEntry {
        ReplicationEntry {
            shard: shard(),
            token: CommitToken(token),
            term: 1,
            op: put(id),
        }
    }

    fn entry_in(term: u64, token: u64, id: &str) -> ReplicationEntry {
        ReplicationEntry {
            term,
            ..entry(token, id)
        }
    }

    fn ack(node: &str, applied: u64, term: u64) -> ReplicaAck {
        ReplicaAck {
            shard: shard(),
            node: NodeId::from(node),
            applied: CommitToken(applied),
            term,
            needs_resync: false,
        }
    }

    fn doc_ids(index: &dyn LocalIndex) -> Vec<String> {
        index
            .search(&match_all())
            .unwrap()
            .hits
            .into_iter()
            .map(|h| h.doc_id)
            .collect()
    }

    fn primary(retained: usize) -> PrimaryShard {
        PrimaryShard::new(shard(), Arc::new(MemoryIndex::new()), 1, CommitToken::ZERO, retained, 5)
    }

    fn replica(max_pending: usize) -> (Arc<MemoryIndex>, ReplicaShard) {
        let index = Arc::new(MemoryIndex::new());
        let replica = ReplicaShard::new(shard(), index.clone(), CommitToken::ZERO, 1, max_pending);
        (index, replica)
    }

    fn match_all() -> ShardQuery {
        ShardQuery {
            query: QuerySpec::MatchAll,
            sort: SortSpec::default(),
            window: 100,
            facets: Vec::new(),
            include_documents: false,
        }
    }

    // ============================================================
    // PENDING LOG TESTS
    // ============================================================

    #[test]
    fn test_pending_log_take_and_reuse() {
        let mut log = PendingLog::new();

        assert!(log.insert(entry(3, "c")));
        assert!(log.insert(entry(5, "e")));
        assert!(!log.insert(entry(3, "dup")), "duplicate token rejected");
        assert_eq!(log.len(), 2);
        assert_eq!(log.lowest(), Some(CommitToken(3)));

        let taken = log.take(CommitToken(3)).unwrap();
        assert_eq!(taken.op.doc_id(), "c");
        assert!(log.take(CommitToken(3)).is_none());

        // Freed slot is reused
        assert!(log.insert(entry(4, "d")));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_pending_log_truncate_through() {
        let mut log = PendingLog::new();
        for token in [2, 4, 6, 8] {
            log.insert(entry(token, "x"));
        }

        log.truncate_through(CommitToken(5));

        assert_eq!(log.len(), 2);
        assert_eq!(log.lowest(), Some(CommitToken(6)));
        assert!(log.take(CommitToken(4)).is_none());
        assert!(log.take(CommitToken(8)).is_some());
    }

    // ============================================================
    // PRIMARY TESTS
    // ============================================================

    #[test]
    fn test_primary_assigns_increasing_tokens() {
        let primary = primary(10);

        let first = primary.commit(put("a")).unwrap();
        let second = primary.commit(put("b")).unwrap();

        assert_eq!(first.token, CommitToken(1));
        assert_eq!(second.token, CommitToken(2));
        assert_eq!(primary.last_token(), CommitToken(2));
        assert_eq!(primary.index().doc_count(), 2, "commit is local before shipping");
    }

    #[test]
    fn test_promoted_primary_continues_sequence() {
        let promoted = PrimaryShard::new(shard(), Arc::new(MemoryIndex::new()), 4, CommitToken(7), 10, 5);

        let entry = promoted.commit(put("a")).unwrap();

        assert_eq!(entry.token, CommitToken(8));
        assert_eq!(entry.term, 4);
    }

    #[tokio::test]
    async fn test_quorum_of_one_is_immediate() {
        let primary = primary(10);
        let entry = primary.commit(put("a")).unwrap();

        let acked = primary
            .wait_for_quorum(entry.token, 1, &[NodeId::from("r1")], Instant::now() + Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(acked, 1);
    }

    #[tokio::test]
    async fn test_quorum_waits_for_replica_ack() {
        // ARRANGE
        let primary = Arc::new(primary(10));
        let entry = primary.commit(put("a")).unwrap();
        let replicas = vec![NodeId::from("r1"), NodeId::from("r2")];

        // ACT: ack arrives while the writer waits
        let acker = primary.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            acker.record_ack(&ack("r2", 1, 1)).unwrap();
        });
        let acked = primary
            .wait_for_quorum(entry.token, 2, &replicas, Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();

        // ASSERT
        assert_eq!(acked, 2);
    }

    #[tokio::test]
    async fn test_quorum_timeout_reports_progress() {
        let primary = primary(10);
        let entry = primary.commit(put("a")).unwrap();

        let result = primary
            .wait_for_quorum(entry.token, 3, &[NodeId::from("r1"), NodeId::from("r2")], Instant::now() + Duration::from_millis(30))
            .await;

        assert_eq!(result, Err(ClusterError::QuorumNotReached { acked: 1, required: 3 }));
    }

    #[test]
    fn test_lagging_replica_signals_replication_lag() {
        // ARRANGE: stale threshold is 5
        let primary = primary(100);
        for i in 0..8 {
            primary.commit(put(&format!("d{}", i))).unwrap();
        }

        // ACT
        let behind = primary.record_ack(&ack("r1", 1, 1));
        let close = primary.record_ack(&ack("r2", 6, 1));

        // ASSERT
        assert!(matches!(behind, Err(ClusterError::ReplicationLag { lag: 7, .. })));
        assert!(close.is_ok());
        let lagging = primary.lagging(&[NodeId::from("r1"), NodeId::from("r2"), NodeId::from("r3")]);
        let nodes: Vec<NodeId> = lagging.into_iter().map(|(n, _)| n).collect();
        assert_eq!(nodes, vec![NodeId::from("r1"), NodeId::from("r3")]);
    }

    #[test]
    fn test_sync_replays_retained_ops() {
        let primary = primary(10);
        for id in ["a", "b", "c"] {
            primary.commit(put(id)).unwrap();
        }

        let response = primary
            .sync_response(&SyncRequest {
                shard: shard(),
                from: CommitToken(1),
                term: 1,
                full: false,
            })
            .unwrap();

        let SyncResponse::Ops { entries, .. } = response else {
            panic!("expected replay");
        };
        let tokens: Vec<u64> = entries.iter().map(|e| e.token.0).collect();
        assert_eq!(tokens, vec![2, 3]);
    }

    #[test]
    fn test_sync_falls_back_to_snapshot_beyond_retention() {
        // ARRANGE: only two ops retained
        let primary = primary(2);
        for id in ["a", "b", "c", "d"] {
            primary.commit(put(id)).unwrap();
        }

        // ACT
        let response = primary
            .sync_response(&SyncRequest {
                shard: shard(),
                from: CommitToken(1),
                term: 1,
                full: false,
            })
            .unwrap();

        // ASSERT
        let SyncResponse::Snapshot { token, snapshot, .. } = response else {
            panic!("expected snapshot");
        };
        assert_eq!(token, CommitToken(4));
        assert_eq!(snapshot.documents.len(), 4);
    }

    #[test]
    fn test_sync_snapshots_divergent_history() {
        // Promoted at 5 in term 3; the replica applied 6 under the old term
        let promoted = PrimaryShard::new(shard(), Arc::new(MemoryIndex::new()), 3, CommitToken(5), 10, 5).inheriting(1);
        promoted.commit(put("new")).unwrap();

        let response = promoted
            .sync_response(&SyncRequest {
                shard: shard(),
                from: CommitToken(6),
                term: 1,
                full: false,
            })
            .unwrap();

        assert!(matches!(response, SyncResponse::Snapshot { token: CommitToken(6), term: 3, .. }));
    }

    // ============================================================
    // REPLICA TESTS
    // ============================================================

    #[test]
    fn test_replica_applies_in_token_order() {
        // ARRANGE
        let (index, replica) = replica(10);

        // ACT: 2 and 3 arrive before 1
        let after_3 = replica.apply(entry(3, "c")).unwrap();
        let after_2 = replica.apply(entry(2, "b")).unwrap();

        // ASSERT: nothing applied yet
        assert_eq!(after_3.applied, CommitToken::ZERO);
        assert_eq!(after_2.applied, CommitToken::ZERO);
        assert_eq!(index.doc_count(), 0);
        assert_eq!(replica.pending_len(), 2);

        // ACT
        let after_1 = replica.apply(entry(1, "a")).unwrap();

        // ASSERT
        assert_eq!(after_1.applied, CommitToken(3));
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(index.search(&match_all()).unwrap().total, 3);
    }

    #[test]
    fn test_replica_ignores_duplicates() {
        let (index, replica) = replica(10);
        replica.apply(entry(1, "a")).unwrap();

        let again = replica.apply(entry(1, "changed")).unwrap();

        assert_eq!(again.applied, CommitToken(1));
        assert_eq!(index.doc_count(), 1);
        assert_eq!(replica.pending_len(), 0);
    }

    #[test]
    fn test_replica_buffer_overflow_requests_resync() {
        let (_, replica) = replica(2);

        replica.apply(entry(2, "b")).unwrap();
        replica.apply(entry(3, "c")).unwrap();
        let outcome = replica.apply(entry(4, "d")).unwrap();

        assert!(outcome.needs_resync);
        assert_eq!(outcome.applied, CommitToken::ZERO);
    }

    #[test]
    fn test_snapshot_install_replaces_state_and_keeps_newer_buffer() {
        // ARRANGE: the replica holds a doc the primary has since overwritten
        // and has 6 buffered behind a gap
        let (index, replica) = replica(10);
        replica.apply(entry(1, "stale")).unwrap();
        replica.apply(entry(6, "f")).unwrap();
        assert!(!replica.is_seeded());

        let source = MemoryIndex::new();
        for id in ["a", "b"] {
            source.write(&put(id)).unwrap();
        }
        source.commit().unwrap();

        // ACT
        let outcome = replica
            .install(SyncResponse::Snapshot {
                token: CommitToken(5),
                term: 1,
                snapshot: source.snapshot().unwrap(),
            })
            .unwrap();

        // ASSERT: snapshot at 5, buffered 6 applied on top
        assert_eq!(outcome.applied, CommitToken(6));
        assert_eq!(outcome.buffered, 0);
        assert!(replica.is_seeded());
        assert_eq!(index.doc_count(), 3);
        assert_eq!(doc_ids(index.as_ref()), vec!["a", "b", "f"]);
    }

    #[test]
    fn test_replica_reports_held_gap() {
        let (_, replica) = replica(10);
        for (token, id) in [(1, "a"), (2, "b"), (3, "c")] {
            replica.apply(entry(token, id)).unwrap();
        }

        let outcome = replica.apply(entry(6, "f")).unwrap();

        assert_eq!(outcome.applied, CommitToken(3));
        assert_eq!(outcome.buffered, 1);
        assert!(!outcome.needs_resync, "a short gap is buffered, not resynced");
    }

    #[test]
    fn test_replica_drops_ops_of_deposed_primary() {
        let index = Arc::new(MemoryIndex::new());
        let replica = ReplicaShard::new(shard(), index.clone(), CommitToken(2), 3, 10);

        let outcome = replica.apply(entry_in(2, 3, "late")).unwrap();

        assert_eq!(outcome.applied, CommitToken(2));
        assert!(!outcome.needs_resync);
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(index.doc_count(), 0);
    }

    #[tokio::test]
    async fn test_new_term_forces_resync_instead_of_merging_histories() {
        // ARRANGE: under term 1, r1 applied 1..=5 and r2 applied 1..=7
        let r1_index = Arc::new(MemoryIndex::new());
        let r1 = ReplicaShard::new(shard(), r1_index.clone(), CommitToken::ZERO, 1, 10);
        let (r2_index, r2) = replica(10);
        for token in 1..=7 {
            let op = entry(token, &format!("old-{}", token));
            if token <= 5 {
                r1.apply(op.clone()).unwrap();
            }
            r2.apply(op).unwrap();
        }

        // r1 is promoted in term 2 and commits new 6, 7 and 8
        let promoted = PrimaryShard::new(shard(), r1_index.clone(), 2, r1.applied(), 10, 5).inheriting(r1.term());
        let new_ops: Vec<ReplicationEntry> = (6..=8)
            .map(|token| promoted.commit(put(&format!("new-{}", token))).unwrap())
            .collect();

        // ACT: the new ops reach r2
        let outcomes: Vec<_> = new_ops.into_iter().map(|op| r2.apply(op).unwrap()).collect();

        // ASSERT: nothing applied over the old history; a resync is requested
        assert!(outcomes.iter().all(|o| o.needs_resync && o.applied == CommitToken(7)));
        assert_eq!(r2.term(), 1);
        assert_eq!(r2.pending_len(), 0);

        // ASSERT: r2's progress does not count toward the new primary's quorum
        let recorded = promoted.record_ack(&ack("r2", r2.applied().0, r2.term()));
        assert!(matches!(recorded, Err(ClusterError::StaleAssignment { .. })));
        let quorum = promoted
            .wait_for_quorum(CommitToken(6), 2, &[NodeId::from("r2")], Instant::now() + Duration::from_millis(20))
            .await;
        assert_eq!(quorum, Err(ClusterError::QuorumNotReached { acked: 1, required: 2 }));

        // ACT: the catch-up sync
        let response = promoted
            .sync_response(&SyncRequest {
                shard: shard(),
                from: r2.applied(),
                term: r2.term(),
                full: false,
            })
            .unwrap();
        assert!(matches!(response, SyncResponse::Snapshot { token: CommitToken(8), term: 2, .. }));
        let installed = r2.install(response).unwrap();

        // ASSERT: both copies hold the new primary's history
        assert_eq!(installed.applied, CommitToken(8));
        assert_eq!(r2.term(), 2);
        assert_eq!(doc_ids(r2_index.as_ref()), doc_ids(r1_index.as_ref()));
        assert!(promoted.record_ack(&ack("r2", 8, r2.term())).is_ok());
    }

    #[test]
    fn test_sync_replays_for_replica_caught_up_to_promotion() {
        // ARRANGE: promoted at 5 from term 1; the replica also stopped at 5
        let promoted = PrimaryShard::new(shard(), Arc::new(MemoryIndex::new()), 2, CommitToken(5), 10, 5).inheriting(1);
        promoted.commit(put("new")).unwrap();
        let replica = ReplicaShard::new(shard(), Arc::new(MemoryIndex::new()), CommitToken(5), 1, 10);

        // ACT
        let response = promoted
            .sync_response(&SyncRequest {
                shard: shard(),
                from: CommitToken(5),
                term: 1,
                full: false,
            })
            .unwrap();

        // ASSERT
        let SyncResponse::Ops { term, entries } = response.clone() else {
            panic!("expected replay, got {:?}", response);
        };
        assert_eq!(term, 2);
        assert_eq!(entries.len(), 1);
        let installed = replica.install(response).unwrap();
        assert_eq!(installed.applied, CommitToken(6));
        assert_eq!(replica.term(), 2);
    }

    #[test]
    fn test_sync_lock_is_exclusive() {
        let (_, replica) = replica(10);

        assert!(replica.begin_sync());
        assert!(!replica.begin_sync());
        replica.end_sync();
        assert!(replica.begin_sync());
    }
}
