//! Integration tests for the operation log
//!
//! Covers the durable contract end-to-end:
//! - Bulk insert id contiguity
//! - Cold-start index rebuild after a version stamp mismatch
//! - Broker bridging with catch-up after loss

use redb::TableDefinition;
use warden_core::{Operation, OperationKind, OperationStatus, Snapshot};
use warden_oplog::{Broker, ClearHistoryFilter, OpLog, OperationEvent, Query};

fn backup_op(repo: &str, plan: &str) -> Operation {
    Operation::new(repo, plan, OperationKind::Backup { last_status: None })
}

fn index_op(repo: &str, plan: &str, snapshot_id: &str) -> Operation {
    let mut op = Operation::new(
        repo,
        plan,
        OperationKind::IndexSnapshot {
            snapshot: Snapshot {
                id: snapshot_id.to_string(),
                unix_time_ms: 1_700_000_000_000,
                ..Default::default()
            },
        },
    );
    op.snapshot_id = snapshot_id.to_string();
    op.status = OperationStatus::Success;
    op.unix_time_start_ms = 1_700_000_000_000;
    op.unix_time_end_ms = 1_700_000_000_000;
    op
}

#[test]
fn test_bulk_add_assigns_contiguous_ids() {
    let dir = tempfile::tempdir().unwrap();
    let log = OpLog::open(&dir.path().join("oplog.redb")).unwrap();

    let mut ops = vec![
        index_op("r1", "p1", "snap-a"),
        index_op("r1", "p1", "snap-b"),
        index_op("r1", "p1", "snap-c"),
    ];
    log.bulk_add(&mut ops).unwrap();

    assert_eq!(ops[1].id, ops[0].id + 1);
    assert_eq!(ops[2].id, ops[1].id + 1);
}

#[test]
fn test_reindex_after_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oplog.redb");

    let ids: Vec<i64> = {
        let log = OpLog::open(&path).unwrap();
        let mut ids = Vec::new();
        for plan in ["p1", "p2"] {
            let mut op = backup_op("r1", plan);
            log.add(&mut op).unwrap();
            ids.push(op.id);
        }
        let mut snap = index_op("r2", "p3", "snap-x");
        log.add(&mut snap).unwrap();
        ids.push(snap.id);
        ids
    };

    // Corrupt the secondary indexes and reset the version stamp, simulating
    // a crash before an index format migration finished.
    {
        const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
        const IDX_REPO: TableDefinition<(&str, u64), ()> = TableDefinition::new("idx_repo");

        let db = redb::Database::create(&path).unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut meta = txn.open_table(META).unwrap();
            meta.insert("index_version", 0).unwrap();
        }
        txn.delete_table(IDX_REPO).unwrap();
        txn.commit().unwrap();
    }

    // Reopen: indexes must be rebuilt to exactly the pre-crash contents.
    let log = OpLog::open(&path).unwrap();
    let by_repo: Vec<i64> = log
        .get_by_repo("r1", Query::all())
        .unwrap()
        .iter()
        .map(|o| o.id)
        .collect();
    assert_eq!(by_repo, vec![ids[0], ids[1]]);

    let by_snapshot = log.get_by_snapshot("snap-x", Query::all()).unwrap();
    assert_eq!(by_snapshot.len(), 1);
    assert_eq!(by_snapshot[0].id, ids[2]);

    let by_plan = log.get_by_plan("p2", Query::all()).unwrap();
    assert_eq!(by_plan.len(), 1);
}

#[test]
fn test_flow_groups_related_operations() {
    let dir = tempfile::tempdir().unwrap();
    let log = OpLog::open(&dir.path().join("oplog.redb")).unwrap();

    let mut backup = backup_op("r1", "p1");
    backup.flow_id = 77;
    log.add(&mut backup).unwrap();

    let mut forget = Operation::new("r1", "p1", OperationKind::Forget { forgotten: vec![] });
    forget.flow_id = 77;
    log.add(&mut forget).unwrap();

    let mut unrelated = backup_op("r1", "p2");
    log.add(&mut unrelated).unwrap();

    let flow = log.get_by_flow(77, Query::all()).unwrap();
    assert_eq!(flow.len(), 2);
    assert_eq!(flow[0].id, backup.id);
    assert_eq!(flow[1].id, forget.id);
}

#[tokio::test]
async fn test_broker_bridge_delivers_commits() {
    let dir = tempfile::tempdir().unwrap();
    let log = OpLog::open(&dir.path().join("oplog.redb")).unwrap();
    let broker = Broker::new();
    let _bridge = broker.attach(&log);
    let mut stream = broker.subscribe();

    let mut op = backup_op("r1", "p1");
    log.add(&mut op).unwrap();
    op.status = OperationStatus::InProgress;
    log.update(&op).unwrap();

    match stream.recv().await {
        OperationEvent::Created { op: created } => assert_eq!(created.id, op.id),
        other => panic!("expected Created, got {:?}", other),
    }
    match stream.recv().await {
        OperationEvent::Updated { op: updated } => {
            assert_eq!(updated.status, OperationStatus::InProgress)
        }
        other => panic!("expected Updated, got {:?}", other),
    }
}

#[tokio::test]
async fn test_lost_subscriber_can_resync_via_for_each() {
    let dir = tempfile::tempdir().unwrap();
    let log = OpLog::open(&dir.path().join("oplog.redb")).unwrap();
    let broker = Broker::new();
    let _bridge = broker.attach(&log);
    let mut stream = broker.subscribe_with_capacity(1);

    let mut first = backup_op("r1", "p1");
    log.add(&mut first).unwrap();
    for plan in ["p2", "p3", "p4"] {
        let mut op = backup_op("r1", plan);
        log.add(&mut op).unwrap();
    }

    // The tiny buffer overflowed: the subscriber must see Lost first, then
    // recover the full history by scanning from its last seen id.
    assert_eq!(stream.recv().await, OperationEvent::Lost);

    let mut recovered = Vec::new();
    log.for_each(0, |op| {
        recovered.push(op.plan_id.clone());
        Ok(())
    })
    .unwrap();
    assert_eq!(recovered, vec!["p1", "p2", "p3", "p4"]);
}

#[test]
fn test_clear_history_by_repo_and_ids() {
    let dir = tempfile::tempdir().unwrap();
    let log = OpLog::open(&dir.path().join("oplog.redb")).unwrap();

    let mut done = Vec::new();
    for repo in ["r1", "r1", "r2"] {
        let mut op = backup_op(repo, "p1");
        log.add(&mut op).unwrap();
        op.status = OperationStatus::InProgress;
        log.update(&op).unwrap();
        op.status = OperationStatus::Success;
        log.update(&op).unwrap();
        done.push(op);
    }

    let deleted = log
        .delete(&ClearHistoryFilter {
            repo_id: Some("r1".to_string()),
            ids: vec![done[0].id],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(deleted, vec![done[0].id]);

    // The other r1 row survives (not in the id set), as does r2.
    assert!(log.get(done[1].id).is_ok());
    assert!(log.get(done[2].id).is_ok());
}
