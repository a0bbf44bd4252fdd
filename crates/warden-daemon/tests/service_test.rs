//! Integration tests for the service surface

use std::sync::Arc;
use std::time::Duration;

use warden_core::{
    Config, Operation, OperationKind, OperationStatus, Plan, Repo, WardenError,
};
use warden_daemon::{OperationFilter, Service};
use warden_oplog::{Broker, ClearHistoryFilter, LogStore, OpLog, Query};
use warden_orchestrator::{
    DownloadSigner, Orchestrator, OrchestratorConfig, RepoRegistry,
};
use warden_restic::{MockDriver, RepoDriver};

fn repo(id: &str) -> Repo {
    Repo {
        id: id.to_string(),
        uri: format!("/tmp/{}", id),
        ..Default::default()
    }
}

fn plan(id: &str, repo: &str) -> Plan {
    Plan {
        id: id.to_string(),
        repo: repo.to_string(),
        paths: vec!["/data".to_string()],
        cron: "0 0 1 1 *".to_string(),
        ..Default::default()
    }
}

struct Fixture {
    service: Service,
    orchestrator: Arc<Orchestrator>,
    oplog: Arc<OpLog>,
    _dir: tempfile::TempDir,
}

fn fixture(config: Config) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let oplog = Arc::new(OpLog::open(&dir.path().join("oplog.redb")).unwrap());
    let logs = Arc::new(LogStore::open(&dir.path().join("logs")).unwrap());
    let broker = Broker::new();
    let _bridge = broker.attach(&oplog);

    let registry = Arc::new(RepoRegistry::with_factory(
        config.repos.clone(),
        Box::new(|_| {
            let driver: Arc<dyn RepoDriver> = Arc::new(MockDriver::new());
            driver
        }),
    ));
    let orchestrator = Orchestrator::new(
        config,
        oplog.clone(),
        logs,
        registry,
        broker,
        OrchestratorConfig {
            shutdown_grace: Duration::from_millis(500),
        },
    );
    let service = Service::new(
        orchestrator.clone(),
        DownloadSigner::new([9u8; 32]),
        dir.path().join("warden.toml"),
        dir.path().join("restores"),
    );
    Fixture {
        service,
        orchestrator,
        oplog,
        _dir: dir,
    }
}

async fn wait_for<F>(mut predicate: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_triggered_backup_completes_with_followup_index() {
    let config = Config {
        repos: vec![repo("r1")],
        plans: vec![plan("p1", "r1")],
    };
    let fx = fixture(config);
    let loop_handle = tokio::spawn(fx.orchestrator.clone().run());

    let op_id = fx.service.backup("p1").await.unwrap();

    let oplog = fx.oplog.clone();
    wait_for(
        || oplog.get(op_id).unwrap().status == OperationStatus::Success,
        "triggered backup to finish",
    )
    .await;

    let backup = fx.oplog.get(op_id).unwrap();
    assert!(!backup.snapshot_id.is_empty());

    let oplog = fx.oplog.clone();
    wait_for(
        || {
            oplog
                .get_by_snapshot(&backup.snapshot_id, Query::all())
                .unwrap()
                .iter()
                .any(|op| matches!(op.kind, OperationKind::IndexSnapshot { .. }))
        },
        "snapshot to be indexed",
    )
    .await;

    fx.orchestrator.stop();
    let _ = loop_handle.await;
}

#[tokio::test]
async fn test_backup_for_unknown_plan_is_not_found() {
    let fx = fixture(Config::default());
    assert!(matches!(
        fx.service.backup("nope").await,
        Err(WardenError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_download_url_requires_restore_kind() {
    let config = Config {
        repos: vec![repo("r1")],
        plans: vec![plan("p1", "r1")],
    };
    let fx = fixture(config);

    let mut backup = Operation::new("r1", "p1", OperationKind::Backup { last_status: None });
    fx.oplog.add(&mut backup).unwrap();

    let mut restore = Operation::new(
        "r1",
        "p1",
        OperationKind::Restore {
            snapshot_id: "snap01".to_string(),
            path: "/data/docs".to_string(),
            target: "/var/warden/restores/restore-1".to_string(),
        },
    );
    restore.snapshot_id = "snap01".to_string();
    fx.oplog.add(&mut restore).unwrap();

    // Signed segment round-trips to the restore's target directory.
    let segment = fx.service.get_download_url(restore.id).unwrap();
    let (target, subpath) = fx
        .service
        .verify_download_path(&format!("{}/docs/a.txt", segment))
        .unwrap();
    assert_eq!(
        target.to_string_lossy(),
        "/var/warden/restores/restore-1"
    );
    assert_eq!(subpath, "docs/a.txt");

    // Correct signature over a backup op: 404, not 403.
    assert!(matches!(
        fx.service.get_download_url(backup.id),
        Err(WardenError::NotFound(_))
    ));
    let forged = DownloadSigner::new([9u8; 32]).sign(backup.id);
    assert!(matches!(
        fx.service.verify_download_path(&format!("{}/x", forged)),
        Err(WardenError::NotFound(_))
    ));

    // Tampered signature: 403.
    let mut bad = segment.clone();
    let tail = bad.pop().unwrap();
    bad.push(if tail == '0' { '1' } else { '0' });
    assert!(matches!(
        fx.service.verify_download_path(&format!("{}/x", bad)),
        Err(WardenError::Unauthorized(_))
    ));

    // Unknown op id with a valid signature: 404.
    let unknown = DownloadSigner::new([9u8; 32]).sign(9999);
    assert!(matches!(
        fx.service.verify_download_path(&format!("{}/x", unknown)),
        Err(WardenError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_get_operations_filters() {
    let config = Config {
        repos: vec![repo("r1"), repo("r2")],
        plans: vec![plan("p1", "r1"), plan("p2", "r2")],
    };
    let fx = fixture(config);

    for (repo_id, plan_id) in [("r1", "p1"), ("r1", "p1"), ("r2", "p2")] {
        let mut op = Operation::new(repo_id, plan_id, OperationKind::Backup { last_status: None });
        fx.oplog.add(&mut op).unwrap();
    }

    let by_repo = fx
        .service
        .get_operations(&OperationFilter {
            repo_id: Some("r1".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_repo.len(), 2);

    let last_one = fx
        .service
        .get_operations(&OperationFilter {
            last_n: Some(1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(last_one.len(), 1);
    assert_eq!(last_one[0].plan_id, "p2");

    let by_ids = fx
        .service
        .get_operations(&OperationFilter {
            ids: vec![by_repo[0].id],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_ids.len(), 1);
}

#[tokio::test]
async fn test_clear_history_spares_running_work() {
    let config = Config {
        repos: vec![repo("r1")],
        plans: vec![plan("p1", "r1")],
    };
    let fx = fixture(config);

    let mut done = Operation::new("r1", "p1", OperationKind::Backup { last_status: None });
    fx.oplog.add(&mut done).unwrap();
    done.status = OperationStatus::InProgress;
    fx.oplog.update(&done).unwrap();
    done.status = OperationStatus::Error;
    fx.oplog.update(&done).unwrap();

    let mut running = Operation::new("r1", "p1", OperationKind::Backup { last_status: None });
    fx.oplog.add(&mut running).unwrap();
    running.status = OperationStatus::InProgress;
    fx.oplog.update(&running).unwrap();

    let deleted = fx
        .service
        .clear_history(&ClearHistoryFilter {
            repo_id: Some("r1".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(deleted, vec![done.id]);
    assert!(fx.oplog.get(running.id).is_ok());
}

#[tokio::test]
async fn test_set_config_persists_and_reloads() {
    let config = Config {
        repos: vec![repo("r1")],
        plans: vec![plan("p1", "r1")],
    };
    let fx = fixture(config.clone());

    let mut updated = config;
    updated.plans.push(plan("p2", "r1"));
    let applied = fx.service.set_config(updated.clone()).await.unwrap();
    assert_eq!(applied, updated);
    assert_eq!(fx.service.get_config(), updated);

    // New plan's cron task allocated a pending backup row.
    let p2 = fx.oplog.get_by_plan("p2", Query::all()).unwrap();
    assert_eq!(p2.len(), 1);
    assert_eq!(p2[0].status, OperationStatus::Pending);

    // Rejects configs that fail validation.
    let mut broken = updated.clone();
    broken.plans[0].repo = "ghost".to_string();
    assert!(fx.service.set_config(broken).await.is_err());
    assert_eq!(fx.service.get_config(), updated);
}
