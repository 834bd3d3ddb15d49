//! Engine startup, shutdown and concurrent connections

use crate::common::*;
use keel::{Engine, ErrorKind, KeelError, LifecycleState, Scope};
use std::thread;

#[test]
fn engine_moves_through_lifecycle_states() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::builder()
        .path(dir.path())
        .config(test_config())
        .build()
        .unwrap();
    assert_eq!(engine.state(), LifecycleState::Uninitialized);
    assert!(matches!(
        engine.connect(),
        Err(KeelError::EngineUnavailable { .. })
    ));

    engine.startup().unwrap();
    assert_eq!(engine.state(), LifecycleState::Ready);
    assert!(engine.startup().is_err());

    engine.shutdown().unwrap();
    assert_eq!(engine.state(), LifecycleState::Closed);
    assert!(engine.shutdown().is_err());
    assert!(engine.startup().is_err());
}

#[test]
fn default_config_file_is_written_on_first_open() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data");
    let engine = Engine::open(&path).unwrap();
    assert!(path.join(keel::CONFIG_FILE_NAME).exists());
    assert_eq!(engine.config(), &keel::EngineConfig::default());
    engine.shutdown().unwrap();
}

#[test]
fn shutdown_with_prepared_work_closes_dirty() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.set_xid(Some(xid("gx-shutdown")));
    conn.begin().unwrap();
    conn.prepare(true).unwrap();

    let report = t.engine.shutdown().unwrap();
    assert_eq!(report.discarded, 1);
    assert!(report.dirty);
    assert!(report.close_error.is_none());
    assert_eq!(t.engine.state(), LifecycleState::Closed);

    // Dropping a connection after shutdown has nothing left to clean up.
    let closed = conn.close();
    assert_eq!(closed.aborted + closed.detached, 0);
}

#[test]
fn clean_shutdown_with_no_prepared_work() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.begin().unwrap();
    conn.commit(Scope::All, true).unwrap();
    drop(conn);

    let report = t.engine.shutdown().unwrap();
    assert_eq!(report.discarded, 0);
    assert!(!report.dirty);
}

#[test]
fn operations_after_shutdown_are_unavailable() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    t.engine.shutdown().unwrap();

    let err = conn.begin().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(t.engine.recover().is_err());
    assert!(t.engine.checkpoint().is_err());
    assert!(t.engine.commit_by_xid(&xid("gx")).is_err());
    assert!(t.engine.connect().is_err());
}

#[test]
fn leaked_transactions_are_aborted_on_close() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.begin().unwrap();
    conn.set_savepoint("sp").unwrap();
    conn.begin_statement().unwrap();

    let report = conn.close();
    assert_eq!(report.aborted, 3);
    assert_eq!(report.detached, 0);
    assert_eq!(t.engine.stats().connections, 0);
    assert_eq!(t.engine.stats().txn.leaked_handles, 3);
}

#[test]
fn concurrent_connections_do_not_interfere() {
    let t = TestEngine::new();
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let engine = t.engine.clone();
            thread::spawn(move || {
                let mut conn = engine.connect().unwrap();
                for round in 0..20 {
                    conn.begin().unwrap();
                    conn.set_savepoint("a").unwrap();
                    conn.begin_statement().unwrap();
                    if (i + round) % 2 == 0 {
                        conn.commit(Scope::Statement, false).unwrap();
                        conn.release_savepoint("a").unwrap();
                        conn.commit(Scope::All, false).unwrap();
                    } else {
                        conn.rollback(Scope::Statement).unwrap();
                        conn.rollback_to_savepoint("a").unwrap();
                        conn.rollback(Scope::All).unwrap();
                    }
                    assert!(!conn.context().has_open_transaction());
                }
                conn.close()
            })
        })
        .collect();

    for worker in workers {
        let report = worker.join().unwrap();
        assert_eq!(report.aborted, 0);
    }

    let stats = t.engine.stats();
    assert_eq!(stats.connections, 0);
    // Each round begins and resolves an outer and a statement transaction.
    assert_eq!(stats.txn.begins, 8 * 20 * 2);
    assert_eq!(stats.txn.commits + stats.txn.rollbacks, 8 * 20 * 2);
    assert_eq!(stats.txn.leaked_handles, 0);
}
