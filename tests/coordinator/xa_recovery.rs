//! XA prepare and recovery across restarts

use crate::common::*;
use keel::{EngineConfig, ErrorKind, KeelError, PrepareDetach, Scope, XAER_RMERR};

#[test]
fn committed_xa_transaction_is_not_in_doubt_after_restart() {
    let mut t = TestEngine::new();
    {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(xid("gx-commit")));
        conn.begin().unwrap();
        conn.prepare(true).unwrap();
        assert_eq!(t.engine.recover().unwrap(), vec![xid("gx-commit")]);
        conn.commit(Scope::All, true).unwrap();
    }
    t.restart();
    assert!(t.engine.recover().unwrap().is_empty());
}

#[test]
fn prepared_transaction_survives_unclean_reopen() {
    let mut t = TestEngine::new();
    {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(xid("gx-reopen")));
        conn.begin().unwrap();
        conn.prepare(true).unwrap();
        let report = conn.close();
        assert_eq!(report.detached, 1);
        assert_eq!(report.aborted, 0);
    }
    t.reopen();
    assert_eq!(t.engine.recover().unwrap(), vec![xid("gx-reopen")]);
}

#[test]
fn recovered_transaction_commits_once_by_xid() {
    let mut t = TestEngine::new();
    let x = xid("gx-once");
    {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(x.clone()));
        conn.begin().unwrap();
        conn.prepare(true).unwrap();
    }

    let report = t.engine.shutdown().unwrap();
    assert_eq!(report.discarded, 1);
    assert!(report.dirty);
    t.reopen();

    assert_eq!(t.engine.recover().unwrap(), vec![x.clone()]);
    t.engine.commit_by_xid(&x).unwrap();
    assert!(t.engine.recover().unwrap().is_empty());

    let err = t.engine.commit_by_xid(&x).unwrap_err();
    assert!(matches!(err, KeelError::XaResolution { .. }));
    assert_eq!(err.xa_code(), Some(XAER_RMERR));

    t.restart();
    assert!(t.engine.recover().unwrap().is_empty());
}

#[test]
fn recovered_transaction_rolls_back_by_xid() {
    let mut t = TestEngine::new();
    let x = xid("gx-rollback");
    {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(x.clone()));
        conn.begin().unwrap();
        conn.set_savepoint("sp").unwrap();
        conn.prepare(true).unwrap();
    }
    t.restart();

    t.engine.rollback_by_xid(&x).unwrap();
    assert!(t.engine.recover().unwrap().is_empty());
    assert_eq!(
        t.engine.rollback_by_xid(&x).unwrap_err().xa_code(),
        Some(XAER_RMERR)
    );
}

#[test]
fn several_prepared_transactions_are_listed_in_prepare_order() {
    let mut t = TestEngine::new();
    for gtrid in ["gx-a", "gx-b", "gx-c"] {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(xid(gtrid)));
        conn.begin().unwrap();
        conn.prepare(true).unwrap();
    }
    t.restart();
    assert_eq!(
        t.engine.recover().unwrap(),
        vec![xid("gx-a"), xid("gx-b"), xid("gx-c")]
    );
    t.engine.commit_by_xid(&xid("gx-b")).unwrap();
    assert_eq!(
        t.engine.recover().unwrap(),
        vec![xid("gx-a"), xid("gx-c")]
    );
}

#[test]
fn replica_connection_detaches_after_full_prepare() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect_replica().unwrap();
    conn.set_xid(Some(xid("gx-replica")));
    conn.begin().unwrap();
    conn.prepare(true).unwrap();

    assert!(!conn.context().has_open_transaction());
    let report = conn.close();
    assert_eq!(report.detached, 0);

    t.engine.commit_by_xid(&xid("gx-replica")).unwrap();
    assert!(t.engine.recover().unwrap().is_empty());
}

#[test]
fn always_detach_frees_client_connection_for_new_work() {
    let t = TestEngine::with_config(EngineConfig {
        prepare_detach: PrepareDetach::Always,
        ..test_config()
    });
    let mut conn = t.engine.connect().unwrap();
    conn.set_xid(Some(xid("gx-always")));
    conn.begin().unwrap();
    conn.prepare(true).unwrap();
    assert!(!conn.context().has_open_transaction());

    conn.set_xid(None);
    conn.begin().unwrap();
    conn.commit(Scope::All, false).unwrap();
    t.engine.rollback_by_xid(&xid("gx-always")).unwrap();
}

#[test]
fn prepare_without_xid_is_a_usage_error() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.begin().unwrap();
    let err = conn.prepare(true).unwrap_err();
    assert!(matches!(err, KeelError::MissingXid));
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(conn.context().outer_handle().is_some());
}

#[test]
fn duplicate_xid_is_rejected_while_first_is_prepared() {
    let t = TestEngine::new();
    let mut first = t.engine.connect().unwrap();
    first.set_xid(Some(xid("gx-dup")));
    first.begin().unwrap();
    first.prepare(true).unwrap();

    let mut second = t.engine.connect().unwrap();
    second.set_xid(Some(xid("gx-dup")));
    second.begin().unwrap();
    assert!(matches!(
        second.prepare(true),
        Err(KeelError::DuplicateXid { .. })
    ));
    second.rollback(Scope::All).unwrap();
    first.commit(Scope::All, true).unwrap();
}
