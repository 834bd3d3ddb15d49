//! Simulated crashes at commit and prepare fault points

use crate::common::*;
use keel::{crash_at, ErrorKind, FaultPoint, KeelError, Scope};

#[test]
fn crash_after_commit_keeps_the_commit() {
    let mut t = TestEngine::with_fault(test_config(), crash_at(FaultPoint::CommitAfter));
    {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(xid("gx-commit-after")));
        conn.begin().unwrap();
        conn.prepare(true).unwrap();

        let err = conn.commit(Scope::All, true).unwrap_err();
        assert!(matches!(
            err,
            KeelError::InjectedCrash {
                point: "commit-after"
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Crash);
        assert!(conn.context().is_poisoned());

        let err = conn.begin().unwrap_err();
        assert!(matches!(err, KeelError::EngineUnavailable { .. }));

        let mut other = t.engine.connect().unwrap();
        assert_eq!(other.begin().unwrap_err().kind(), ErrorKind::Unavailable);
    }

    t.reopen();
    assert!(t.engine.recover().unwrap().is_empty());
}

#[test]
fn crash_before_commit_leaves_prepared_work_in_doubt() {
    let mut t = TestEngine::with_fault(test_config(), crash_at(FaultPoint::CommitBefore));
    {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(xid("gx-commit-before")));
        conn.begin().unwrap();
        conn.prepare(true).unwrap();
        assert!(matches!(
            conn.commit(Scope::All, true),
            Err(KeelError::InjectedCrash { .. })
        ));
    }

    t.reopen();
    assert_eq!(t.engine.recover().unwrap(), vec![xid("gx-commit-before")]);
    t.engine.rollback_by_xid(&xid("gx-commit-before")).unwrap();
}

#[test]
fn crash_after_prepare_is_recovered() {
    let mut t = TestEngine::with_fault(test_config(), crash_at(FaultPoint::PrepareAfter));
    {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(xid("gx-prepare-after")));
        conn.begin().unwrap();
        conn.set_savepoint("sp").unwrap();
        assert!(matches!(
            conn.prepare(true),
            Err(KeelError::InjectedCrash {
                point: "prepare-after"
            })
        ));
    }

    t.reopen();
    assert_eq!(t.engine.recover().unwrap(), vec![xid("gx-prepare-after")]);
    t.engine.commit_by_xid(&xid("gx-prepare-after")).unwrap();
    assert!(t.engine.recover().unwrap().is_empty());
}

#[test]
fn crash_before_prepare_leaves_nothing_in_doubt() {
    let mut t = TestEngine::with_fault(test_config(), crash_at(FaultPoint::PrepareBefore));
    {
        let mut conn = t.engine.connect().unwrap();
        conn.set_xid(Some(xid("gx-prepare-before")));
        conn.begin().unwrap();
        assert!(conn.prepare(true).is_err());
    }

    t.reopen();
    assert!(t.engine.recover().unwrap().is_empty());
}
