//! Lock timeout reports

use crate::common::*;
use keel::{EngineConfig, KeelError, Scope};
use serde_json::Value;

#[test]
fn timed_out_wait_stores_json_report() {
    let t = TestEngine::new();
    let mut holder = t.engine.connect().unwrap();
    let blocking = holder.begin().unwrap();

    let mut waiter = t.engine.connect().unwrap();
    let requesting = waiter.begin().unwrap();
    assert_eq!(t.engine.last_lock_timeout(waiter.id()), None);

    let err = waiter.lock_wait(blocking, b"a", b"").unwrap_err();
    assert!(matches!(err, KeelError::LockTimeout));
    assert_eq!(waiter.context().outer_handle(), Some(requesting));

    let report = t.engine.last_lock_timeout(waiter.id()).unwrap();
    let doc: Value = serde_json::from_str(&report).unwrap();
    assert_eq!(doc["connection_id"], waiter.id().as_u64());
    assert_eq!(doc["requesting_txnid"], requesting.as_u64());
    assert_eq!(doc["blocking_txnid"], blocking.as_u64());
    assert_eq!(doc["key_left"], "61");
    assert_eq!(doc["key_right"], "+infinity");
    assert!(doc.get("key").is_none());

    waiter.rollback(Scope::All).unwrap();
    holder.commit(Scope::All, false).unwrap();
}

#[test]
fn point_conflict_reports_single_key() {
    let t = TestEngine::new();
    let mut holder = t.engine.connect().unwrap();
    let blocking = holder.begin().unwrap();
    let mut waiter = t.engine.connect().unwrap();
    waiter.begin().unwrap();

    let _ = waiter.lock_wait(blocking, b"k1", b"k1");
    let doc: Value =
        serde_json::from_str(&t.engine.last_lock_timeout(waiter.id()).unwrap()).unwrap();
    assert_eq!(doc["key"], "6b31");
    assert!(doc.get("key_left").is_none());
}

#[test]
fn report_is_forgotten_when_connection_closes() {
    let t = TestEngine::new();
    let mut holder = t.engine.connect().unwrap();
    let blocking = holder.begin().unwrap();
    let mut waiter = t.engine.connect().unwrap();
    waiter.begin().unwrap();

    let _ = waiter.lock_wait(blocking, b"", b"");
    let id = waiter.id();
    assert!(t.engine.last_lock_timeout(id).is_some());

    waiter.close();
    assert_eq!(t.engine.last_lock_timeout(id), None);
}

#[test]
fn reports_are_not_stored_without_store_bit() {
    let t = TestEngine::with_config(EngineConfig {
        lock_timeout_debug: keel::LOCK_TIMEOUT_DEBUG_LOG,
        ..test_config()
    });
    let mut holder = t.engine.connect().unwrap();
    let blocking = holder.begin().unwrap();
    let mut waiter = t.engine.connect().unwrap();
    waiter.begin().unwrap();

    assert!(matches!(
        waiter.lock_wait(blocking, b"x", b"y"),
        Err(KeelError::LockTimeout)
    ));
    assert_eq!(t.engine.last_lock_timeout(waiter.id()), None);
}
