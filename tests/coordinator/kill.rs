//! Killing a connection blocked in a lock wait

use crate::common::*;
use keel::{EngineConfig, ErrorKind, KeelError, Scope};
use std::thread;
use std::time::Duration;

fn patient_config() -> EngineConfig {
    EngineConfig {
        lock_timeout_ms: 30_000,
        ..test_config()
    }
}

#[test]
fn kill_interrupts_lock_wait_and_leaves_handle_alive() {
    let t = TestEngine::with_config(patient_config());
    let mut holder = t.engine.connect().unwrap();
    let blocking = holder.begin().unwrap();

    let mut waiter = t.engine.connect().unwrap();
    let id = waiter.id();
    let waiting = waiter.begin().unwrap();

    let handle = thread::spawn(move || {
        let result = waiter.lock_wait(blocking, b"k1", b"k1");
        (waiter, result)
    });

    // A kill with no waiter registered yet is dropped, so keep sending.
    assert!(wait_until(Duration::from_secs(10), || {
        t.engine.kill_connection(id).unwrap();
        handle.is_finished()
    }));
    let (mut waiter, result) = handle.join().unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, KeelError::Killed));
    assert_eq!(err.kind(), ErrorKind::Interrupted);
    assert_eq!(waiter.context().outer_handle(), Some(waiting));

    waiter.rollback(Scope::All).unwrap();
    assert!(!waiter.context().has_open_transaction());
    holder.commit(Scope::All, false).unwrap();
}

#[test]
fn lock_wait_returns_once_blocker_commits() {
    let t = TestEngine::with_config(patient_config());
    let mut holder = t.engine.connect().unwrap();
    let blocking = holder.begin().unwrap();

    let mut waiter = t.engine.connect().unwrap();
    waiter.begin().unwrap();
    let handle = thread::spawn(move || {
        let result = waiter.lock_wait(blocking, b"a", b"m");
        (waiter, result)
    });

    thread::sleep(Duration::from_millis(50));
    holder.commit(Scope::All, false).unwrap();
    let (mut waiter, result) = handle.join().unwrap();
    result.unwrap();
    waiter.commit(Scope::All, false).unwrap();
}

#[test]
fn kill_of_idle_connection_is_ignored() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    t.engine.kill_connection(conn.id()).unwrap();

    conn.begin().unwrap();
    conn.commit(Scope::All, false).unwrap();
}

#[test]
fn lock_wait_needs_an_open_transaction() {
    let t = TestEngine::new();
    let mut holder = t.engine.connect().unwrap();
    let blocking = holder.begin().unwrap();

    let mut idle = t.engine.connect().unwrap();
    assert!(matches!(
        idle.lock_wait(blocking, b"k", b"k"),
        Err(KeelError::NoActiveTransaction)
    ));
}
