//! Checkpoint lock blocks checkpoints until released

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn checkpoint_waits_for_lock_release() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.checkpoint_lock_acquire().unwrap();
    conn.checkpoint_lock_acquire().unwrap();
    assert!(conn.context().checkpoint_lock_held());

    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let engine = t.engine.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let result = engine.checkpoint();
            done.store(true, Ordering::SeqCst);
            result
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!done.load(Ordering::SeqCst));

    // One release undoes both acquires.
    conn.checkpoint_lock_release().unwrap();
    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    handle.join().unwrap().unwrap();
    assert!(!conn.context().checkpoint_lock_held());
}

#[test]
fn closing_connection_releases_checkpoint_lock() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.checkpoint_lock_acquire().unwrap();

    let handle = {
        let engine = t.engine.clone();
        thread::spawn(move || engine.checkpoint())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    let report = conn.close();
    assert!(report.released_checkpoint_lock);
    assert!(wait_until(Duration::from_secs(5), || handle.is_finished()));
    handle.join().unwrap().unwrap();
}

#[test]
fn release_without_acquire_is_harmless() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.checkpoint_lock_release().unwrap();
    t.engine.checkpoint().unwrap();
}

#[test]
fn lock_holders_on_two_connections_both_block_checkpoints() {
    let t = TestEngine::new();
    let mut a = t.engine.connect().unwrap();
    let mut b = t.engine.connect().unwrap();
    a.checkpoint_lock_acquire().unwrap();
    b.checkpoint_lock_acquire().unwrap();

    let handle = {
        let engine = t.engine.clone();
        thread::spawn(move || engine.checkpoint())
    };
    a.checkpoint_lock_release().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    b.checkpoint_lock_release().unwrap();
    assert!(wait_until(Duration::from_secs(5), || handle.is_finished()));
    handle.join().unwrap().unwrap();
}

#[test]
fn flush_logs_checkpoints_when_configured() {
    let t = TestEngine::with_config(keel::EngineConfig {
        checkpoint_on_flush_logs: true,
        ..test_config()
    });
    let mut conn = t.engine.connect().unwrap();
    conn.checkpoint_lock_acquire().unwrap();

    let handle = {
        let engine = t.engine.clone();
        thread::spawn(move || engine.flush_logs(false))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    conn.checkpoint_lock_release().unwrap();
    assert!(wait_until(Duration::from_secs(5), || handle.is_finished()));
    handle.join().unwrap().unwrap();

    // Group commit never checkpoints.
    conn.checkpoint_lock_acquire().unwrap();
    t.engine.flush_logs(true).unwrap();
}
