//! Savepoint stack behavior

use crate::common::*;
use keel::{
    ConnectionContext, ConnectionId, Environment, KeelError, LogEnvOptions, LogEnvironment,
    PrepareDetach, Scope, SyncPolicy, TransactionManager,
};
use proptest::prelude::*;
use std::sync::Arc;

#[test]
fn savepoint_round_trip_in_autocommit_statement() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();

    conn.begin_statement().unwrap();
    conn.set_savepoint("s1").unwrap();
    conn.set_savepoint("s2").unwrap();
    conn.rollback_to_savepoint("s1").unwrap();
    conn.release_savepoint("s1").unwrap();
    conn.commit(Scope::All, true).unwrap();

    let ctx = conn.context();
    assert!(!ctx.has_open_transaction());
    assert!(ctx.savepoint_names().is_empty());
    assert_eq!(ctx.savepoint_top(), None);
    assert_eq!(ctx.statement_handle(), None);
}

#[test]
fn release_with_open_child_leaves_stack_alone() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.begin().unwrap();
    conn.set_savepoint("a").unwrap();
    conn.set_savepoint("b").unwrap();
    let before: Vec<_> = ["a", "b"]
        .iter()
        .map(|n| conn.context().savepoint_handle(n))
        .collect();

    let err = conn.release_savepoint("a").unwrap_err();
    assert!(matches!(err, KeelError::SavepointHasOpenChild { .. }));
    assert!(err.is_usage());

    let after: Vec<_> = ["a", "b"]
        .iter()
        .map(|n| conn.context().savepoint_handle(n))
        .collect();
    assert_eq!(before, after);
    assert_eq!(conn.context().open_handles().len(), 3);
}

#[test]
fn open_statement_blocks_release_of_its_savepoint_parent() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.begin().unwrap();
    conn.set_savepoint("sp").unwrap();
    conn.begin_statement().unwrap();

    assert!(matches!(
        conn.release_savepoint("sp"),
        Err(KeelError::SavepointHasOpenChild { .. })
    ));
    conn.commit(Scope::Statement, false).unwrap();
    conn.release_savepoint("sp").unwrap();
    conn.commit(Scope::All, true).unwrap();
}

#[test]
fn rollback_of_outer_drops_every_savepoint() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.begin().unwrap();
    conn.set_savepoint("a").unwrap();
    conn.set_savepoint("b").unwrap();
    conn.begin_statement().unwrap();
    conn.rollback(Scope::All).unwrap();

    assert!(!conn.context().has_open_transaction());
    assert!(matches!(
        conn.rollback_to_savepoint("a"),
        Err(KeelError::SavepointNotFound { .. })
    ));
}

#[test]
fn sub_statement_savepoints_unwind_with_statement() {
    let t = TestEngine::new();
    let mut conn = t.engine.connect().unwrap();
    conn.begin().unwrap();
    conn.begin_statement().unwrap();

    conn.enter_sub_statement();
    conn.set_savepoint("trigger").unwrap();
    assert!(conn.context().sub_statement_top().is_some());
    assert_eq!(conn.context().savepoint_top(), None);
    conn.leave_sub_statement();

    conn.rollback(Scope::Statement).unwrap();
    assert_eq!(conn.context().sub_statement_top(), None);
    assert!(conn.context().outer_handle().is_some());
}

// ============================================================================
// Chain property
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Set(usize),
    RollbackTo(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..5).prop_map(Op::Set),
        (0usize..5).prop_map(Op::RollbackTo),
        (0usize..5).prop_map(Op::Release),
    ]
}

fn name(i: usize) -> String {
    format!("sp{}", i)
}

/// Live savepoint handles form one parent chain in call order, rooted at
/// the outer transaction, with nothing else open.
fn assert_chain(env: &LogEnvironment, ctx: &ConnectionContext, model: &[String]) {
    assert_eq!(ctx.savepoint_names(), model);
    let outer = ctx.outer_handle().unwrap();
    let mut parent = outer;
    for n in model {
        let handle = ctx.savepoint_handle(n).unwrap();
        assert_eq!(env.parent(handle).unwrap(), Some(parent));
        parent = handle;
    }
    assert_eq!(ctx.savepoint_top(), model.last().map(|_| parent));
    assert_eq!(env.live_count(), model.len() + 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn savepoint_chain_matches_model(ops in proptest::collection::vec(op(), 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(LogEnvironment::open(dir.path(), LogEnvOptions::default()).unwrap());
        let manager = TransactionManager::new(env.clone(), SyncPolicy::default(), PrepareDetach::default());
        let mut ctx = ConnectionContext::new(ConnectionId::new(1));
        manager.begin_transaction(&mut ctx).unwrap();
        let mut model: Vec<String> = Vec::new();

        for op in ops {
            match op {
                Op::Set(i) => {
                    let result = manager.set_savepoint(&mut ctx, &name(i));
                    if model.contains(&name(i)) {
                        let duplicate = matches!(result, Err(KeelError::DuplicateSavepoint { .. }));
                        prop_assert!(duplicate);
                    } else {
                        prop_assert!(result.is_ok());
                        model.push(name(i));
                    }
                }
                Op::RollbackTo(i) => {
                    let result = manager.rollback_to_savepoint(&mut ctx, &name(i));
                    match model.iter().position(|n| *n == name(i)) {
                        Some(pos) => {
                            prop_assert!(result.is_ok());
                            model.truncate(pos + 1);
                        }
                        None => {
                            let missing = matches!(result, Err(KeelError::SavepointNotFound { .. }));
                            prop_assert!(missing);
                        }
                    }
                }
                Op::Release(i) => {
                    let result = manager.release_savepoint(&mut ctx, &name(i));
                    match model.iter().position(|n| *n == name(i)) {
                        Some(pos) if pos + 1 == model.len() => {
                            prop_assert!(result.is_ok());
                            model.pop();
                        }
                        Some(_) => {
                            let blocked = matches!(result, Err(KeelError::SavepointHasOpenChild { .. }));
                            prop_assert!(blocked);
                        }
                        None => {
                            let missing = matches!(result, Err(KeelError::SavepointNotFound { .. }));
                            prop_assert!(missing);
                        }
                    }
                }
            }
            assert_chain(&env, &ctx, &model);
        }

        manager.commit(&mut ctx, Scope::All, false).unwrap();
        prop_assert_eq!(env.live_count(), 0);
        prop_assert!(ctx.savepoint_names().is_empty());
    }
}
