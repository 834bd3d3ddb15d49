//! Connection handle
//!
//! A `Connection` owns one [`ConnectionContext`] and forwards every
//! transactional call to the engine's [`TransactionManager`] while holding
//! the shared side of the lifecycle gate. Calls fail with
//! `EngineUnavailable` unless the engine is `Ready`.
//!
//! Dropping a connection runs the close path: a held checkpoint lock is
//! released, leaked handles are aborted and prepared handles are left in
//! doubt.

use super::Engine;
use keel_concurrency::{
    CloseReport, ConnectionContext, ConnectionRole, ProcInfo, Scope, TransactionManager,
};
use keel_core::{ConnectionId, DurabilityProperty, Isolation, KeelResult, TxnHandle, Xid};
use tracing::debug;

/// One frontend connection
pub struct Connection {
    engine: Engine,
    ctx: ConnectionContext,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("ctx", &self.ctx).finish()
    }
}

impl Connection {
    pub(crate) fn new(engine: Engine, id: ConnectionId) -> Self {
        debug!(target: "keel::txn", conn = %id, "Connection opened");
        Connection {
            engine,
            ctx: ConnectionContext::new(id),
            closed: false,
        }
    }

    fn with_manager<T>(
        &mut self,
        op: impl FnOnce(&TransactionManager, &mut ConnectionContext) -> KeelResult<T>,
    ) -> KeelResult<T> {
        let state = self.engine.inner.gate.read();
        let running = state.ready()?;
        op(&running.manager, &mut self.ctx)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.ctx.id()
    }

    /// Transaction state, for inspection
    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Shared status line
    pub fn proc_info(&self) -> ProcInfo {
        self.ctx.proc_info()
    }

    /// Set the connection role
    pub fn set_role(&mut self, role: ConnectionRole) {
        self.ctx.set_role(role);
    }

    /// Set the isolation level of new top-level transactions
    pub fn set_isolation(&mut self, isolation: Isolation) {
        self.ctx.set_isolation(isolation);
    }

    /// Set the durability property
    pub fn set_durability(&mut self, durability: DurabilityProperty) {
        self.ctx.set_durability(durability);
    }

    /// Override the engine's `commit_sync` for this connection
    pub fn set_commit_sync(&mut self, commit_sync: Option<bool>) {
        self.ctx.set_commit_sync(commit_sync);
    }

    /// Set or clear the XA id
    pub fn set_xid(&mut self, xid: Option<Xid>) {
        self.ctx.set_xid(xid);
    }

    /// Start executing a sub-statement
    pub fn enter_sub_statement(&mut self) {
        self.ctx.enter_sub_statement();
    }

    /// Finish executing a sub-statement
    pub fn leave_sub_statement(&mut self) {
        self.ctx.leave_sub_statement();
    }

    /// Register a callback run against the next committed or aborted handle
    pub fn register_resource_handler<F>(&mut self, handler: F)
    where
        F: FnOnce(TxnHandle) + Send + 'static,
    {
        self.ctx.register_resource_handler(handler);
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin the outer transaction
    pub fn begin(&mut self) -> KeelResult<TxnHandle> {
        self.with_manager(|m, ctx| m.begin_transaction(ctx))
    }

    /// Begin the statement transaction
    pub fn begin_statement(&mut self) -> KeelResult<TxnHandle> {
        self.with_manager(|m, ctx| m.begin_statement(ctx))
    }

    /// Commit the handle selected by `scope`
    pub fn commit(&mut self, scope: Scope, durable: bool) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.commit(ctx, scope, durable))
    }

    /// Roll back the handle selected by `scope`
    pub fn rollback(&mut self, scope: Scope) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.rollback(ctx, scope))
    }

    /// Prepare the outer transaction (`all`) or the statement
    pub fn prepare(&mut self, all: bool) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.prepare(ctx, all))
    }

    /// Set savepoint `name`
    pub fn set_savepoint(&mut self, name: &str) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.set_savepoint(ctx, name))
    }

    /// Roll back to savepoint `name`
    pub fn rollback_to_savepoint(&mut self, name: &str) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.rollback_to_savepoint(ctx, name))
    }

    /// Release savepoint `name`
    pub fn release_savepoint(&mut self, name: &str) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.release_savepoint(ctx, name))
    }

    /// Hold off checkpoints
    pub fn checkpoint_lock_acquire(&mut self) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.checkpoint_lock_acquire(ctx))
    }

    /// Let checkpoints run again
    pub fn checkpoint_lock_release(&mut self) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.checkpoint_lock_release(ctx))
    }

    /// Wait for `blocking` to release a conflicting lock on a key range
    pub fn lock_wait(
        &mut self,
        blocking: TxnHandle,
        left_key: &[u8],
        right_key: &[u8],
    ) -> KeelResult<()> {
        self.with_manager(|m, ctx| m.lock_wait(ctx, blocking, left_key, right_key))
    }

    /// Close the connection, reporting what had to be cleaned up
    pub fn close(mut self) -> CloseReport {
        self.close_inner()
    }

    fn close_inner(&mut self) -> CloseReport {
        if self.closed {
            return CloseReport::default();
        }
        self.closed = true;
        let id = self.ctx.id();
        let report = {
            let state = self.engine.inner.gate.read();
            match state.ready() {
                Ok(running) => {
                    running.reporter.forget(id);
                    running.manager.close_connection(&mut self.ctx)
                }
                Err(_) => CloseReport::default(),
            }
        };
        self.engine.inner.connections.remove(&id);
        debug!(
            target: "keel::txn",
            conn = %id,
            aborted = report.aborted,
            detached = report.detached,
            "Connection closed"
        );
        report
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_inner();
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::Engine;
    use keel_concurrency::Scope;
    use keel_core::{Isolation, Xid};
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Engine {
        Engine::builder()
            .path(dir.path())
            .config(EngineConfig {
                checkpointing_period_secs: 0,
                ..Default::default()
            })
            .open()
            .unwrap()
    }

    #[test]
    fn close_reports_leaks() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut conn = engine.connect().unwrap();
        conn.begin().unwrap();
        conn.set_savepoint("s1").unwrap();
        conn.checkpoint_lock_acquire().unwrap();
        let report = conn.close();
        assert_eq!(report.aborted, 2);
        assert!(report.released_checkpoint_lock);
        engine.checkpoint().unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn isolation_applies_to_outer_transaction() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut conn = engine.connect().unwrap();
        conn.set_isolation(Isolation::Serializable);
        conn.begin().unwrap();
        conn.begin_statement().unwrap();
        conn.commit(Scope::Statement, false).unwrap();
        conn.rollback(Scope::All).unwrap();
        assert!(!conn.context().has_open_transaction());
        drop(conn);
        engine.shutdown().unwrap();
    }

    #[test]
    fn replica_prepare_detaches() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut conn = engine.connect_replica().unwrap();
        let xid = Xid::new(7, b"replica", b"b").unwrap();
        conn.begin().unwrap();
        conn.set_xid(Some(xid.clone()));
        conn.prepare(true).unwrap();
        assert!(!conn.context().has_open_transaction());
        assert_eq!(engine.recover().unwrap(), vec![xid.clone()]);
        engine.commit_by_xid(&xid).unwrap();
        assert!(engine.recover().unwrap().is_empty());
        drop(conn);
        assert!(!engine.shutdown().unwrap().dirty);
    }
}
