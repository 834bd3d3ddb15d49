//! Per-connection transaction context
//!
//! One `ConnectionContext` exists per frontend connection and is only ever
//! touched by that connection's thread, so it needs no locking. It holds:
//!
//! - `outer`: the multi-statement transaction, if one was begun
//! - `statement`: the transaction of the statement in flight
//! - the savepoint stack, whose two top pointers are derived from it
//! - the checkpoint-lock flag
//! - resource handlers to run before the next commit or rollback
//!
//! All handles live in the context's [`HandleArena`]; the fields above are
//! slot ids into it. The [`TransactionManager`](crate::TransactionManager)
//! performs every state transition.

use crate::arena::{HandleArena, SlotId};
use crate::progress::{ProcInfo, StatementProgress};
use crate::savepoint::SavepointStack;
use keel_core::{ConnectionId, DurabilityProperty, Isolation, TxnHandle, Xid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which handle a commit, rollback or prepare applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The statement transaction
    Statement,
    /// The outer transaction, or the statement when running in autocommit
    All,
}

/// What the connection is acting as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    /// Ordinary client session
    #[default]
    Client,
    /// Replication applier
    Replica,
}

/// Callback run against a handle just before it is committed or aborted
pub type ResourceHandler = Box<dyn FnOnce(TxnHandle) + Send>;

/// Transaction state of one connection
pub struct ConnectionContext {
    id: ConnectionId,
    role: ConnectionRole,
    isolation: Isolation,
    durability: DurabilityProperty,
    commit_sync: Option<bool>,
    xid: Option<Xid>,
    in_sub_statement: bool,
    pub(crate) arena: HandleArena,
    pub(crate) outer: Option<SlotId>,
    pub(crate) statement: Option<SlotId>,
    pub(crate) savepoints: SavepointStack,
    pub(crate) checkpoint_lock_held: bool,
    pub(crate) resource_handlers: Vec<ResourceHandler>,
    pub(crate) progress: StatementProgress,
    pub(crate) proc_info: ProcInfo,
    pub(crate) last_progress: Option<String>,
    pub(crate) poisoned: bool,
}

impl ConnectionContext {
    /// Create an empty context for connection `id`
    pub fn new(id: ConnectionId) -> Self {
        ConnectionContext {
            id,
            role: ConnectionRole::default(),
            isolation: Isolation::default(),
            durability: DurabilityProperty::default(),
            commit_sync: None,
            xid: None,
            in_sub_statement: false,
            arena: HandleArena::new(),
            outer: None,
            statement: None,
            savepoints: SavepointStack::new(),
            checkpoint_lock_held: false,
            resource_handlers: Vec::new(),
            progress: StatementProgress::default(),
            proc_info: ProcInfo::new(),
            last_progress: None,
            poisoned: false,
        }
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Connection role
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Set the connection role
    pub fn set_role(&mut self, role: ConnectionRole) {
        self.role = role;
    }

    /// Isolation level for new top-level transactions
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Set the isolation level for new top-level transactions.
    ///
    /// `Isolation::Inherit` is meaningless at top level and is ignored.
    pub fn set_isolation(&mut self, isolation: Isolation) {
        if isolation != Isolation::Inherit {
            self.isolation = isolation;
        }
    }

    /// Durability property consulted by the sync policy
    pub fn durability(&self) -> DurabilityProperty {
        self.durability
    }

    /// Set the durability property
    pub fn set_durability(&mut self, durability: DurabilityProperty) {
        self.durability = durability;
    }

    /// Per-connection override of the engine's `commit_sync`
    pub fn commit_sync(&self) -> Option<bool> {
        self.commit_sync
    }

    /// Override (or with `None`, stop overriding) `commit_sync`
    pub fn set_commit_sync(&mut self, commit_sync: Option<bool>) {
        self.commit_sync = commit_sync;
    }

    /// XA id of the current global transaction
    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    /// Set or clear the XA id
    pub fn set_xid(&mut self, xid: Option<Xid>) {
        self.xid = xid;
    }

    /// True while executing inside a sub-statement (trigger, stored function)
    pub fn in_sub_statement(&self) -> bool {
        self.in_sub_statement
    }

    /// Start executing a sub-statement
    pub fn enter_sub_statement(&mut self) {
        self.in_sub_statement = true;
    }

    /// Finish executing a sub-statement
    pub fn leave_sub_statement(&mut self) {
        self.in_sub_statement = false;
    }

    /// Register a callback run against the next committed or aborted handle
    pub fn register_resource_handler<F>(&mut self, handler: F)
    where
        F: FnOnce(TxnHandle) + Send + 'static,
    {
        self.resource_handlers.push(Box::new(handler));
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Handle of the outer transaction
    pub fn outer_handle(&self) -> Option<TxnHandle> {
        self.outer.and_then(|s| self.arena.handle(s))
    }

    /// Handle of the statement transaction
    pub fn statement_handle(&self) -> Option<TxnHandle> {
        self.statement.and_then(|s| self.arena.handle(s))
    }

    /// Handle of the innermost savepoint set outside a sub-statement
    pub fn savepoint_top(&self) -> Option<TxnHandle> {
        self.savepoint_top_slot().and_then(|s| self.arena.handle(s))
    }

    /// Handle of the innermost savepoint set inside a sub-statement
    pub fn sub_statement_top(&self) -> Option<TxnHandle> {
        self.sub_statement_top_slot()
            .and_then(|s| self.arena.handle(s))
    }

    /// Handle currently backing savepoint `name`
    pub fn savepoint_handle(&self, name: &str) -> Option<TxnHandle> {
        self.savepoints
            .get(name)
            .and_then(|e| self.arena.handle(e.slot))
    }

    /// Savepoint names in the order they were set
    pub fn savepoint_names(&self) -> Vec<String> {
        self.savepoints.iter().map(|e| e.name.clone()).collect()
    }

    /// The innermost open handle, on whose behalf lock waits run
    pub fn current_handle(&self) -> Option<TxnHandle> {
        self.current_slot().and_then(|s| self.arena.handle(s))
    }

    /// Every handle the connection has open
    pub fn open_handles(&self) -> Vec<TxnHandle> {
        self.arena.iter().map(|(_, node)| node.handle).collect()
    }

    /// True if the connection has any open handle
    pub fn has_open_transaction(&self) -> bool {
        !self.arena.is_empty()
    }

    /// True if `handle` has been prepared and is still referenced
    pub fn is_prepared(&self, handle: TxnHandle) -> bool {
        self.arena
            .iter()
            .any(|(_, node)| node.handle == handle && node.prepared)
    }

    /// True while this connection holds the checkpoint lock
    pub fn checkpoint_lock_held(&self) -> bool {
        self.checkpoint_lock_held
    }

    /// Resource handlers waiting for the next commit or rollback
    pub fn pending_resource_handlers(&self) -> usize {
        self.resource_handlers.len()
    }

    /// Row counters of the statement in flight
    pub fn statement_progress(&self) -> StatementProgress {
        self.progress
    }

    /// Mutable row counters of the statement in flight
    pub fn statement_progress_mut(&mut self) -> &mut StatementProgress {
        &mut self.progress
    }

    /// Shared status line of this connection
    pub fn proc_info(&self) -> ProcInfo {
        self.proc_info.clone()
    }

    /// Status text of the last progress report from a commit or abort
    pub fn last_progress(&self) -> Option<&str> {
        self.last_progress.as_deref()
    }

    /// True after a simulated crash; the context must not be used again
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    // ========================================================================
    // Crate internals
    // ========================================================================

    pub(crate) fn savepoint_top_slot(&self) -> Option<SlotId> {
        self.savepoints.savepoint_top().map(|e| e.slot)
    }

    pub(crate) fn sub_statement_top_slot(&self) -> Option<SlotId> {
        self.savepoints.sub_statement_top().map(|e| e.slot)
    }

    pub(crate) fn scope_slot(&self, scope: Scope) -> Option<SlotId> {
        match scope {
            Scope::Statement => self.statement,
            Scope::All => self.outer.or(self.statement),
        }
    }

    pub(crate) fn current_slot(&self) -> Option<SlotId> {
        [
            self.sub_statement_top_slot(),
            self.statement,
            self.savepoint_top_slot(),
            self.outer,
        ]
        .into_iter()
        .flatten()
        .max_by_key(|slot| self.arena.depth(*slot))
    }

    /// Drop every reference to `slot`
    pub(crate) fn forget(&mut self, slot: SlotId) {
        if self.outer == Some(slot) {
            self.outer = None;
        }
        if self.statement == Some(slot) {
            self.statement = None;
        }
        self.savepoints.forget_slot(slot);
    }

    /// Drop every reference to every handle
    pub(crate) fn clear(&mut self) {
        self.outer = None;
        self.statement = None;
        self.savepoints.clear();
        self.arena.clear();
        self.resource_handlers.clear();
        self.progress.reset();
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("outer", &self.outer_handle())
            .field("statement", &self.statement_handle())
            .field("savepoints", &self.savepoint_names())
            .field("checkpoint_lock_held", &self.checkpoint_lock_held)
            .field("resource_handlers", &self.resource_handlers.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
