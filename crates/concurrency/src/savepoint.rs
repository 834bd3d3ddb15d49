//! Savepoint stack
//!
//! Entries are kept in the order they were set. Rollback-to replaces an
//! entry's slot in place, so the entry keeps its position and its name keeps
//! resolving. The two top pointers are derived from the stack: the last
//! entry set outside a sub-statement, and the last entry set inside one.

use crate::arena::SlotId;
use keel_core::ConnectionId;

/// One named savepoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavepointEntry {
    /// Savepoint name, unique per connection
    pub name: String,
    /// Slot of the nested transaction backing the savepoint
    pub slot: SlotId,
    /// True if the savepoint was set while inside a sub-statement
    pub opened_in_sub_statement: bool,
    /// Connection that set the savepoint
    pub owner: ConnectionId,
}

/// Ordered savepoints of one connection
#[derive(Debug, Default)]
pub struct SavepointStack {
    entries: Vec<SavepointEntry>,
}

impl SavepointStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new entry
    pub fn push(&mut self, entry: SavepointEntry) {
        self.entries.push(entry);
    }

    /// Position of the entry called `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Entry called `name`
    pub fn get(&self, name: &str) -> Option<&SavepointEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Mutable entry called `name`
    pub fn get_mut(&mut self, name: &str) -> Option<&mut SavepointEntry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    /// True if an entry called `name` exists
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove the entry called `name`
    pub fn remove(&mut self, name: &str) -> Option<SavepointEntry> {
        let idx = self.position(name)?;
        Some(self.entries.remove(idx))
    }

    /// Remove every entry backed by `slot`
    pub fn forget_slot(&mut self, slot: SlotId) {
        self.entries.retain(|e| e.slot != slot);
    }

    /// Innermost savepoint set outside a sub-statement
    pub fn savepoint_top(&self) -> Option<&SavepointEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| !e.opened_in_sub_statement)
    }

    /// Innermost savepoint set inside a sub-statement
    pub fn sub_statement_top(&self) -> Option<&SavepointEntry> {
        self.entries.iter().rev().find(|e| e.opened_in_sub_statement)
    }

    /// Entries in the order they were set
    pub fn iter(&self) -> impl Iterator<Item = &SavepointEntry> + '_ {
        self.entries.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no savepoint is set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
