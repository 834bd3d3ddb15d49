//! Lock timeout reporting
//!
//! When a lock wait times out the environment hands a [`LockTimeoutEvent`]
//! to the installed callback. Depending on `lock_timeout_debug` the report
//! is kept as the connection's "last lock timeout" and/or written to the
//! error log. Reports are small JSON documents:
//!
//! ```json
//! {"connection_id":7,"requesting_txnid":12,"blocking_txnid":9,"key":"6b31"}
//! ```
//!
//! Range conflicts carry `key_left` / `key_right` instead of `key`; an empty
//! end renders as `-infinity` / `+infinity`.

use crate::config::{LOCK_TIMEOUT_DEBUG_LOG, LOCK_TIMEOUT_DEBUG_STORE};
use dashmap::DashMap;
use keel_core::{ConnectionId, Hex, LockTimeoutCallback, LockTimeoutEvent};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::error;

fn hex_key(key: &[u8], empty: &str) -> String {
    if key.is_empty() {
        return empty.to_string();
    }
    Hex(key).to_string()
}

/// Render a lock timeout as its JSON report
pub fn render_report(event: &LockTimeoutEvent) -> String {
    let mut doc = Map::new();
    if let Some(owner) = event.owner {
        doc.insert("connection_id".into(), Value::from(owner.as_u64()));
    }
    doc.insert(
        "requesting_txnid".into(),
        Value::from(event.requesting.as_u64()),
    );
    doc.insert(
        "blocking_txnid".into(),
        Value::from(event.blocking.as_u64()),
    );
    if event.is_point() {
        doc.insert("key".into(), Value::from(hex_key(&event.left_key, "?")));
    } else {
        doc.insert(
            "key_left".into(),
            Value::from(hex_key(&event.left_key, "-infinity")),
        );
        doc.insert(
            "key_right".into(),
            Value::from(hex_key(&event.right_key, "+infinity")),
        );
    }
    Value::Object(doc).to_string()
}

/// Collects lock timeout reports per connection
#[derive(Debug, Default)]
pub struct LockTimeoutReporter {
    debug: u32,
    last: DashMap<ConnectionId, String>,
}

impl LockTimeoutReporter {
    /// Create a reporter for the given `lock_timeout_debug` bits
    pub fn new(debug: u32) -> Self {
        Self {
            debug,
            last: DashMap::new(),
        }
    }

    /// Handle one timeout
    pub fn report(&self, event: &LockTimeoutEvent) {
        if self.debug == 0 {
            return;
        }
        let report = render_report(event);
        if self.debug & LOCK_TIMEOUT_DEBUG_LOG != 0 {
            error!(target: "keel::txn", report = %report, "Lock timeout");
        }
        if self.debug & LOCK_TIMEOUT_DEBUG_STORE != 0 {
            if let Some(owner) = event.owner {
                self.last.insert(owner, report);
            }
        }
    }

    /// Last report stored for connection `id`
    pub fn last(&self, id: ConnectionId) -> Option<String> {
        self.last.get(&id).map(|r| r.value().clone())
    }

    /// Drop the stored report of a closing connection
    pub fn forget(&self, id: ConnectionId) {
        self.last.remove(&id);
    }

    /// Callback to install on the environment
    pub fn callback(self: &Arc<Self>) -> LockTimeoutCallback {
        let reporter = Arc::clone(self);
        Arc::new(move |event: &LockTimeoutEvent| reporter.report(event))
    }
}
