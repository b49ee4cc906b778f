//! Pending artifact requests awaiting a response from a connected party.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use canvas_sync_core::ArtifactTool;

/// One outstanding request. Destroyed on matching response or timeout.
pub struct PendingRequest {
    pub tool: ArtifactTool,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    resolver: oneshot::Sender<Value>,
}

/// Table of outstanding requests keyed by request id.
///
/// Guarded by a std mutex: every critical section is a map insert/remove
/// with no await inside, and removal must also work from `Drop`.
#[derive(Default)]
pub struct PendingRequests {
    requests: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return the receiver its response will arrive on.
    pub fn insert(
        &self,
        request_id: &str,
        tool: ArtifactTool,
        timeout: Duration,
    ) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        requests.insert(
            request_id.to_string(),
            PendingRequest {
                tool,
                created_at: Utc::now(),
                timeout,
                resolver: tx,
            },
        );
        rx
    }

    /// Deliver a response. Returns false if no request with that id is pending.
    pub fn resolve(&self, request_id: &str, payload: Value) -> bool {
        let pending = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.remove(request_id)
        };
        match pending {
            Some(request) => {
                let elapsed_ms = (Utc::now() - request.created_at).num_milliseconds();
                debug!(request_id, tool = %request.tool, elapsed_ms, "Resolved artifact request");
                request.resolver.send(payload).is_ok()
            }
            None => false,
        }
    }

    pub fn remove(&self, request_id: &str) -> Option<PendingRequest> {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        requests.remove(request_id)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        let requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        requests.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        let requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a pending entry when the waiting caller goes away early.
pub(crate) struct PendingGuard<'a> {
    pub(crate) table: &'a PendingRequests,
    pub(crate) request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_payload() {
        let table = PendingRequests::new();
        let rx = table.insert("req-1", ArtifactTool::GetSnapshot, Duration::from_secs(1));
        assert!(table.contains("req-1"));

        assert!(table.resolve("req-1", json!({"image": "data"})));
        assert_eq!(rx.await.unwrap(), json!({"image": "data"}));
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolve_unknown_id() {
        let table = PendingRequests::new();
        assert!(!table.resolve("missing", json!(null)));
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let table = PendingRequests::new();
        let _rx = table.insert("req-2", ArtifactTool::GetSnapshot, Duration::from_secs(1));
        {
            let _guard = PendingGuard {
                table: &table,
                request_id: "req-2".into(),
            };
        }
        assert!(!table.contains("req-2"));
    }
}
