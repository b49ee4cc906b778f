//! Fan-out of encoded frames to connected parties.

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::state::Hub;

/// Broadcast a frame to every connection except `except`.
///
/// Sends never wait: a connection whose queue is full is skipped for this
/// frame, and a connection whose writer has gone away is pruned.
pub fn broadcast_frame(hub: &mut Hub, frame: &str, except: Option<&str>) -> usize {
    let mut sent = 0;
    let mut closed = Vec::new();

    for (conn_id, conn) in hub.connections.iter() {
        if Some(conn_id.as_str()) == except {
            continue;
        }
        match conn.tx.try_send(frame.to_string()) {
            Ok(()) => sent += 1,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %conn_id, "Outbound queue full, skipping frame");
                #[cfg(feature = "metrics")]
                crate::metrics::record_dropped_frame();
            }
            Err(TrySendError::Closed(_)) => closed.push(conn_id.clone()),
        }
    }

    for conn_id in closed {
        debug!(conn_id = %conn_id, "Pruning closed connection");
        hub.connections.remove(&conn_id);
    }

    debug!(sent, "Broadcast frame");
    sent
}

/// Send a frame to a single connection. Returns false if it could not be queued.
pub fn send_to(hub: &Hub, conn_id: &str, frame: &str) -> bool {
    match hub.connections.get(conn_id) {
        Some(conn) => conn.tx.try_send(frame.to_string()).is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionState;
    use tokio::sync::mpsc;

    fn hub_with(ids: &[&str], capacity: usize) -> (Hub, Vec<mpsc::Receiver<String>>) {
        let mut hub = Hub::default();
        let mut receivers = Vec::new();
        for id in ids {
            let (tx, rx) = mpsc::channel(capacity);
            hub.connections.insert(id.to_string(), ConnectionState::new(id.to_string(), tx));
            receivers.push(rx);
        }
        (hub, receivers)
    }

    #[test]
    fn test_broadcast_excludes_origin() {
        let (mut hub, mut rxs) = hub_with(&["a", "b", "c"], 4);
        assert_eq!(broadcast_frame(&mut hub, "hello", Some("a")), 2);
        assert!(rxs[0].try_recv().is_err());
        assert_eq!(rxs[1].try_recv().unwrap(), "hello");
        assert_eq!(rxs[2].try_recv().unwrap(), "hello");
    }

    #[test]
    fn test_full_queue_is_skipped_not_pruned() {
        let (mut hub, _rxs) = hub_with(&["slow"], 1);
        assert_eq!(broadcast_frame(&mut hub, "one", None), 1);
        assert_eq!(broadcast_frame(&mut hub, "two", None), 0);
        assert!(hub.connections.contains_key("slow"));
    }

    #[test]
    fn test_closed_connection_is_pruned() {
        let (mut hub, rxs) = hub_with(&["gone"], 1);
        drop(rxs);
        assert_eq!(broadcast_frame(&mut hub, "x", None), 0);
        assert!(hub.connections.is_empty());
    }
}
