//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a new WebSocket connection.
pub fn record_ws_connect() {
    metrics::gauge!("relay_connections_active").increment(1.0);
}

/// Record a WebSocket disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("relay_connections_active").decrement(1.0);
}

/// Record a mutation applied to the mirror and relayed.
pub fn record_mutation(tool: &str) {
    let labels = [("tool", tool.to_string())];
    metrics::counter!("relay_mutations_total", &labels).increment(1);
}

/// Record an automation tool call with its duration.
pub fn record_tool_call(tool: &str, duration_secs: f64) {
    let labels = [("tool", tool.to_string())];
    metrics::counter!("automation_calls_total", &labels).increment(1);
    metrics::histogram!("automation_call_duration_seconds", &labels).record(duration_secs);
}

pub fn record_artifact_request(tool: &str) {
    let labels = [("tool", tool.to_string())];
    metrics::counter!("artifact_requests_total", &labels).increment(1);
}

pub fn record_artifact_timeout(tool: &str) {
    let labels = [("tool", tool.to_string())];
    metrics::counter!("artifact_timeouts_total", &labels).increment(1);
}

/// Record a frame skipped because a connection's outbound queue was full.
pub fn record_dropped_frame() {
    metrics::counter!("relay_dropped_frames_total").increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process; a second install reports an error.
        match install_prometheus_recorder() {
            Ok(handle) => {
                record_mutation("create_node");
                let output = handle.render();
                assert!(output.is_empty() || output.contains("relay_mutations_total"));
            }
            Err(e) => assert!(!e.to_string().is_empty()),
        }
    }

    #[test]
    fn test_recorders_do_not_panic_without_install() {
        record_ws_connect();
        record_ws_disconnect();
        record_tool_call("get_snapshot", 0.25);
        record_artifact_request("get_snapshot");
        record_artifact_timeout("get_snapshot");
        record_dropped_frame();
        record_error("protocol");
    }
}
