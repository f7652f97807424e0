//! Prometheus metrics for platform observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("gantry_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a deployment status transition.
pub fn deployment_status_changed(status: &str) {
    counter!("gantry_deployments_total", "status" => status.to_string()).increment(1);
}

/// Record a provisioning run launch.
pub fn provision_launched(kind: &str) {
    counter!("gantry_provision_runs_total", "kind" => kind.to_string()).increment(1);
}

/// Record provisioning run duration.
pub fn provision_duration(kind: &str, duration_ms: u64) {
    histogram!("gantry_provision_duration_ms", "kind" => kind.to_string())
        .record(duration_ms as f64);
}

/// Track the number of attached log stream observers.
pub fn stream_attached() {
    gauge!("gantry_stream_observers").increment(1.0);
}

pub fn stream_detached() {
    gauge!("gantry_stream_observers").decrement(1.0);
}

/// Record a GitHub API failure.
pub fn github_api_error(operation: &str) {
    counter!("gantry_github_errors_total", "operation" => operation.to_string()).increment(1);
}
