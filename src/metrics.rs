//! Prometheus metrics for the pipeline.
//!
//! Metrics cover:
//! - Production (records accepted, batches sent, retries, delivery failures)
//! - Consumption (records delivered, poll batch sizes, commits)
//! - Group membership (rebalances, assigned partitions)
//! - Connections (state changes, server-side sessions and requests)
//!
//! All metrics live in a custom registry prefixed with "logbridge" so they
//! cannot collide with an application's default registry. Registration
//! failures are logged and the metric keeps working unregistered.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom registry for pipeline metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("logbridge".to_string()), None).unwrap_or_else(|_| Registry::new())
});

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Producer metrics
// =============================================================================

define_counter_vec!(
    RECORDS_PRODUCED,
    "records_produced_total",
    "Records durably written, by topic",
    ["topic"]
);
define_counter_vec!(
    DELIVERY_FAILURES,
    "delivery_failures_total",
    "Records that could not be delivered, by topic and reason",
    ["topic", "reason"]
);
define_counter_vec!(
    PRODUCE_RETRIES,
    "produce_retries_total",
    "Batch send attempts retried after a transient broker error",
    ["topic"]
);
define_histogram_vec!(
    PRODUCE_BATCH_SIZE,
    "produce_batch_records",
    "Records per batch sent to the broker",
    ["topic"],
    [1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
);
define_gauge!(
    PRODUCER_QUEUE_DEPTH,
    "producer_queue_depth",
    "Records buffered client-side awaiting a flush"
);

// =============================================================================
// Consumer metrics
// =============================================================================

define_counter_vec!(
    RECORDS_CONSUMED,
    "records_consumed_total",
    "Records delivered to a listener, by group and topic",
    ["group", "topic"]
);
define_histogram_vec!(
    POLL_BATCH_SIZE,
    "poll_batch_records",
    "Records returned per poll cycle",
    ["group"],
    [0.0, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]
);
define_counter_vec!(
    POLL_ERRORS,
    "poll_errors_total",
    "Poll cycles that hit a broker error",
    ["group"]
);
define_counter_vec!(
    COMMITS,
    "commits_total",
    "Offset commits by status (success, refused, error)",
    ["group", "status"]
);

// =============================================================================
// Group metrics
// =============================================================================

define_counter_vec!(
    REBALANCES,
    "rebalances_total",
    "Rebalance events handled, by kind (assign, revoke, unexpected)",
    ["group", "kind"]
);
define_gauge_vec!(
    ASSIGNED_PARTITIONS,
    "assigned_partitions",
    "Partitions currently owned by this process",
    ["group"]
);

// =============================================================================
// Connection metrics
// =============================================================================

define_counter_vec!(
    CONNECTION_STATE_CHANGES,
    "connection_state_changes_total",
    "Client connection transitions by state",
    ["state"]
);
define_gauge!(
    SERVER_ACTIVE_CONNECTIONS,
    "server_active_connections",
    "Client sessions open on the broker server"
);
define_counter!(
    SERVER_CONNECTIONS_TOTAL,
    "server_connections_total",
    "Client sessions accepted by the broker server"
);
define_counter_vec!(
    SERVER_REQUESTS,
    "server_requests_total",
    "Requests served by the broker server, by operation and status",
    ["op", "status"]
);

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they show up before first use.
pub fn init_metrics() {
    let _ = &*RECORDS_PRODUCED;
    let _ = &*DELIVERY_FAILURES;
    let _ = &*PRODUCE_RETRIES;
    let _ = &*PRODUCE_BATCH_SIZE;
    let _ = &*PRODUCER_QUEUE_DEPTH;
    let _ = &*RECORDS_CONSUMED;
    let _ = &*POLL_BATCH_SIZE;
    let _ = &*POLL_ERRORS;
    let _ = &*COMMITS;
    let _ = &*REBALANCES;
    let _ = &*ASSIGNED_PARTITIONS;
    let _ = &*CONNECTION_STATE_CHANGES;
    let _ = &*SERVER_ACTIVE_CONNECTIONS;
    let _ = &*SERVER_CONNECTIONS_TOTAL;
    let _ = &*SERVER_REQUESTS;
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn record_delivery_failure(topic: &str, reason: &str) {
    DELIVERY_FAILURES.with_label_values(&[topic, reason]).inc();
}

pub fn record_commit(group: &str, status: &str) {
    COMMITS.with_label_values(&[group, status]).inc();
}

pub fn record_rebalance(group: &str, kind: &str) {
    REBALANCES.with_label_values(&[group, kind]).inc();
}

pub fn record_connection_state(state: &str) {
    CONNECTION_STATE_CHANGES.with_label_values(&[state]).inc();
}

pub fn record_server_request(op: &str, ok: bool) {
    let status = if ok { "success" } else { "error" };
    SERVER_REQUESTS.with_label_values(&[op, status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_commit_counter_increments() {
        let before = COMMITS.with_label_values(&["metrics-test", "success"]).get();
        record_commit("metrics-test", "success");
        let after = COMMITS.with_label_values(&["metrics-test", "success"]).get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_encode_contains_prefix() {
        init_metrics();
        record_rebalance("metrics-test", "assign");
        let text = encode_metrics().unwrap();
        assert!(text.contains("logbridge_rebalances_total"));
    }

    #[test]
    fn test_gather_returns_families() {
        record_delivery_failure("metrics-test", "queue_full");
        assert!(!gather().is_empty());
    }
}
