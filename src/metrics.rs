//! Prometheus metrics for the stream engine.
//!
//! Counters are touched at well-defined edges only (request start, request
//! end, reset, timeout, retry); they are not load-bearing for correctness.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::io;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

/// Labels for per-cluster upstream metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    /// Upstream cluster name.
    pub cluster: String,
}

/// Labels for hijack replies.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HijackLabels {
    /// Synthetic status code written downstream.
    pub code: String,
}

/// Global metrics registry, initialized once and shared across all streams.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the proxy data plane.
pub struct Metrics {
    registry: Registry,
    downstream_request_total: Counter,
    downstream_request_active: Gauge<i64, AtomicI64>,
    downstream_request_reset: Counter,
    downstream_request_hijack: Family<HijackLabels, Counter>,
    upstream_request_retry: Family<ClusterLabels, Counter>,
    upstream_request_timeout: Family<ClusterLabels, Counter>,
    upstream_request_failed: Family<ClusterLabels, Counter>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let downstream_request_total = Counter::default();
        registry.register(
            "downstream_request",
            "Total number of downstream requests",
            downstream_request_total.clone(),
        );

        let downstream_request_active = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "downstream_request_active",
            "Number of downstream requests currently in flight",
            downstream_request_active.clone(),
        );

        let downstream_request_reset = Counter::default();
        registry.register(
            "downstream_request_reset",
            "Total number of downstream requests that ended in a reset",
            downstream_request_reset.clone(),
        );

        let downstream_request_hijack = Family::<HijackLabels, Counter>::default();
        registry.register(
            "downstream_request_hijack",
            "Total number of synthetic replies sent without contacting an upstream",
            downstream_request_hijack.clone(),
        );

        let upstream_request_retry = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "upstream_request_retry",
            "Total number of upstream retry attempts",
            upstream_request_retry.clone(),
        );

        let upstream_request_timeout = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "upstream_request_timeout",
            "Total number of upstream requests that hit a timeout",
            upstream_request_timeout.clone(),
        );

        let upstream_request_failed = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "upstream_request_failed",
            "Total number of upstream requests that ended in a reset or connect failure",
            upstream_request_failed.clone(),
        );

        Self {
            registry,
            downstream_request_total,
            downstream_request_active,
            downstream_request_reset,
            downstream_request_hijack,
            upstream_request_retry,
            upstream_request_timeout,
            upstream_request_failed,
        }
    }

    /// Records a new downstream request.
    pub fn inc_downstream_request() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.downstream_request_total.inc();
            metrics.downstream_request_active.inc();
        }
    }

    /// Records a downstream request reaching its terminal state.
    pub fn dec_downstream_active() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.downstream_request_active.dec();
        }
    }

    /// Records a downstream reset.
    pub fn inc_downstream_reset() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.downstream_request_reset.inc();
        }
    }

    /// Records a hijack reply with the given synthetic status.
    pub fn inc_hijack(code: u16) {
        let labels = HijackLabels {
            code: code.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.downstream_request_hijack.get_or_create(&labels).inc();
        }
    }

    /// Records an upstream retry attempt for a cluster.
    pub fn inc_upstream_retry(cluster: &str) {
        let labels = ClusterLabels {
            cluster: cluster.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.upstream_request_retry.get_or_create(&labels).inc();
        }
    }

    /// Records an upstream timeout for a cluster.
    pub fn inc_upstream_timeout(cluster: &str) {
        let labels = ClusterLabels {
            cluster: cluster.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.upstream_request_timeout.get_or_create(&labels).inc();
        }
    }

    /// Records an upstream failure for a cluster.
    pub fn inc_upstream_failed(cluster: &str) {
        let labels = ClusterLabels {
            cluster: cluster.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.upstream_request_failed.get_or_create(&labels).inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lifecycle_metrics() {
        Metrics::inc_downstream_request();
        Metrics::dec_downstream_active();

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("downstream_request"));
        assert!(encoded.contains("downstream_request_active"));
    }

    #[test]
    fn test_hijack_metrics() {
        Metrics::inc_hijack(404);

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("downstream_request_hijack"));
        assert!(encoded.contains("404"));
    }

    #[test]
    fn test_upstream_metrics() {
        Metrics::inc_upstream_retry("server_1");
        Metrics::inc_upstream_timeout("server_1");
        Metrics::inc_upstream_failed("server_1");

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("upstream_request_retry"));
        assert!(encoded.contains("upstream_request_timeout"));
        assert!(encoded.contains("upstream_request_failed"));
        assert!(encoded.contains("server_1"));
    }
}
