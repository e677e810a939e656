//! Prometheus metrics for the coordination layer

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};

/// Counters shared by the lock, caches and rate limiter
pub struct Metrics {
    pub registry: Registry,

    // Remote cache outcomes
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_stale_served: IntCounter,
    pub cache_miss_waits: IntCounter,
    pub cache_rebuilds: IntCounter,
    pub cache_rebuild_failures: IntCounter,

    // Process-local tier
    pub local_hits: IntCounter,
    pub local_fallbacks: IntCounter,

    // Locks
    pub lock_acquired: IntCounter,
    pub lock_contended: IntCounter,
    pub lock_released: IntCounter,
    pub lock_release_lost: IntCounter,

    // Rate limiting
    pub limiter_allowed: IntCounter,
    pub limiter_denied: IntCounter,

    // Degraded paths
    pub counter_resets: IntCounter,
    pub store_errors: IntCounter,

    // Latency of a full cache lookup, including any rebuild
    pub cache_latency: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

impl Metrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> Self {
        let registry = Registry::new();
        let r = &registry;

        let cache_latency = Histogram::with_opts(
            HistogramOpts::new(
                "leasehold_cache_latency_seconds",
                "Cache lookup latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .unwrap();
        registry.register(Box::new(cache_latency.clone())).unwrap();

        Self {
            cache_hits: counter(r, "leasehold_cache_hits_total", "Fresh remote cache hits"),
            cache_misses: counter(r, "leasehold_cache_misses_total", "Remote cache misses"),
            cache_stale_served: counter(
                r,
                "leasehold_cache_stale_served_total",
                "Stale values served while another caller refreshes",
            ),
            cache_miss_waits: counter(
                r,
                "leasehold_cache_miss_waits_total",
                "Misses that waited for another caller's rebuild",
            ),
            cache_rebuilds: counter(r, "leasehold_cache_rebuilds_total", "Successful rebuilds"),
            cache_rebuild_failures: counter(
                r,
                "leasehold_cache_rebuild_failures_total",
                "Rebuild function failures",
            ),
            local_hits: counter(
                r,
                "leasehold_local_hits_total",
                "Lookups answered by the process-local tier",
            ),
            local_fallbacks: counter(
                r,
                "leasehold_local_fallbacks_total",
                "Local values returned because the remote tier failed or was contended",
            ),
            lock_acquired: counter(r, "leasehold_lock_acquired_total", "Locks acquired"),
            lock_contended: counter(
                r,
                "leasehold_lock_contended_total",
                "Lock attempts that found the lock held",
            ),
            lock_released: counter(r, "leasehold_lock_released_total", "Locks released"),
            lock_release_lost: counter(
                r,
                "leasehold_lock_release_lost_total",
                "Releases refused because the token no longer matched",
            ),
            limiter_allowed: counter(r, "leasehold_limiter_allowed_total", "Requests allowed"),
            limiter_denied: counter(r, "leasehold_limiter_denied_total", "Requests denied"),
            counter_resets: counter(
                r,
                "leasehold_counter_resets_total",
                "Remote counters reset to zero after overflow",
            ),
            store_errors: counter(r, "leasehold_store_errors_total", "Remote store errors"),
            cache_latency,
            registry,
        }
    }

    /// Get Prometheus formatted metrics
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        metrics.cache_hits.inc();
        metrics.lock_contended.inc();
        metrics.cache_latency.observe(0.002);

        let output = metrics.gather();
        assert!(output.contains("leasehold_cache_hits_total 1"));
        assert!(output.contains("leasehold_lock_contended_total 1"));
        assert!(output.contains("leasehold_cache_latency_seconds"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.limiter_denied.inc();
        assert_eq!(a.limiter_denied.get(), 1);
        assert_eq!(b.limiter_denied.get(), 0);
    }
}
