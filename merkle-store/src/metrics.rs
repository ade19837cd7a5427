// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::OnceCell;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounterVec, IntGauge, Registry,
};
use std::sync::Arc;
use std::time::Duration;

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
    5.0,
];

/// Process-global storage metrics.
///
/// Initialized at most once per process; instances opened before
/// initialization simply record nothing.
#[derive(Debug)]
pub struct DBMetrics {
    pub store_get_latency_seconds: HistogramVec,
    pub store_get_bytes: HistogramVec,
    pub store_put_latency_seconds: HistogramVec,
    pub store_put_bytes: HistogramVec,
    pub store_write_batch_latency_seconds: HistogramVec,
    pub store_write_batch_bytes: HistogramVec,
    pub store_deletes: IntCounterVec,
    pub store_open_instances: IntGauge,
}

static DB_METRICS_ONCE: OnceCell<Arc<DBMetrics>> = OnceCell::new();

impl DBMetrics {
    pub fn new(registry: &Registry) -> Self {
        DBMetrics {
            store_get_latency_seconds: register_histogram_vec_with_registry!(
                "store_get_latency_seconds",
                "Store get latency in seconds",
                &["cf_name"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            store_get_bytes: register_histogram_vec_with_registry!(
                "store_get_bytes",
                "Store get returned data size in bytes",
                &["cf_name"],
                prometheus::exponential_buckets(1.0, 4.0, 15).unwrap().to_vec(),
                registry,
            )
            .unwrap(),
            store_put_latency_seconds: register_histogram_vec_with_registry!(
                "store_put_latency_seconds",
                "Store put latency in seconds",
                &["cf_name"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            store_put_bytes: register_histogram_vec_with_registry!(
                "store_put_bytes",
                "Store put data size in bytes",
                &["cf_name"],
                prometheus::exponential_buckets(1.0, 4.0, 15).unwrap().to_vec(),
                registry,
            )
            .unwrap(),
            store_write_batch_latency_seconds: register_histogram_vec_with_registry!(
                "store_write_batch_latency_seconds",
                "Store write batch latency in seconds",
                &["sync"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            store_write_batch_bytes: register_histogram_vec_with_registry!(
                "store_write_batch_bytes",
                "Store write batch data size in bytes",
                &["sync"],
                prometheus::exponential_buckets(1.0, 4.0, 15).unwrap().to_vec(),
                registry,
            )
            .unwrap(),
            store_deletes: register_int_counter_vec_with_registry!(
                "store_deletes",
                "Store delete calls",
                &["cf_name"],
                registry,
            )
            .unwrap(),
            store_open_instances: register_int_gauge_with_registry!(
                "store_open_instances",
                "Number of open store instances",
                registry,
            )
            .unwrap(),
        }
    }

    /// Initializes the global metrics once; later calls keep the first
    /// registry and log that the new one was ignored.
    pub fn init(registry: &Registry) -> &'static Arc<DBMetrics> {
        if DB_METRICS_ONCE.set(Arc::new(DBMetrics::new(registry))).is_err() {
            tracing::warn!("DBMetrics already initialized, registry ignored");
        }
        DB_METRICS_ONCE.get().unwrap()
    }

    pub fn get() -> Option<&'static Arc<DBMetrics>> {
        DB_METRICS_ONCE.get()
    }

    pub fn get_or_init(registry: &Registry) -> &'static Arc<DBMetrics> {
        DB_METRICS_ONCE.get_or_init(|| Arc::new(DBMetrics::new(registry)))
    }

    pub(crate) fn observe_get(&self, cf_name: &str, elapsed: Duration, bytes: usize) {
        self.store_get_latency_seconds
            .with_label_values(&[cf_name])
            .observe(elapsed.as_secs_f64());
        self.store_get_bytes
            .with_label_values(&[cf_name])
            .observe(bytes as f64);
    }

    pub(crate) fn observe_put(&self, cf_name: &str, elapsed: Duration, bytes: usize) {
        self.store_put_latency_seconds
            .with_label_values(&[cf_name])
            .observe(elapsed.as_secs_f64());
        self.store_put_bytes
            .with_label_values(&[cf_name])
            .observe(bytes as f64);
    }

    pub(crate) fn observe_write_batch(&self, elapsed: Duration, bytes: usize, sync: bool) {
        let label = if sync { "true" } else { "false" };
        self.store_write_batch_latency_seconds
            .with_label_values(&[label])
            .observe(elapsed.as_secs_f64());
        self.store_write_batch_bytes
            .with_label_values(&[label])
            .observe(bytes as f64);
    }

    pub(crate) fn increment_deletes(&self, cf_name: &str) {
        self.store_deletes.with_label_values(&[cf_name]).inc();
    }

    pub(crate) fn increment_open_instances(&self) {
        self.store_open_instances.inc();
    }

    pub(crate) fn decrement_open_instances(&self) {
        self.store_open_instances.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let registry = Registry::new();
        let first = DBMetrics::get_or_init(&registry);
        let second = DBMetrics::get_or_init(&Registry::new());
        assert!(Arc::ptr_eq(first, second));
        assert!(DBMetrics::get().is_some());
    }
}
