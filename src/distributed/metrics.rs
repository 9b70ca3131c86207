// Metrics collection for the distributed storage node
//
// Atomic counters for operations and byte volumes plus a bounded window of
// recent operation latencies. Snapshots fold in cache and cluster figures
// supplied by the façade.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_WINDOW: usize = 1024;

/// Summary of the recent latency window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Fastest operation in the window, milliseconds
    pub min_ms: f64,

    /// Slowest operation in the window, milliseconds
    pub max_ms: f64,

    /// Mean over the window, milliseconds
    pub mean_ms: f64,

    /// Operations in the window
    pub samples: usize,
}

/// Snapshot of distributed storage metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedMetrics {
    /// Store operations served
    pub store_ops: u64,

    /// Retrieve operations served
    pub retrieve_ops: u64,

    /// Delete operations served
    pub delete_ops: u64,

    /// Operations that returned an error
    pub failed_ops: u64,

    /// Payload bytes written into the node
    pub bytes_in: u64,

    /// Payload bytes read out of the node
    pub bytes_out: u64,

    /// Latency over the recent window
    pub latency: LatencySummary,

    /// Metadata cache hit rate in [0, 1]
    pub cache_hit_rate: f64,

    /// Known cluster nodes
    pub cluster_size: usize,

    /// Nodes currently usable as targets
    pub healthy_nodes: usize,

    /// Mean replica count over tracked keys
    pub replication_factor: f64,

    /// When the snapshot was taken
    pub generated_at: DateTime<Utc>,
}

/// Accumulator for the node's operation metrics
#[derive(Default)]
pub struct MetricsRegistry {
    store_ops: AtomicU64,
    retrieve_ops: AtomicU64,
    delete_ops: AtomicU64,
    failed_ops: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_store(&self, bytes: u64) {
        self.store_ops.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_retrieve(&self, bytes: u64) {
        self.retrieve_ops.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.delete_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Add one operation latency to the running window.
    pub fn record_latency(&self, elapsed: Duration) {
        let mut window = self.latencies.lock();
        if window.len() >= LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    fn latency_summary(&self) -> LatencySummary {
        let window = self.latencies.lock();
        if window.is_empty() {
            return LatencySummary {
                min_ms: 0.0,
                max_ms: 0.0,
                mean_ms: 0.0,
                samples: 0,
            };
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for &v in window.iter() {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        LatencySummary {
            min_ms: min,
            max_ms: max,
            mean_ms: sum / window.len() as f64,
            samples: window.len(),
        }
    }

    /// Fold the counters and supplied cluster figures into a snapshot.
    pub fn snapshot(
        &self,
        cache_hit_rate: f64,
        cluster_size: usize,
        healthy_nodes: usize,
        replication_factor: f64,
    ) -> DistributedMetrics {
        DistributedMetrics {
            store_ops: self.store_ops.load(Ordering::Relaxed),
            retrieve_ops: self.retrieve_ops.load(Ordering::Relaxed),
            delete_ops: self.delete_ops.load(Ordering::Relaxed),
            failed_ops: self.failed_ops.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            latency: self.latency_summary(),
            cache_hit_rate,
            cluster_size,
            healthy_nodes,
            replication_factor,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsRegistry::new();
        metrics.record_store(100);
        metrics.record_store(50);
        metrics.record_retrieve(30);
        metrics.record_delete();
        metrics.record_failure();

        let snapshot = metrics.snapshot(0.5, 3, 2, 1.5);
        assert_eq!(snapshot.store_ops, 2);
        assert_eq!(snapshot.bytes_in, 150);
        assert_eq!(snapshot.retrieve_ops, 1);
        assert_eq!(snapshot.bytes_out, 30);
        assert_eq!(snapshot.delete_ops, 1);
        assert_eq!(snapshot.failed_ops, 1);
        assert_eq!(snapshot.cluster_size, 3);
    }

    #[test]
    fn latency_window_summarizes_min_max_mean() {
        let metrics = MetricsRegistry::new();
        metrics.record_latency(Duration::from_millis(10));
        metrics.record_latency(Duration::from_millis(20));
        metrics.record_latency(Duration::from_millis(30));

        let summary = metrics.snapshot(0.0, 0, 0, 0.0).latency;
        assert_eq!(summary.samples, 3);
        assert!((summary.min_ms - 10.0).abs() < 1.0);
        assert!((summary.max_ms - 30.0).abs() < 1.0);
        assert!((summary.mean_ms - 20.0).abs() < 1.0);
    }

    #[test]
    fn latency_window_is_bounded() {
        let metrics = MetricsRegistry::new();
        for _ in 0..(LATENCY_WINDOW + 100) {
            metrics.record_latency(Duration::from_millis(1));
        }
        assert_eq!(
            metrics.snapshot(0.0, 0, 0, 0.0).latency.samples,
            LATENCY_WINDOW
        );
    }
}
