//! Prometheus metrics for the batching pipeline.

use prometheus_metric_storage::StorageRegistry;
use std::sync::OnceLock;

fn storage_registry() -> &'static StorageRegistry {
    static REGISTRY: OnceLock<StorageRegistry> = OnceLock::new();
    REGISTRY.get_or_init(StorageRegistry::default)
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "batch_mux")]
pub(crate) struct Metrics {
    /// Entries pending (fan-in channel plus builder queue) at the start
    /// of a batching round.
    #[metric(buckets(1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0))]
    pub(crate) pending_requests: prometheus::Histogram,

    /// Entries gathered per batching round.
    #[metric(buckets(1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0))]
    pub(crate) batch_size: prometheus::Histogram,

    /// Send-loop time per round, split by phase.
    #[metric(
        labels("phase"),
        buckets(0.0001, 0.0005, 0.001, 0.005, 0.02, 0.1, 0.5, 1.0)
    )]
    pub(crate) send_loop_duration_seconds: prometheus::HistogramVec,

    /// Receive-loop time per iteration, split by phase.
    #[metric(
        labels("phase"),
        buckets(0.0001, 0.0005, 0.001, 0.005, 0.02, 0.1, 0.5, 1.0)
    )]
    pub(crate) recv_loop_duration_seconds: prometheus::HistogramVec,

    /// Round durations above the tail threshold, by direction.
    #[metric(labels("direction"), buckets(0.02, 0.05, 0.1, 0.5, 1.0, 5.0))]
    pub(crate) tail_latency_seconds: prometheus::HistogramVec,

    /// Interval between the previous round's latest arrival and the
    /// current round's head arrival.
    #[metric(buckets(0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.01, 0.1, 1.0))]
    pub(crate) head_arrival_interval_seconds: prometheus::Histogram,

    /// Extra entries gathered by a turbo-mode wait.
    #[metric(buckets(0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0))]
    pub(crate) best_batch_size: prometheus::Histogram,

    /// Running average of realised batch sizes, as fed into the adaptive
    /// wait-size decision.
    #[metric(buckets(1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0))]
    pub(crate) adaptive_batch_size: prometheus::Histogram,

    /// Stream clients skipped during dispatch, by reason.
    #[metric(labels("reason"))]
    pub(crate) no_available_connection_total: prometheus::IntCounterVec,

    /// Rounds that waited for more requests because the remote transport
    /// layer reported overload.
    pub(crate) wait_on_overload_total: prometheus::IntCounter,

    /// Panics caught and restarted, by loop.
    #[metric(labels("loop"))]
    pub(crate) loop_panic_total: prometheus::IntCounterVec,
}

impl Metrics {
    pub(crate) fn get() -> &'static Self {
        Self::instance(storage_registry()).expect("unexpected error getting metrics instance")
    }
}
