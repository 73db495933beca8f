use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // Producer metrics
    pub records_enqueued: AtomicU64,
    pub flushes: AtomicU64,
    pub empty_flushes: AtomicU64,
    pub records_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub records_merged_back: AtomicU64,
    pub encode_failures: AtomicU64,
    pub publish_latency: AtomicU64, // in milliseconds

    // Consumer metrics
    pub batches_processed: AtomicU64,
    pub messages_consumed: AtomicU64,
    pub decode_failures: AtomicU64,
    pub messages_filtered: AtomicU64,
    pub deltas_committed: AtomicU64,
    pub deltas_failed: AtomicU64,
    pub deltas_skipped: AtomicU64,
    pub messages_acked: AtomicU64,
    pub write_latency: AtomicU64, // in milliseconds
}

impl PipelineMetrics {
    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn record_publish_latency(&self, duration: Duration) {
        self.publish_latency
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_write_latency(&self, duration: Duration) {
        self.write_latency
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn get_average_publish_latency(&self) -> f64 {
        let total = self.publish_latency.load(Ordering::Relaxed);
        let count = self
            .flushes
            .load(Ordering::Relaxed)
            .saturating_sub(self.empty_flushes.load(Ordering::Relaxed));
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn get_average_write_latency(&self) -> f64 {
        let total = self.write_latency.load(Ordering::Relaxed);
        let count =
            self.deltas_committed.load(Ordering::Relaxed) + self.deltas_failed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Share of non-empty flushes whose publish failed.
    pub fn get_publish_failure_rate(&self) -> f64 {
        let failures = self.publish_failures.load(Ordering::Relaxed);
        let attempts = self
            .flushes
            .load(Ordering::Relaxed)
            .saturating_sub(self.empty_flushes.load(Ordering::Relaxed));
        if attempts > 0 {
            failures as f64 / attempts as f64
        } else {
            0.0
        }
    }

    pub fn get_delta_failure_rate(&self) -> f64 {
        let failed = self.deltas_failed.load(Ordering::Relaxed);
        let total = failed + self.deltas_committed.load(Ordering::Relaxed);
        if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        info!(
            enqueued = self.records_enqueued.load(Ordering::Relaxed),
            published = self.records_published.load(Ordering::Relaxed),
            merged_back = self.records_merged_back.load(Ordering::Relaxed),
            publish_failure_rate = self.get_publish_failure_rate(),
            avg_publish_ms = self.get_average_publish_latency(),
            consumed = self.messages_consumed.load(Ordering::Relaxed),
            acked = self.messages_acked.load(Ordering::Relaxed),
            decode_failures = self.decode_failures.load(Ordering::Relaxed),
            delta_failure_rate = self.get_delta_failure_rate(),
            avg_write_ms = self.get_average_write_latency(),
            "Pipeline metrics"
        );
    }
}

/// Logs a metrics summary every `every` until `shutdown` fires.
pub async fn run_metrics_reporter(
    metrics: Arc<PipelineMetrics>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => metrics.log_summary(),
        }
    }
    metrics.log_summary();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_without_traffic_are_zero() {
        let metrics = PipelineMetrics::default();
        assert_eq!(metrics.get_publish_failure_rate(), 0.0);
        assert_eq!(metrics.get_delta_failure_rate(), 0.0);
        assert_eq!(metrics.get_average_publish_latency(), 0.0);
    }

    #[test]
    fn test_publish_failure_rate_ignores_empty_flushes() {
        let metrics = PipelineMetrics::default();
        PipelineMetrics::incr(&metrics.flushes, 10);
        PipelineMetrics::incr(&metrics.empty_flushes, 6);
        PipelineMetrics::incr(&metrics.publish_failures, 1);
        assert_eq!(metrics.get_publish_failure_rate(), 0.25);
    }
}
