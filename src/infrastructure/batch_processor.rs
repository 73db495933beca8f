use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, Instrument};

use crate::infrastructure::batch_mapper::{BatchMapper, DeltaMapping};
use crate::infrastructure::dispatcher::WorkerPoolDispatcher;
use crate::infrastructure::message::InboundMessage;
use crate::infrastructure::metrics::PipelineMetrics;
use crate::infrastructure::storage::DeltaWriter;

/// Maps a consumed batch into per-key deltas, applies them through the
/// dispatcher and reports which messages may be acknowledged.
pub struct BatchProcessor<M: DeltaMapping> {
    mapper: BatchMapper<M>,
    dispatcher: WorkerPoolDispatcher,
    writer: Arc<dyn DeltaWriter<M::Key, M::Delta>>,
    metrics: Arc<PipelineMetrics>,
}

impl<M: DeltaMapping> BatchProcessor<M> {
    pub fn new(
        mapping: Arc<M>,
        dispatcher: WorkerPoolDispatcher,
        writer: Arc<dyn DeltaWriter<M::Key, M::Delta>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            mapper: BatchMapper::new(mapping, metrics.clone()),
            dispatcher,
            writer,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        self.mapper.mapping().name()
    }

    /// Returns the messages that are safe to acknowledge: those needing no
    /// write plus those whose delta committed.
    pub async fn process(&self, batch: Vec<InboundMessage>) -> Vec<InboundMessage> {
        if batch.is_empty() {
            return Vec::new();
        }

        let received = batch.len();
        let span = info_span!("process_batch", stream = self.name(), messages = received);
        async move {
            let started = Instant::now();
            PipelineMetrics::incr(&self.metrics.messages_consumed, received as u64);

            let mapped = self.mapper.map(batch);
            let deltas = mapped.deltas.len();
            let mut ackable = mapped.resolved;

            let committed = self
                .dispatcher
                .dispatch(mapped.deltas, self.writer.clone())
                .await;
            ackable.extend(committed);

            PipelineMetrics::incr(&self.metrics.batches_processed, 1);
            PipelineMetrics::incr(&self.metrics.messages_acked, ackable.len() as u64);
            info!(
                deltas,
                acked = ackable.len(),
                withheld = received - ackable.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Batch processed"
            );
            ackable
        }
        .instrument(span)
        .await
    }
}
