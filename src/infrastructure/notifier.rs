use async_trait::async_trait;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::infrastructure::aggregator::{AggregationMode, KeyedAggregator, Snapshot};
use crate::infrastructure::codec::Encoding;
use crate::infrastructure::error::{ConfigError, PublishErrors};
use crate::infrastructure::flush_scheduler::{FlushScheduler, Flushable};
use crate::infrastructure::metrics::PipelineMetrics;
use crate::infrastructure::publisher::{BrokerPublisher, EventRecord, OutboundEvent};
use crate::infrastructure::shutdown::Shutdown;

#[derive(Clone, Debug)]
pub struct NotifierConfig {
    pub topic: String,
    pub flush_interval: Duration,
    pub mode: AggregationMode,
    pub encoding: Encoding,
}

impl NotifierConfig {
    pub fn new(topic: impl Into<String>, mode: AggregationMode) -> Self {
        Self {
            topic: topic.into(),
            mode,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic("notifier".to_string()));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        Ok(())
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            flush_interval: Duration::from_secs(1),
            mode: AggregationMode::Coalesce,
            encoding: Encoding::Json,
        }
    }
}

/// Aggregator plus publisher; what the flush loop drives.
struct NotifierCore<K, R> {
    name: String,
    topic: String,
    encoding: Encoding,
    aggregator: KeyedAggregator<K, R>,
    publisher: Arc<dyn BrokerPublisher>,
    metrics: Arc<PipelineMetrics>,
    /// Held from drain to merge-back; flush cycles never interleave.
    in_flight: tokio::sync::Mutex<()>,
}

impl<K, R> NotifierCore<K, R>
where
    K: Eq + Hash + Display + Send + Sync + 'static,
    R: OutboundEvent,
{
    fn encode_snapshot(&self, snapshot: &Snapshot<K, R>) -> Vec<EventRecord> {
        let mut records = Vec::with_capacity(snapshot.len());
        for (key, event) in snapshot.iter() {
            match EventRecord::encode(&self.topic, key.to_string(), event, self.encoding) {
                Ok(record) => records.push(record),
                Err(e) => {
                    PipelineMetrics::incr(&self.metrics.encode_failures, 1);
                    error!(notifier = %self.name, key = %key, "Skipping record that cannot be encoded: {}", e);
                }
            }
        }
        records
    }

    async fn flush_once(&self) -> Result<usize, PublishErrors> {
        let _in_flight = self.in_flight.lock().await;
        PipelineMetrics::incr(&self.metrics.flushes, 1);

        let Some(snapshot) = self.aggregator.drain_and_reset() else {
            PipelineMetrics::incr(&self.metrics.empty_flushes, 1);
            return Ok(0);
        };

        let batch_id = Uuid::new_v4();
        let span = info_span!("flush", notifier = %self.name, %batch_id, records = snapshot.len());
        async move {
            let records = self.encode_snapshot(&snapshot);
            if records.is_empty() {
                return Ok(0);
            }

            let started = Instant::now();
            let result = self.publisher.publish(batch_id, &records).await;
            self.metrics.record_publish_latency(started.elapsed());

            match result {
                Ok(()) => {
                    PipelineMetrics::incr(&self.metrics.records_published, records.len() as u64);
                    debug!("Published {} records to {}", records.len(), self.topic);
                    Ok(records.len())
                }
                Err(errors) => {
                    let restored = self.aggregator.merge_back(snapshot);
                    PipelineMetrics::incr(&self.metrics.publish_failures, 1);
                    PipelineMetrics::incr(&self.metrics.records_merged_back, restored as u64);
                    for e in &errors.errors {
                        warn!("Broker error: {}", e);
                    }
                    warn!(
                        "Publish failed, {} of {} records merged back for retry",
                        restored,
                        records.len()
                    );
                    Err(errors)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl<K, R> Flushable for NotifierCore<K, R>
where
    K: Eq + Hash + Display + Send + Sync + 'static,
    R: OutboundEvent,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn flush(&self) -> Result<usize, PublishErrors> {
        self.flush_once().await
    }
}

/// Buffers entity changes and delivers them to the broker in batches.
///
/// `enqueue` is fire-and-forget: publish failures are retried on the next
/// flush and never reach the caller. Records are lost only if the process
/// dies between draining a batch and either publishing it or merging it back.
pub struct Notifier<K, R> {
    core: Arc<NotifierCore<K, R>>,
    flush_interval: Duration,
    scheduler: Mutex<Option<FlushScheduler>>,
    closed: AtomicBool,
}

impl<K, R> Notifier<K, R>
where
    K: Eq + Hash + Display + Send + Sync + 'static,
    R: OutboundEvent,
{
    pub fn new(
        name: impl Into<String>,
        config: NotifierConfig,
        publisher: Arc<dyn BrokerPublisher>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(NotifierCore {
                name: name.into(),
                topic: config.topic,
                encoding: config.encoding,
                aggregator: KeyedAggregator::new(config.mode),
                publisher,
                metrics,
                in_flight: tokio::sync::Mutex::new(()),
            }),
            flush_interval: config.flush_interval,
            scheduler: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Starts the periodic flush loop. Calling it twice is a no-op.
    pub fn start(&self, shutdown: &CancellationToken) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if scheduler.is_some() {
            return;
        }
        let target: Arc<dyn Flushable> = self.core.clone();
        *scheduler = Some(FlushScheduler::spawn(target, self.flush_interval, shutdown));
        info!(notifier = %self.core.name, topic = %self.core.topic, "Notifier started");
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn enqueue(&self, key: K, record: R) {
        if self.closed.load(Ordering::Acquire) {
            debug!(notifier = %self.core.name, key = %key, "Enqueue after close; record waits for an explicit flush");
        }
        self.core.aggregator.enqueue(key, record);
        PipelineMetrics::incr(&self.core.metrics.records_enqueued, 1);
    }

    /// Delivers everything pending now. On failure the records stay queued.
    pub async fn flush(&self) -> Result<usize, PublishErrors> {
        self.core.flush_once().await
    }

    /// Stops the flush loop and makes one last delivery attempt.
    pub async fn close(&self) -> Result<usize, PublishErrors> {
        self.closed.store(true, Ordering::Release);
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        let result = self.core.flush_once().await;
        match &result {
            Ok(published) => info!(notifier = %self.core.name, published, "Notifier closed"),
            Err(e) => error!(
                notifier = %self.core.name,
                pending = self.pending(),
                "Final flush on close failed: {}", e
            ),
        }
        result
    }

    pub fn pending(&self) -> usize {
        self.core.aggregator.len()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(FlushScheduler::is_running)
            .unwrap_or(false)
    }
}

#[async_trait]
impl<K, R> Shutdown for Notifier<K, R>
where
    K: Eq + Hash + Display + Send + Sync + 'static,
    R: OutboundEvent,
{
    fn component(&self) -> &str {
        self.name()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.close().await?;
        Ok(())
    }
}
