use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::{
    client::ClientContext,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
    Offset, TopicPartitionList,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{env_millis, env_or};
use crate::infrastructure::batch_mapper::DeltaMapping;
use crate::infrastructure::batch_processor::BatchProcessor;
use crate::infrastructure::error::{BrokerError, ConfigError, PublishErrors};
use crate::infrastructure::message::InboundMessage;
use crate::infrastructure::publisher::{BrokerPublisher, EventRecord};
use crate::infrastructure::shutdown::Shutdown;

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub enabled: bool,
    pub bootstrap_servers: String,
    pub group_id: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub producer_acks: String,
    pub producer_retries: i32,
    pub message_timeout: Duration,
    pub consumer_batch_size: usize,
    pub consumer_batch_wait: Duration,
    pub consumer_max_poll_interval_ms: i32,
    pub consumer_session_timeout_ms: i32,
    pub auto_offset_reset: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "coalesce-relay".to_string(),
            client_id: "coalesce-relay".to_string(),
            topic_prefix: String::new(),
            producer_acks: "all".to_string(),
            producer_retries: 3,
            message_timeout: Duration::from_secs(5),
            consumer_batch_size: 500,
            consumer_batch_wait: Duration::from_millis(200),
            consumer_max_poll_interval_ms: 300000,
            consumer_session_timeout_ms: 10000,
            auto_offset_reset: "earliest".to_string(),
        }
    }
}

impl KafkaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: env_or("KAFKA_ENABLED", defaults.enabled)?,
            bootstrap_servers: env_or("KAFKA_BOOTSTRAP_SERVERS", defaults.bootstrap_servers)?,
            group_id: env_or("KAFKA_GROUP_ID", defaults.group_id)?,
            client_id: env_or("KAFKA_CLIENT_ID", defaults.client_id)?,
            topic_prefix: env_or("KAFKA_TOPIC_PREFIX", defaults.topic_prefix)?,
            producer_acks: env_or("KAFKA_PRODUCER_ACKS", defaults.producer_acks)?,
            producer_retries: env_or("KAFKA_PRODUCER_RETRIES", defaults.producer_retries)?,
            message_timeout: env_millis("KAFKA_MESSAGE_TIMEOUT_MS", defaults.message_timeout)?,
            consumer_batch_size: env_or("KAFKA_CONSUMER_BATCH_SIZE", defaults.consumer_batch_size)?,
            consumer_batch_wait: env_millis(
                "KAFKA_CONSUMER_BATCH_WAIT_MS",
                defaults.consumer_batch_wait,
            )?,
            consumer_max_poll_interval_ms: env_or(
                "KAFKA_CONSUMER_MAX_POLL_INTERVAL_MS",
                defaults.consumer_max_poll_interval_ms,
            )?,
            consumer_session_timeout_ms: env_or(
                "KAFKA_CONSUMER_SESSION_TIMEOUT_MS",
                defaults.consumer_session_timeout_ms,
            )?,
            auto_offset_reset: env_or("KAFKA_AUTO_OFFSET_RESET", defaults.auto_offset_reset)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// Publishes notifier batches with one `FutureProducer`. All records of a
/// batch are in flight at once; every delivery failure is reported.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: Option<FutureProducer>,
    config: KafkaConfig,
}

impl KafkaPublisher {
    pub fn new(config: KafkaConfig) -> Result<Self, BrokerError> {
        if !config.enabled {
            info!("Kafka disabled, publisher will drop batches");
            return Ok(Self {
                producer: None,
                config,
            });
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("acks", &config.producer_acks)
            .set("retries", config.producer_retries.to_string())
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()?;

        Ok(Self {
            producer: Some(producer),
            config,
        })
    }
}

#[async_trait]
impl BrokerPublisher for KafkaPublisher {
    async fn publish(&self, batch_id: Uuid, records: &[EventRecord]) -> Result<(), PublishErrors> {
        let producer = match &self.producer {
            Some(producer) => producer,
            None => return Ok(()),
        };

        let batch_header = batch_id.to_string();
        let sends = records.iter().map(|record| {
            let headers = OwnedHeaders::new()
                .insert(Header {
                    key: "event_type",
                    value: Some(record.event_type.as_str()),
                })
                .insert(Header {
                    key: "batch_id",
                    value: Some(batch_header.as_str()),
                })
                .insert(Header {
                    key: "content_type",
                    value: Some(record.encoding.content_type()),
                });
            let future_record = FutureRecord::to(&record.topic)
                .key(record.key.as_str())
                .payload(record.payload.as_slice())
                .headers(headers);
            async move {
                producer
                    .send(future_record, Timeout::After(self.config.message_timeout))
                    .await
                    .map_err(|(e, _)| BrokerError::ProducerError {
                        key: record.key.clone(),
                        reason: e.to_string(),
                    })
            }
        });

        let errors: Vec<BrokerError> = join_all(sends)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if errors.is_empty() {
            debug!(batch_id = %batch_id, records = records.len(), "Batch delivered");
            Ok(())
        } else {
            Err(PublishErrors::new(batch_id, errors))
        }
    }
}

struct LoggingConsumerContext;

impl ClientContext for LoggingConsumerContext {}

impl ConsumerContext for LoggingConsumerContext {
    fn pre_rebalance(
        &self,
        _consumer: &rdkafka::consumer::BaseConsumer<Self>,
        rebalance: &Rebalance,
    ) {
        info!("Pre-rebalance: {:?}", rebalance);
    }

    fn post_rebalance(
        &self,
        _consumer: &rdkafka::consumer::BaseConsumer<Self>,
        rebalance: &Rebalance,
    ) {
        info!("Post-rebalance: {:?}", rebalance);
    }
}

type LoggingConsumer = StreamConsumer<LoggingConsumerContext>;

/// Where each partition stands after a batch: offsets to commit and offsets
/// to rewind to.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OffsetPlan {
    /// Next offset to consume, past the contiguous acked prefix.
    pub commit: BTreeMap<(String, i32), i64>,
    /// First offset that was not acked and must be delivered again.
    pub rewind: BTreeMap<(String, i32), i64>,
}

impl OffsetPlan {
    pub fn build(consumed: &[(String, i32, i64)], acked: &[InboundMessage]) -> Self {
        let mut by_partition: HashMap<(String, i32), Vec<i64>> = HashMap::new();
        for (topic, partition, offset) in consumed {
            by_partition
                .entry((topic.clone(), *partition))
                .or_default()
                .push(*offset);
        }
        let mut acked_by_partition: HashMap<(String, i32), HashSet<i64>> = HashMap::new();
        for message in acked {
            acked_by_partition
                .entry((message.topic.clone(), message.partition))
                .or_default()
                .insert(message.offset);
        }

        let mut plan = OffsetPlan::default();
        for (partition, mut offsets) in by_partition {
            offsets.sort_unstable();
            let done = acked_by_partition.remove(&partition).unwrap_or_default();
            let first_unacked = offsets.iter().copied().find(|offset| !done.contains(offset));

            match first_unacked {
                Some(offset) => {
                    if offset > offsets[0] {
                        plan.commit.insert(partition.clone(), offset);
                    }
                    plan.rewind.insert(partition, offset);
                }
                None => {
                    if let Some(last) = offsets.last() {
                        plan.commit.insert(partition, last + 1);
                    }
                }
            }
        }
        plan
    }
}

/// Consumes one topic in batches and settles each batch through a
/// `BatchProcessor`. Offsets only move past messages that were acked.
pub struct KafkaBatchListener<M: DeltaMapping> {
    consumer: Arc<LoggingConsumer>,
    topic: String,
    processor: Arc<BatchProcessor<M>>,
    batch_size: usize,
    batch_wait: Duration,
    shutdown: CancellationToken,
}

impl<M: DeltaMapping> KafkaBatchListener<M> {
    pub fn new(
        config: &KafkaConfig,
        topic: impl Into<String>,
        processor: Arc<BatchProcessor<M>>,
        shutdown: CancellationToken,
    ) -> Result<Self, BrokerError> {
        let topic = topic.into();
        info!(
            "Creating consumer for {} - bootstrap_servers: {}, group_id: {}, auto_offset_reset: {}",
            topic, config.bootstrap_servers, config.group_id, config.auto_offset_reset
        );

        let consumer: LoggingConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.partition.eof", "false")
            .set(
                "max.poll.interval.ms",
                config.consumer_max_poll_interval_ms.to_string(),
            )
            .set(
                "session.timeout.ms",
                config.consumer_session_timeout_ms.to_string(),
            )
            .create_with_context(LoggingConsumerContext)?;
        consumer.subscribe(&[topic.as_str()])?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic,
            processor,
            batch_size: config.consumer_batch_size,
            batch_wait: config.consumer_batch_wait,
            shutdown,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the shutdown token fires. A batch already collected is
    /// processed and settled before the loop exits.
    pub async fn run(self) {
        info!(topic = %self.topic, stream = self.processor.name(), "Batch listener started");
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                batch = self.collect_batch() => batch,
            };

            let batch = match batch {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => batch,
                Err(e) => {
                    error!(topic = %self.topic, "Failed to receive messages: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let consumed: Vec<(String, i32, i64)> = batch
                .iter()
                .map(|m| (m.topic.clone(), m.partition, m.offset))
                .collect();
            let acked = self.processor.process(batch).await;
            self.settle(OffsetPlan::build(&consumed, &acked));
        }
        info!(topic = %self.topic, "Batch listener stopped");
    }

    async fn collect_batch(&self) -> Result<Vec<InboundMessage>, BrokerError> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let deadline = Instant::now() + self.batch_wait;

        while batch.len() < self.batch_size {
            match timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.push(InboundMessage::from(&message.detach())),
                Ok(Err(e)) if batch.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    warn!(topic = %self.topic, "Receive error mid-batch, processing what arrived: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    fn settle(&self, plan: OffsetPlan) {
        if !plan.commit.is_empty() {
            let mut offsets = TopicPartitionList::new();
            for ((topic, partition), next) in &plan.commit {
                if let Err(e) =
                    offsets.add_partition_offset(topic, *partition, Offset::Offset(*next))
                {
                    error!(topic = %topic, partition, "Invalid commit offset {}: {}", next, e);
                }
            }
            if let Err(e) = self.consumer.commit(&offsets, CommitMode::Async) {
                error!(topic = %self.topic, "Failed to commit offsets: {}", e);
            }
        }

        for ((topic, partition), offset) in &plan.rewind {
            warn!(
                topic = %topic,
                partition,
                offset,
                "Rewinding to first unacknowledged message"
            );
            if let Err(e) = self.consumer.seek(
                topic,
                *partition,
                Offset::Offset(*offset),
                Duration::from_secs(5),
            ) {
                error!(topic = %topic, partition, "Failed to seek to {}: {}", offset, e);
            }
        }
    }
}

/// A running listener as a shutdown component. Closing waits for the batch
/// in hand to settle.
pub struct ListenerTask {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerTask {
    pub fn new(name: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl Shutdown for ListenerTask {
    fn component(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumed(partition: i32, offsets: std::ops::Range<i64>) -> Vec<(String, i32, i64)> {
        offsets.map(|o| ("t".to_string(), partition, o)).collect()
    }

    fn acked(partition: i32, offsets: &[i64]) -> Vec<InboundMessage> {
        offsets
            .iter()
            .map(|o| InboundMessage::new("t", partition, *o, Vec::new()))
            .collect()
    }

    #[test]
    fn test_fully_acked_partition_commits_past_last() {
        let plan = OffsetPlan::build(&consumed(0, 10..15), &acked(0, &[10, 11, 12, 13, 14]));
        assert_eq!(plan.commit.get(&("t".to_string(), 0)), Some(&15));
        assert!(plan.rewind.is_empty());
    }

    #[test]
    fn test_gap_commits_prefix_and_rewinds() {
        let plan = OffsetPlan::build(&consumed(0, 10..15), &acked(0, &[10, 11, 13, 14]));
        assert_eq!(plan.commit.get(&("t".to_string(), 0)), Some(&12));
        assert_eq!(plan.rewind.get(&("t".to_string(), 0)), Some(&12));
    }

    #[test]
    fn test_partitions_are_settled_independently() {
        let mut all = consumed(0, 0..3);
        all.extend(consumed(1, 0..3));
        let mut ok = acked(0, &[0, 1, 2]);
        ok.extend(acked(1, &[1, 2]));

        let plan = OffsetPlan::build(&all, &ok);
        assert_eq!(plan.commit.get(&("t".to_string(), 0)), Some(&3));
        assert_eq!(plan.commit.get(&("t".to_string(), 1)), None);
        assert_eq!(plan.rewind.get(&("t".to_string(), 1)), Some(&0));
    }

    #[tokio::test]
    async fn test_listener_task_waits_for_loop() {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move { child.cancelled().await });
        let task = ListenerTask::new("listener", handle);

        token.cancel();
        task.shutdown().await.unwrap();
        // Second close is a no-op.
        task.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_publisher_is_noop() {
        let publisher = KafkaPublisher::new(KafkaConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        assert!(publisher.publish(Uuid::new_v4(), &[]).await.is_ok());
    }
}
