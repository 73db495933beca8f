use async_trait::async_trait;
use coalesce_relay::domain::{
    ChangeReason, ContentCommentsCount, ContentStatsChanged, CreatorStatus, CreatorStatusEvent,
    EntityKind, SetCounter, StatsDelta, StatusDelta,
};
use coalesce_relay::infrastructure::batch_processor::BatchProcessor;
use coalesce_relay::infrastructure::codec::Encoding;
use coalesce_relay::infrastructure::dispatcher::{DispatcherConfig, WorkerPoolDispatcher};
use coalesce_relay::infrastructure::error::StorageError;
use coalesce_relay::infrastructure::kafka_abstraction::OffsetPlan;
use coalesce_relay::infrastructure::message::InboundMessage;
use coalesce_relay::infrastructure::metrics::PipelineMetrics;
use coalesce_relay::infrastructure::storage::DeltaWriter;
use coalesce_relay::infrastructure::streams::{
    ContentCommentsCounterMapping, ContentStatsMapping, CreatorStatusMapping,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Records every write; keys listed in `failing` are rejected.
struct TableWriter<D> {
    rows: Mutex<HashMap<i64, D>>,
    writes: Mutex<Vec<i64>>,
    failing: Vec<i64>,
}

impl<D> TableWriter<D> {
    fn new(failing: Vec<i64>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            failing,
        })
    }
}

#[async_trait]
impl<D: Clone + Send + Sync> DeltaWriter<i64, D> for TableWriter<D> {
    async fn apply(&self, key: &i64, delta: &D) -> Result<(), StorageError> {
        self.writes.lock().unwrap().push(*key);
        if self.failing.contains(key) {
            return Err(StorageError::Rejected(format!("row {} locked", key)));
        }
        self.rows.lock().unwrap().insert(*key, delta.clone());
        Ok(())
    }
}

fn json<T: Serialize>(topic: &str, offset: i64, event: &T) -> InboundMessage {
    InboundMessage::new(topic, 0, offset, serde_json::to_vec(event).unwrap())
}

fn dispatcher(
    pool: usize,
    shutdown: CancellationToken,
    metrics: Arc<PipelineMetrics>,
) -> WorkerPoolDispatcher {
    WorkerPoolDispatcher::new(
        &DispatcherConfig {
            worker_pool_size: pool,
        },
        shutdown,
        metrics,
    )
    .unwrap()
}

fn offsets(messages: &[InboundMessage]) -> Vec<i64> {
    let mut offsets: Vec<i64> = messages.iter().map(|m| m.offset).collect();
    offsets.sort_unstable();
    offsets
}

#[tokio::test]
async fn counters_coalesce_to_one_write_per_key() {
    let metrics = Arc::new(PipelineMetrics::default());
    let writer = TableWriter::<SetCounter>::new(vec![]);
    let processor = BatchProcessor::new(
        Arc::new(ContentCommentsCounterMapping::default()),
        dispatcher(4, CancellationToken::new(), metrics.clone()),
        writer.clone(),
        metrics.clone(),
    );

    let batch: Vec<InboundMessage> = (0..10)
        .map(|i| {
            json(
                "content-comments-count",
                i,
                &ContentCommentsCount {
                    content_id: i % 2,
                    comments_count: i,
                },
            )
        })
        .collect();
    let acked = processor.process(batch).await;

    assert_eq!(acked.len(), 10);
    assert_eq!(writer.writes.lock().unwrap().len(), 2);
    let rows = writer.rows.lock().unwrap();
    assert_eq!(rows.get(&0), Some(&SetCounter { value: 8 }));
    assert_eq!(rows.get(&1), Some(&SetCounter { value: 9 }));
    assert_eq!(metrics.deltas_committed.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn failing_key_does_not_block_other_keys() {
    let metrics = Arc::new(PipelineMetrics::default());
    let writer = TableWriter::<SetCounter>::new(vec![3]);
    let processor = BatchProcessor::new(
        Arc::new(ContentCommentsCounterMapping::default()),
        dispatcher(2, CancellationToken::new(), metrics.clone()),
        writer.clone(),
        metrics.clone(),
    );

    let batch = vec![
        json("c", 0, &ContentCommentsCount { content_id: 3, comments_count: 1 }),
        json("c", 1, &ContentCommentsCount { content_id: 4, comments_count: 1 }),
        json("c", 2, &ContentCommentsCount { content_id: 3, comments_count: 2 }),
        json("c", 3, &ContentCommentsCount { content_id: 5, comments_count: 7 }),
    ];
    let acked = processor.process(batch).await;

    assert_eq!(offsets(&acked), vec![1, 3]);
    assert_eq!(metrics.deltas_failed.load(Ordering::Relaxed), 1);

    let plan = OffsetPlan::build(
        &[
            ("c".to_string(), 0, 0),
            ("c".to_string(), 0, 1),
            ("c".to_string(), 0, 2),
            ("c".to_string(), 0, 3),
        ],
        &acked,
    );
    assert!(plan.commit.is_empty());
    assert_eq!(plan.rewind.get(&("c".to_string(), 0)), Some(&0));
}

#[tokio::test]
async fn undecodable_and_filtered_messages_are_acked_without_writes() {
    let metrics = Arc::new(PipelineMetrics::default());
    let writer = TableWriter::<StatusDelta>::new(vec![]);
    let processor = BatchProcessor::new(
        Arc::new(CreatorStatusMapping::default()),
        dispatcher(2, CancellationToken::new(), metrics.clone()),
        writer.clone(),
        metrics.clone(),
    );

    let update = CreatorStatusEvent {
        creator_id: 42,
        entity: EntityKind::Creator,
        status: CreatorStatus::Suspended,
        reason: ChangeReason::Updated,
    };
    let batch = vec![
        InboundMessage::new("creator-status", 0, 0, b"not json".to_vec()),
        InboundMessage::new("creator-status", 0, 1, Vec::new()),
        json(
            "creator-status",
            2,
            &CreatorStatusEvent {
                reason: ChangeReason::Created,
                ..update
            },
        ),
        json(
            "creator-status",
            3,
            &CreatorStatusEvent {
                entity: EntityKind::User,
                ..update
            },
        ),
        json("creator-status", 4, &update),
    ];
    let acked = processor.process(batch).await;

    assert_eq!(offsets(&acked), vec![0, 1, 2, 3, 4]);
    assert_eq!(*writer.writes.lock().unwrap(), vec![42]);
    assert_eq!(
        writer.rows.lock().unwrap().get(&42),
        Some(&StatusDelta {
            status: CreatorStatus::Suspended
        })
    );
    assert_eq!(metrics.decode_failures.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.messages_filtered.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn stats_fields_merge_across_events() {
    let metrics = Arc::new(PipelineMetrics::default());
    let writer = TableWriter::<StatsDelta>::new(vec![]);
    let processor = BatchProcessor::new(
        Arc::new(ContentStatsMapping::default()),
        dispatcher(2, CancellationToken::new(), metrics.clone()),
        writer.clone(),
        metrics,
    );

    let batch = vec![
        json(
            "content-stats",
            0,
            &ContentStatsChanged {
                content_id: 1,
                likes: Some(10),
                shares: Some(2),
                ..Default::default()
            },
        ),
        json(
            "content-stats",
            1,
            &ContentStatsChanged {
                content_id: 1,
                likes: Some(11),
                listens: Some(300),
                ..Default::default()
            },
        ),
    ];
    processor.process(batch).await;

    assert_eq!(
        writer.rows.lock().unwrap().get(&1),
        Some(&StatsDelta {
            likes: Some(11),
            dislikes: None,
            shares: Some(2),
            listens: Some(300),
        })
    );
}

#[tokio::test]
async fn bincode_streams_decode_with_matching_encoding() {
    let metrics = Arc::new(PipelineMetrics::default());
    let writer = TableWriter::<SetCounter>::new(vec![]);
    let processor = BatchProcessor::new(
        Arc::new(ContentCommentsCounterMapping {
            encoding: Encoding::Bincode,
        }),
        dispatcher(1, CancellationToken::new(), metrics.clone()),
        writer.clone(),
        metrics,
    );

    let payload = Encoding::Bincode
        .encode(&ContentCommentsCount {
            content_id: 8,
            comments_count: 13,
        })
        .unwrap();
    let acked = processor
        .process(vec![InboundMessage::new("c", 0, 0, payload)])
        .await;

    assert_eq!(acked.len(), 1);
    assert_eq!(
        writer.rows.lock().unwrap().get(&8),
        Some(&SetCounter { value: 13 })
    );
}

/// Blocks every write until released, so shutdown can land mid-batch.
struct GatedWriter {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl DeltaWriter<i64, SetCounter> for GatedWriter {
    async fn apply(&self, _key: &i64, _delta: &SetCounter) -> Result<(), StorageError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_lets_running_writes_finish_and_skips_the_rest() {
    let metrics = Arc::new(PipelineMetrics::default());
    let shutdown = CancellationToken::new();
    let writer = Arc::new(GatedWriter {
        started: Notify::new(),
        release: Notify::new(),
    });
    let processor = Arc::new(BatchProcessor::new(
        Arc::new(ContentCommentsCounterMapping::default()),
        dispatcher(1, shutdown.clone(), metrics.clone()),
        writer.clone(),
        metrics.clone(),
    ));

    let batch: Vec<InboundMessage> = (0..3)
        .map(|i| json("c", i, &ContentCommentsCount { content_id: i, comments_count: 1 }))
        .collect();
    let running = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process(batch).await })
    };

    writer.started.notified().await;
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    writer.release.notify_one();

    let acked = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("batch settles after shutdown")
        .unwrap();
    assert_eq!(acked.len(), 1);
    assert_eq!(metrics.deltas_committed.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.deltas_skipped.load(Ordering::Relaxed), 2);
}
