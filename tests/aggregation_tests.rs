use async_trait::async_trait;
use coalesce_relay::infrastructure::aggregator::{AggregationMode, KeyedAggregator};
use coalesce_relay::infrastructure::error::{BrokerError, PublishErrors};
use coalesce_relay::infrastructure::metrics::PipelineMetrics;
use coalesce_relay::infrastructure::notifier::{Notifier, NotifierConfig};
use coalesce_relay::infrastructure::publisher::{
    BrokerPublisher, EventRecord, InMemoryPublisher, OutboundEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Likes {
    post: String,
    count: i64,
}

impl OutboundEvent for Likes {
    fn event_type(&self) -> &'static str {
        "likes_changed"
    }
}

fn likes(post: &str, count: i64) -> Likes {
    Likes {
        post: post.to_string(),
        count,
    }
}

fn notifier(
    mode: AggregationMode,
    publisher: Arc<InMemoryPublisher>,
    metrics: Arc<PipelineMetrics>,
) -> Notifier<String, Likes> {
    Notifier::new("likes", NotifierConfig::new("likes", mode), publisher, metrics)
        .expect("valid config")
}

fn decoded(records: &[EventRecord]) -> HashMap<String, i64> {
    records
        .iter()
        .map(|r| {
            let event: Likes = serde_json::from_slice(&r.payload).unwrap();
            (r.key.clone(), event.count)
        })
        .collect()
}

#[tokio::test]
async fn coalesced_flush_publishes_latest_value_per_key() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let notifier = notifier(
        AggregationMode::Coalesce,
        publisher.clone(),
        Arc::new(PipelineMetrics::default()),
    );

    notifier.enqueue("a".to_string(), likes("a", 1));
    notifier.enqueue("a".to_string(), likes("a", 2));
    notifier.enqueue("b".to_string(), likes("b", 5));

    assert_eq!(notifier.flush().await.unwrap(), 2);
    let batches = publisher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        decoded(&batches[0]),
        HashMap::from([("a".to_string(), 2), ("b".to_string(), 5)])
    );
    assert!(batches[0].iter().all(|r| r.event_type == "likes_changed"));
}

#[tokio::test]
async fn failed_publish_is_retried_with_newer_values_winning() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let metrics = Arc::new(PipelineMetrics::default());
    let notifier = notifier(AggregationMode::Coalesce, publisher.clone(), metrics.clone());

    notifier.enqueue("A".to_string(), likes("A", 1));
    notifier.enqueue("B".to_string(), likes("B", 2));
    publisher.fail_next(1);

    let err = notifier.flush().await.unwrap_err();
    assert_eq!(err.len(), 1);
    assert_eq!(notifier.pending(), 2);

    notifier.enqueue("A".to_string(), likes("A", 3));
    assert_eq!(notifier.flush().await.unwrap(), 2);

    let published = publisher.published();
    assert_eq!(published.len(), 2);
    assert_eq!(
        decoded(&published),
        HashMap::from([("A".to_string(), 3), ("B".to_string(), 2)])
    );
    assert_eq!(metrics.publish_failures.load(Ordering::Relaxed), 1);
    assert_eq!(notifier.pending(), 0);
}

/// Holds the first publish call until released, then fails it when
/// `fail_first` is set. Later calls succeed immediately.
struct GatedPublisher {
    calls: AtomicUsize,
    entered: Notify,
    release: Notify,
    fail_first: bool,
    batches: Mutex<Vec<Vec<EventRecord>>>,
}

impl GatedPublisher {
    fn new(fail_first: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
            fail_first,
            batches: Mutex::new(Vec::new()),
        })
    }

    fn published(&self) -> Vec<EventRecord> {
        self.batches.lock().unwrap().concat()
    }

    fn counts_for(&self, key: &str) -> Vec<i64> {
        self.published()
            .iter()
            .filter(|r| r.key == key)
            .map(|r| serde_json::from_slice::<Likes>(&r.payload).unwrap().count)
            .collect()
    }
}

#[async_trait]
impl BrokerPublisher for GatedPublisher {
    async fn publish(&self, batch_id: Uuid, records: &[EventRecord]) -> Result<(), PublishErrors> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
            if self.fail_first {
                return Err(PublishErrors::single(
                    batch_id,
                    BrokerError::ConnectionError("broker unavailable".to_string()),
                ));
            }
        }
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(())
    }
}

fn gated_notifier(publisher: Arc<GatedPublisher>) -> Arc<Notifier<String, Likes>> {
    Arc::new(
        Notifier::new(
            "likes",
            NotifierConfig::new("likes", AggregationMode::Coalesce),
            publisher,
            Arc::new(PipelineMetrics::default()),
        )
        .expect("valid config"),
    )
}

#[tokio::test]
async fn records_enqueued_during_failed_publish_are_retried_with_it() {
    let publisher = GatedPublisher::new(true);
    let notifier = gated_notifier(publisher.clone());

    notifier.enqueue("A".to_string(), likes("A", 1));
    notifier.enqueue("B".to_string(), likes("B", 2));
    let first = {
        let notifier = notifier.clone();
        tokio::spawn(async move { notifier.flush().await })
    };

    publisher.entered.notified().await;
    notifier.enqueue("A".to_string(), likes("A", 3));
    notifier.enqueue("C".to_string(), likes("C", 7));
    publisher.release.notify_one();

    assert!(first.await.unwrap().is_err());
    assert_eq!(notifier.pending(), 3);
    assert_eq!(notifier.flush().await.unwrap(), 3);
    assert_eq!(
        decoded(&publisher.published()),
        HashMap::from([
            ("A".to_string(), 3),
            ("B".to_string(), 2),
            ("C".to_string(), 7),
        ])
    );
    assert_eq!(notifier.pending(), 0);
}

#[tokio::test]
async fn records_enqueued_during_successful_publish_go_out_next_flush() {
    let publisher = GatedPublisher::new(false);
    let notifier = gated_notifier(publisher.clone());

    notifier.enqueue("A".to_string(), likes("A", 1));
    let first = {
        let notifier = notifier.clone();
        tokio::spawn(async move { notifier.flush().await })
    };

    publisher.entered.notified().await;
    notifier.enqueue("A".to_string(), likes("A", 2));
    notifier.enqueue("B".to_string(), likes("B", 5));
    publisher.release.notify_one();

    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert_eq!(notifier.flush().await.unwrap(), 2);
    assert_eq!(publisher.counts_for("A"), vec![1, 2]);
    assert_eq!(publisher.counts_for("B"), vec![5]);
}

#[tokio::test]
async fn overlapping_flush_never_resends_a_superseded_value() {
    let publisher = GatedPublisher::new(true);
    let notifier = gated_notifier(publisher.clone());

    notifier.enqueue("1".to_string(), likes("1", 1));
    let first = {
        let notifier = notifier.clone();
        tokio::spawn(async move { notifier.flush().await })
    };
    publisher.entered.notified().await;
    notifier.enqueue("1".to_string(), likes("1", 3));

    let second = {
        let notifier = notifier.clone();
        tokio::spawn(async move { notifier.flush().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    publisher.release.notify_one();

    assert!(first.await.unwrap().is_err());
    assert_eq!(second.await.unwrap().unwrap(), 1);
    notifier.flush().await.unwrap();

    assert_eq!(publisher.counts_for("1"), vec![3]);
    assert_eq!(notifier.pending(), 0);
}

#[tokio::test]
async fn preserve_all_delivers_every_record_in_order() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let notifier = notifier(
        AggregationMode::PreserveAll,
        publisher.clone(),
        Arc::new(PipelineMetrics::default()),
    );

    for count in 1..=3 {
        notifier.enqueue("a".to_string(), likes("a", count));
    }
    publisher.fail_next(1);
    assert!(notifier.flush().await.is_err());
    notifier.enqueue("a".to_string(), likes("a", 4));
    notifier.flush().await.unwrap();

    let counts: Vec<i64> = publisher
        .published()
        .iter()
        .map(|r| serde_json::from_slice::<Likes>(&r.payload).unwrap().count)
        .collect();
    assert_eq!(counts, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn empty_flush_does_not_reach_broker() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let metrics = Arc::new(PipelineMetrics::default());
    let notifier = notifier(AggregationMode::Coalesce, publisher.clone(), metrics.clone());

    assert_eq!(notifier.flush().await.unwrap(), 0);
    assert_eq!(notifier.flush().await.unwrap(), 0);
    assert_eq!(publisher.calls(), 0);
    assert_eq!(metrics.empty_flushes.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn scheduler_flushes_on_interval_and_close_flushes_rest() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let notifier = notifier(
        AggregationMode::Coalesce,
        publisher.clone(),
        Arc::new(PipelineMetrics::default()),
    );
    let shutdown = CancellationToken::new();
    notifier.start(&shutdown);
    assert!(notifier.is_running());

    notifier.enqueue("a".to_string(), likes("a", 1));
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(publisher.published().len(), 1);

    notifier.enqueue("b".to_string(), likes("b", 1));
    notifier.close().await.unwrap();
    assert!(!notifier.is_running());
    assert_eq!(publisher.published().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_token_stops_periodic_flushes() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let notifier = notifier(
        AggregationMode::Coalesce,
        publisher.clone(),
        Arc::new(PipelineMetrics::default()),
    );
    let shutdown = CancellationToken::new();
    notifier.start(&shutdown);
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    notifier.enqueue("a".to_string(), likes("a", 1));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(publisher.calls(), 0);
    assert_eq!(notifier.pending(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_lose_nothing() {
    let publisher = Arc::new(InMemoryPublisher::new());
    let notifier = Arc::new(notifier(
        AggregationMode::Coalesce,
        publisher.clone(),
        Arc::new(PipelineMetrics::default()),
    ));

    let mut producers = Vec::new();
    for worker in 0..8 {
        let notifier = notifier.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..100 {
                let key = format!("{}-{}", worker, i);
                notifier.enqueue(key.clone(), likes(&key, i));
            }
        }));
    }
    let flusher = {
        let notifier = notifier.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                notifier.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    for producer in producers {
        producer.await.unwrap();
    }
    flusher.await.unwrap();
    notifier.flush().await.unwrap();

    let keys = decoded(&publisher.published());
    assert_eq!(keys.len(), 800);
    assert_eq!(notifier.pending(), 0);
}

#[test]
fn aggregator_snapshot_is_detached_from_live_buffer() {
    let aggregator = KeyedAggregator::new(AggregationMode::Coalesce);
    aggregator.enqueue(1, "one");
    let snapshot = aggregator.drain_and_reset().unwrap();
    aggregator.enqueue(2, "two");

    assert_eq!(snapshot.len(), 1);
    assert_eq!(aggregator.len(), 1);
    assert!(aggregator.drain_and_reset().is_some());
    assert!(aggregator.drain_and_reset().is_none());
}
