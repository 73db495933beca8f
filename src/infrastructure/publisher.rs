use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::infrastructure::codec::Encoding;
use crate::infrastructure::error::{BrokerError, PublishErrors};

/// A domain value that can be queued in a notifier and sent to the broker.
pub trait OutboundEvent: Serialize + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;
}

/// One publishable record: the encoded latest state of an entity under its
/// publish key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub topic: String,
    pub key: String,
    pub event_type: String,
    pub encoding: Encoding,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn encode<E: OutboundEvent>(
        topic: &str,
        key: String,
        event: &E,
        encoding: Encoding,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            topic: topic.to_string(),
            key,
            event_type: event.event_type().to_string(),
            encoding,
            payload: encoding.encode(event)?,
            created_at: Utc::now(),
        })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publishes the whole batch. Any returned error marks the batch as failed;
    /// the caller retries every record of it.
    async fn publish(&self, batch_id: Uuid, records: &[EventRecord]) -> Result<(), PublishErrors>;
}

/// Test publisher that keeps every batch in memory and never frees it.
/// `fail_next` makes the following publish calls fail.
#[derive(Default)]
pub struct InMemoryPublisher {
    batches: Mutex<Vec<Vec<EventRecord>>>,
    failures_remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: usize) {
        self.failures_remaining.store(calls, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<EventRecord>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn published(&self) -> Vec<EventRecord> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl BrokerPublisher for InMemoryPublisher {
    async fn publish(&self, batch_id: Uuid, records: &[EventRecord]) -> Result<(), PublishErrors> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(PublishErrors::single(
                batch_id,
                BrokerError::ConnectionError("injected failure".to_string()),
            ));
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(records.to_vec());
        Ok(())
    }
}
