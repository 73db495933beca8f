use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// A single failure reported by the broker for one record of a batch.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Producer error for key '{key}': {reason}")]
    ProducerError { key: String, reason: String },
    #[error("Timeout error after {0:?}")]
    TimeoutError(Duration),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(error: rdkafka::error::KafkaError) -> Self {
        match error {
            rdkafka::error::KafkaError::ClientCreation(e) => BrokerError::ConnectionError(e),
            rdkafka::error::KafkaError::MessageProduction(code) => BrokerError::ProducerError {
                key: String::new(),
                reason: code.to_string(),
            },
            other => BrokerError::Unknown(other.to_string()),
        }
    }
}

/// Every error collected while publishing one batch. Any error fails the
/// whole batch.
#[derive(Debug, Clone, Error)]
#[error("publish of batch {batch_id} failed with {} error(s)", errors.len())]
pub struct PublishErrors {
    pub batch_id: Uuid,
    pub errors: Vec<BrokerError>,
}

impl PublishErrors {
    pub fn new(batch_id: Uuid, errors: Vec<BrokerError>) -> Self {
        Self { batch_id, errors }
    }

    pub fn single(batch_id: Uuid, error: BrokerError) -> Self {
        Self::new(batch_id, vec![error])
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message has no payload")]
    EmptyPayload,
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode decode error: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("delta for key {0} has nothing to write")]
    EmptyDelta(String),
    #[error("Storage rejected write: {0}")]
    Rejected(String),
}

/// Programming or deployment mistakes caught at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("worker pool size must be greater than zero")]
    ZeroWorkerPool,
    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,
    #[error("consumer batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("topic for '{0}' must not be empty")]
    EmptyTopic(String),
    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },
}
