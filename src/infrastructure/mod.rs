pub mod aggregator;
pub mod batch_mapper;
pub mod batch_processor;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod flush_scheduler;
pub mod kafka_abstraction;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod notifier;
pub mod publisher;
pub mod shutdown;
pub mod storage;
pub mod streams;

pub use aggregator::{AggregationMode, KeyedAggregator, Snapshot};
pub use batch_mapper::{BatchMapper, DeltaGroup, DeltaMapping, MappedBatch};
pub use batch_processor::BatchProcessor;
pub use codec::Encoding;
pub use dispatcher::{DispatcherConfig, WorkerPoolDispatcher};
pub use error::{BrokerError, ConfigError, DecodeError, PublishErrors, StorageError};
pub use flush_scheduler::{FlushScheduler, Flushable};
pub use kafka_abstraction::{KafkaBatchListener, KafkaConfig, KafkaPublisher, ListenerTask};
pub use message::InboundMessage;
pub use metrics::PipelineMetrics;
pub use notifier::{Notifier, NotifierConfig};
pub use publisher::{BrokerPublisher, EventRecord, InMemoryPublisher, OutboundEvent};
pub use shutdown::{Shutdown, ShutdownManager};
pub use storage::DeltaWriter;
