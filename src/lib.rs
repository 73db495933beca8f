pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::AppConfig;
pub use infrastructure::{
    AggregationMode, BatchProcessor, BrokerPublisher, DeltaMapping, DeltaWriter, InMemoryPublisher,
    KeyedAggregator, Notifier, NotifierConfig, PipelineMetrics, ShutdownManager,
    WorkerPoolDispatcher,
};
