use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use coalesce_relay::config::AppConfig;
use coalesce_relay::infrastructure::batch_mapper::DeltaMapping;
use coalesce_relay::infrastructure::batch_processor::BatchProcessor;
use coalesce_relay::infrastructure::dispatcher::WorkerPoolDispatcher;
use coalesce_relay::infrastructure::kafka_abstraction::{KafkaBatchListener, ListenerTask};
use coalesce_relay::infrastructure::logging::{init_logging, run_log_cleanup};
use coalesce_relay::infrastructure::metrics::{run_metrics_reporter, PipelineMetrics};
use coalesce_relay::infrastructure::shutdown::ShutdownManager;
use coalesce_relay::infrastructure::storage::{
    DeltaWriter, PgCounterWriter, PgCreatorStatusWriter, PgStatsWriter,
};
use coalesce_relay::infrastructure::streams::{
    topic_name, ContentCommentsCounterMapping, ContentStatsMapping, CreatorStatusMapping,
    UserCommentsCounterMapping, CONTENT_COMMENTS_COUNT_TOPIC, CONTENT_STATS_TOPIC,
    CREATOR_STATUS_TOPIC, USER_COMMENTS_COUNT_TOPIC,
};

struct Runtime {
    config: AppConfig,
    dispatcher: WorkerPoolDispatcher,
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownManager,
}

impl Runtime {
    fn start_listener<M: DeltaMapping>(
        &self,
        topic: &str,
        mapping: M,
        writer: Arc<dyn DeltaWriter<M::Key, M::Delta>>,
    ) -> anyhow::Result<()> {
        let topic = topic_name(&self.config.kafka.topic_prefix, topic);
        let processor = Arc::new(BatchProcessor::new(
            Arc::new(mapping),
            self.dispatcher.clone(),
            writer,
            self.metrics.clone(),
        ));
        let name = format!("listener:{}", processor.name());
        let listener =
            KafkaBatchListener::new(&self.config.kafka, &topic, processor, self.shutdown.token())
                .with_context(|| format!("failed to create consumer for {}", topic))?;
        self.shutdown
            .register(Arc::new(ListenerTask::new(name, listener.spawn())));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let _guards = init_logging(&config.logging)?;
    info!("Starting coalesce-relay");

    if !config.kafka.enabled {
        warn!("Kafka disabled, no streams to consume");
        return Ok(());
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout)
        .connect(&config.database.url)
        .await
        .context("failed to connect to Postgres")?;
    let pool = Arc::new(pool);

    let metrics = Arc::new(PipelineMetrics::default());
    let shutdown = ShutdownManager::new();
    let dispatcher =
        WorkerPoolDispatcher::new(&config.dispatcher, shutdown.token(), metrics.clone())?;
    info!(
        worker_pool_size = dispatcher.pool_size(),
        batch_size = config.kafka.consumer_batch_size,
        "Dispatcher ready"
    );

    let runtime = Runtime {
        config,
        dispatcher,
        metrics,
        shutdown,
    };
    let encoding = runtime.config.notifier.encoding;

    runtime.start_listener(
        CONTENT_COMMENTS_COUNT_TOPIC,
        ContentCommentsCounterMapping { encoding },
        Arc::new(PgCounterWriter::new(
            pool.clone(),
            "contents",
            "id",
            "comments_count",
        )),
    )?;
    runtime.start_listener(
        USER_COMMENTS_COUNT_TOPIC,
        UserCommentsCounterMapping { encoding },
        Arc::new(PgCounterWriter::new(
            pool.clone(),
            "users",
            "id",
            "comments_count",
        )),
    )?;
    runtime.start_listener(
        CONTENT_STATS_TOPIC,
        ContentStatsMapping { encoding },
        Arc::new(PgStatsWriter::new(pool.clone(), "contents", "id")),
    )?;
    runtime.start_listener(
        CREATOR_STATUS_TOPIC,
        CreatorStatusMapping { encoding },
        Arc::new(PgCreatorStatusWriter::new(pool.clone())),
    )?;

    let reporter = tokio::spawn(run_metrics_reporter(
        runtime.metrics.clone(),
        Duration::from_secs(60),
        runtime.shutdown.token(),
    ));
    if runtime.config.logging.enable_file {
        tokio::spawn(run_log_cleanup(
            runtime.config.logging.clone(),
            Duration::from_secs(3600),
            runtime.shutdown.token(),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Ctrl-C received, shutting down");

    if let Err(e) = runtime.shutdown.shutdown().await {
        error!("Shutdown finished with errors: {}", e);
    }
    reporter.await.ok();
    pool.close().await;
    info!("coalesce-relay stopped");
    Ok(())
}
