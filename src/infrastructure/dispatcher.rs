use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::infrastructure::batch_mapper::DeltaGroup;
use crate::infrastructure::error::ConfigError;
use crate::infrastructure::message::InboundMessage;
use crate::infrastructure::metrics::PipelineMetrics;
use crate::infrastructure::storage::DeltaWriter;

#[derive(Clone, Debug, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of concurrent storage writes per batch.
    pub worker_pool_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: num_cpus::get() * 4,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::ZeroWorkerPool);
        }
        Ok(())
    }
}

/// Applies delta groups to storage with bounded concurrency. A failed write
/// only withholds the acknowledgment of its own messages.
#[derive(Clone)]
pub struct WorkerPoolDispatcher {
    pool_size: usize,
    shutdown: CancellationToken,
    metrics: Arc<PipelineMetrics>,
}

impl WorkerPoolDispatcher {
    pub fn new(
        config: &DispatcherConfig,
        shutdown: CancellationToken,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pool_size: config.worker_pool_size,
            shutdown,
            metrics,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Starts a dispatch round writing through `writer`.
    pub fn begin<K, D>(&self, writer: Arc<dyn DeltaWriter<K, D>>) -> Dispatch<K, D>
    where
        K: Send + Sync + 'static,
        D: Send + Sync + 'static,
    {
        Dispatch {
            writer,
            permits: Arc::new(Semaphore::new(self.pool_size)),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
            ackable: Arc::new(Mutex::new(Vec::new())),
            tasks: JoinSet::new(),
        }
    }

    /// Submits every group and waits for all of them.
    pub async fn dispatch<K, D>(
        &self,
        deltas: HashMap<K, DeltaGroup<D>>,
        writer: Arc<dyn DeltaWriter<K, D>>,
    ) -> Vec<InboundMessage>
    where
        K: Debug + Display + Send + Sync + 'static,
        D: Debug + Send + Sync + 'static,
    {
        let mut dispatch = self.begin(writer);
        for (key, group) in deltas {
            dispatch.submit(key, group);
        }
        dispatch.wait().await
    }
}

/// One round of concurrent writes. Dropping it without `wait` aborts the
/// writes that have not finished.
pub struct Dispatch<K, D> {
    writer: Arc<dyn DeltaWriter<K, D>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    ackable: Arc<Mutex<Vec<InboundMessage>>>,
    tasks: JoinSet<()>,
}

impl<K, D> Dispatch<K, D>
where
    K: Debug + Display + Send + Sync + 'static,
    D: Debug + Send + Sync + 'static,
{
    pub fn submit(&mut self, key: K, group: DeltaGroup<D>) {
        let writer = self.writer.clone();
        let permits = self.permits.clone();
        let shutdown = self.shutdown.clone();
        let metrics = self.metrics.clone();
        let ackable = self.ackable.clone();

        self.tasks.spawn(async move {
            // Waiting for a worker slot is abandoned on shutdown; a write that
            // already holds a slot always runs to completion.
            let _permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    PipelineMetrics::incr(&metrics.deltas_skipped, 1);
                    debug!(key = %key, "Shutdown before write started, leaving messages for redelivery");
                    return;
                }
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let started = Instant::now();
            let result = writer.apply(&key, &group.delta).await;
            metrics.record_write_latency(started.elapsed());

            match result {
                Ok(()) => {
                    PipelineMetrics::incr(&metrics.deltas_committed, 1);
                    ackable.lock().await.extend(group.messages);
                }
                Err(e) => {
                    PipelineMetrics::incr(&metrics.deltas_failed, 1);
                    warn!(
                        key = %key,
                        messages = group.messages.len(),
                        "Failed to apply delta {:?}: {}",
                        group.delta,
                        e
                    );
                }
            }
        });
    }

    /// Blocks until every submitted write has finished and returns the
    /// messages of the groups that committed.
    pub async fn wait(mut self) -> Vec<InboundMessage> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                PipelineMetrics::incr(&self.metrics.deltas_failed, 1);
                error!("Delta write task failed: {}", e);
            }
        }
        let mut ackable = self.ackable.lock().await;
        std::mem::take(&mut *ackable)
    }
}
