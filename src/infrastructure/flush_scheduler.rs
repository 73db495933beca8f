use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::infrastructure::error::PublishErrors;

/// Something the scheduler can flush on every tick.
#[async_trait]
pub trait Flushable: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Returns the number of records delivered.
    async fn flush(&self) -> Result<usize, PublishErrors>;
}

/// Background loop calling [`Flushable::flush`] every `interval` until its
/// token is cancelled. One loop never overlaps with itself; a flush that has
/// started when cancellation arrives runs to completion.
pub struct FlushScheduler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl FlushScheduler {
    /// Must be called inside a tokio runtime. The loop stops when either
    /// `parent` or the scheduler's own token is cancelled.
    pub fn spawn(target: Arc<dyn Flushable>, interval: Duration, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let handle = tokio::spawn(run_flush_loop(target, interval, token.clone()));
        Self { token, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!("Flush loop terminated abnormally: {}", e);
        }
    }
}

async fn run_flush_loop(target: Arc<dyn Flushable>, interval: Duration, token: CancellationToken) {
    info!(
        notifier = target.name(),
        "Flush loop started with interval {:?}", interval
    );

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(notifier = target.name(), "Flush loop received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                match target.flush().await {
                    Ok(0) => {}
                    Ok(published) => debug!(notifier = target.name(), published, "Scheduled flush delivered records"),
                    // Records are already merged back; the next tick retries them.
                    Err(e) => warn!(notifier = target.name(), "Scheduled flush failed: {}", e),
                }
            }
        }
    }

    info!(notifier = target.name(), "Flush loop stopped");
}
