use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[async_trait]
pub trait Shutdown: Send + Sync {
    fn component(&self) -> &str;
    async fn shutdown(&self) -> Result<()>;
}

/// Owns the process lifetime token and the components to close once it
/// fires.
pub struct ShutdownManager {
    token: CancellationToken,
    components: Mutex<Vec<Arc<dyn Shutdown>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            components: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn register(&self, component: Arc<dyn Shutdown>) {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(component);
    }

    /// Cancels the token, then closes components in reverse registration
    /// order. Every component is closed even if an earlier one fails.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutdown requested");
        self.token.cancel();

        let components: Vec<_> = self
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .rev()
            .collect();

        let mut failures = 0;
        for component in components {
            if let Err(e) = component.shutdown().await {
                failures += 1;
                error!("Failed to shut down {}: {}", component.component(), e);
            } else {
                info!("{} shut down", component.component());
            }
        }

        if failures > 0 {
            anyhow::bail!("{} component(s) failed to shut down cleanly", failures);
        }
        Ok(())
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
