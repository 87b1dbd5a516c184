//! Background maintenance tasks: visibility extension for long-running
//! pointers and warning-store cleanup.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::router::RouterHandle;
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How often the long-running scan runs.
    pub visibility_extension_interval: Duration,
    /// Processing age beyond which a pointer gets its visibility extended.
    pub visibility_extension_threshold: Duration,
    /// Extension granted per scan.
    pub visibility_extension_seconds: u32,
    pub warning_cleanup_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            visibility_extension_interval: Duration::from_secs(55),
            visibility_extension_threshold: Duration::from_secs(50),
            visibility_extension_seconds: 120,
            warning_cleanup_interval: Duration::from_secs(300),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    pub fn start(
        router: RouterHandle,
        warnings: Arc<WarningService>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        {
            let router = router.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.visibility_extension_interval;
            let threshold = config.visibility_extension_threshold;
            let extension = config.visibility_extension_seconds;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("running visibility extension scan");
                            router.extend_long_running(threshold, extension).await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("visibility extender stopping");
                            break;
                        }
                    }
                }
            });
        }

        {
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.warning_cleanup_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("running warning cleanup");
                            warnings.cleanup();
                        }
                        _ = shutdown_rx.recv() => {
                            info!("warning cleanup stopping");
                            break;
                        }
                    }
                }
            });
        }

        info!("lifecycle tasks started");
        Self { shutdown_tx }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals_fit_inside_visibility_windows() {
        let config = LifecycleConfig::default();
        assert!(config.visibility_extension_threshold < config.visibility_extension_interval + Duration::from_secs(10));
        assert!(config.visibility_extension_seconds >= 60);
    }
}
