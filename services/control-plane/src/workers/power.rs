//! Periodic power-state refresh.
//!
//! Walks every node that has management credentials and reconciles its
//! observed power state. Channel failures are per-node: the failed node
//! is recorded as unknown (by the reconciler) and the pass continues.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::db::NodeStore;
use crate::error::CoreError;
use crate::power::PowerReconciler;

/// Statistics from one refresh pass.
#[derive(Debug, Default, Clone)]
pub struct RefreshStats {
    pub refreshed: u32,
    pub failed: u32,
}

/// Periodic power-state monitor.
pub struct PowerMonitor {
    store: NodeStore,
    reconciler: PowerReconciler,
    interval: Duration,
}

impl PowerMonitor {
    pub fn new(store: NodeStore, reconciler: PowerReconciler, interval: Duration) -> Self {
        Self {
            store,
            reconciler,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting power monitor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.refresh_all().await {
                        Ok(stats) if stats.refreshed > 0 || stats.failed > 0 => {
                            info!(
                                refreshed = stats.refreshed,
                                failed = stats.failed,
                                "Power refresh pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Power refresh pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Power monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Refresh every managed node once.
    pub async fn refresh_all(&self) -> Result<RefreshStats, CoreError> {
        let mut stats = RefreshStats::default();

        for node in self.store.list_managed().await? {
            match self.reconciler.update_power_state(node.id).await {
                Ok(_) => stats.refreshed += 1,
                Err(CoreError::Management(e)) => {
                    warn!(node = %node.name, error = %e, "Power state query failed");
                    stats.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(stats)
    }
}
