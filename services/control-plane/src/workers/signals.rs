//! Outbox drain worker.
//!
//! Claims due signals in bounded batches and delivers them. Delivery is
//! at-least-once: a crashed worker's claims re-expire, and receivers are
//! idempotent. A signal that keeps failing is abandoned after a capped
//! number of attempts, leaving an error entry in the node's log.

use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::db::{ClaimedSignal, Database, DbError, NodeLogStore, NodeStore, Outbox};
use crate::error::CoreError;
use crate::identity::CheckinProcessor;
use crate::power::PowerReconciler;
use mandrel_events::SignalKind;

/// Signal worker tuning.
#[derive(Debug, Clone)]
pub struct SignalWorkerConfig {
    pub interval: Duration,
    pub batch_size: i64,
    pub max_attempts: i32,
    /// How long a claim stays invisible before it is retried.
    pub retry_delay: Duration,
}

impl Default for SignalWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 32,
            max_attempts: 5,
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// Statistics from one drain pass.
#[derive(Debug, Default, Clone)]
pub struct DrainStats {
    pub delivered: u32,
    pub retried: u32,
    pub abandoned: u32,
}

/// Drains the signal outbox.
pub struct SignalWorker {
    db: Database,
    outbox: Outbox,
    store: NodeStore,
    log: NodeLogStore,
    checkin: CheckinProcessor,
    power: PowerReconciler,
    config: SignalWorkerConfig,
}

impl SignalWorker {
    pub fn new(
        db: Database,
        outbox: Outbox,
        store: NodeStore,
        log: NodeLogStore,
        checkin: CheckinProcessor,
        power: PowerReconciler,
        config: SignalWorkerConfig,
    ) -> Self {
        Self {
            db,
            outbox,
            store,
            log,
            checkin,
            power,
            config,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting signal worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.drain_once().await {
                        error!(error = %e, "Signal drain pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Signal worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim and deliver one batch of due signals.
    pub async fn drain_once(&self) -> Result<DrainStats, CoreError> {
        let mut stats = DrainStats::default();
        let claimed = self
            .outbox
            .claim(
                self.config.batch_size,
                self.config.retry_delay.as_secs_f64(),
            )
            .await?;

        for signal in claimed {
            match self.deliver(&signal).await {
                Ok(()) => {
                    self.outbox.complete(signal.id).await?;
                    stats.delivered += 1;
                }
                Err(e) => {
                    warn!(
                        signal_id = signal.id,
                        node_id = %signal.node_id,
                        kind = signal.kind.name(),
                        attempts = signal.attempts,
                        error = %e,
                        "Signal delivery failed"
                    );
                    if signal.attempts >= self.config.max_attempts {
                        self.abandon(&signal, &e).await?;
                        stats.abandoned += 1;
                    } else {
                        stats.retried += 1;
                    }
                }
            }
        }

        if stats.delivered > 0 || stats.abandoned > 0 {
            info!(
                delivered = stats.delivered,
                retried = stats.retried,
                abandoned = stats.abandoned,
                "Signal drain pass complete"
            );
        }
        Ok(stats)
    }

    async fn deliver(&self, signal: &ClaimedSignal) -> Result<(), CoreError> {
        match &signal.kind {
            SignalKind::EvalTags => self.checkin.eval_tags(signal.node_id).await,
            SignalKind::Power { desired } => {
                self.power.apply_power(signal.node_id, *desired).await
            }
        }
    }

    /// Drop a signal that exhausted its attempts, recording why on the
    /// node it was addressed to.
    async fn abandon(&self, signal: &ClaimedSignal, cause: &CoreError) -> Result<(), CoreError> {
        error!(
            signal_id = signal.id,
            node_id = %signal.node_id,
            kind = signal.kind.name(),
            "Abandoning signal after repeated failures"
        );

        if let Some(node) = self.store.get(signal.node_id).await? {
            let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
            self.log
                .append(
                    &mut tx,
                    node.id,
                    &node.name,
                    json!({
                        "severity": "error",
                        "msg": format!("background signal abandoned: {cause}"),
                        "signal": signal.kind.name(),
                    }),
                    None,
                )
                .await?;
            tx.commit().await.map_err(DbError::Query)?;
        }

        self.outbox.complete(signal.id).await?;
        Ok(())
    }
}
