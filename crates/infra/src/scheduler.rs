//! Retry scheduler: re-drives due RETRY_SCHEDULED deliveries.
//!
//! Each due entry is handled independently:
//!
//! 1. Reload its configuration. If it is gone, inactive or unverified, the
//!    entry is moved straight to FAILED with a conditional write; no request
//!    is made.
//! 2. Otherwise claim it with an atomic compare-and-swap
//!    (RETRY_SCHEDULED -> PENDING, attempt + 1). Losing the claim means
//!    another scheduler instance owns this attempt; the entry is skipped.
//! 3. Run the same single-attempt logic as first deliveries.
//!
//! Before scanning, every pass requeues entries stuck in PENDING longer than
//! the stale threshold (an attempt whose result was never stored). They
//! become due immediately, or FAILED when no attempts are left.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use cmis_webhooks::{DeliveryLogEntry, DeliveryStatus};

use crate::dispatcher::Dispatcher;
use crate::error::StoreError;
use crate::settings::{
    DEFAULT_RETRY_BATCH_SIZE, DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_STALE_PENDING_SECS,
    DeliverySettings,
};
use crate::store::WebhookStore;
use crate::transport::HttpTransport;

/// What one pass over the due entries did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RetryPass {
    /// Stale PENDING entries recovered before the scan.
    pub requeued: usize,
    /// Due entries returned by the scan.
    pub due: usize,
    /// Claimed and re-attempted.
    pub retried: usize,
    /// Moved to FAILED without a request.
    pub abandoned: usize,
    /// Lost to a concurrent worker or skipped after a storage error.
    pub skipped: usize,
}

impl RetryPass {
    /// Entries this pass actually drove forward.
    pub fn processed(&self) -> usize {
        self.retried + self.abandoned
    }
}

pub struct RetryScheduler<S, T> {
    dispatcher: Dispatcher<S, T>,
    stale_after: Duration,
}

impl<S: WebhookStore, T: HttpTransport> RetryScheduler<S, T> {
    pub fn new(dispatcher: Dispatcher<S, T>) -> Self {
        Self {
            dispatcher,
            stale_after: Duration::from_secs(DEFAULT_STALE_PENDING_SECS),
        }
    }

    /// How long a PENDING entry may go untouched before it is requeued.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<S, T> {
        &self.dispatcher
    }

    /// Re-drive up to `limit` due entries, oldest due first.
    ///
    /// Returns the number of entries driven forward (re-attempted or
    /// abandoned).
    pub async fn retry_due(&self, limit: usize) -> Result<usize, StoreError> {
        Ok(self.run_pass(limit).await?.processed())
    }

    pub async fn run_pass(&self, limit: usize) -> Result<RetryPass, StoreError> {
        let store = self.dispatcher.store();
        let now = self.dispatcher.clock().now();
        let requeued = self.requeue_stale(now, limit).await?;
        let due = store.due_retries(now, limit).await?;

        let mut pass = RetryPass {
            requeued,
            due: due.len(),
            ..Default::default()
        };
        for entry in due {
            self.drive(entry, &mut pass).await;
        }

        if pass.due > 0 || pass.requeued > 0 {
            info!(
                target: "webhook_delivery",
                requeued = pass.requeued,
                due = pass.due,
                retried = pass.retried,
                abandoned = pass.abandoned,
                skipped = pass.skipped,
                "retry pass finished"
            );
        }
        Ok(pass)
    }

    async fn requeue_stale(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, StoreError> {
        let stale_before = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let requeued = self
            .dispatcher
            .store()
            .requeue_stale(stale_before, now, limit)
            .await?;

        for entry in &requeued {
            warn!(
                target: "webhook_delivery",
                org_id = %entry.org_id,
                webhook_config_id = %entry.webhook_config_id,
                delivery_id = %entry.id,
                attempt_number = entry.attempt_number,
                status = %entry.status,
                "stale pending delivery requeued"
            );
        }
        Ok(requeued.len())
    }

    async fn drive(&self, entry: DeliveryLogEntry, pass: &mut RetryPass) {
        let store = self.dispatcher.store();
        let now = self.dispatcher.clock().now();

        let config = match store.get_config(entry.org_id, entry.webhook_config_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    target: "webhook_delivery",
                    delivery_id = %entry.id,
                    error = %e,
                    "failed to load webhook configuration for retry"
                );
                pass.skipped += 1;
                return;
            }
        };

        let config = match config {
            Some(config) if config.can_deliver() => config,
            other => {
                let reason = match other {
                    Some(_) => "webhook configuration is inactive or unverified",
                    None => "webhook configuration no longer exists",
                };
                if self.abandon(entry, reason, now).await {
                    pass.abandoned += 1;
                } else {
                    pass.skipped += 1;
                }
                return;
            }
        };

        match store.claim_retry(entry.org_id, entry.id, now).await {
            Ok(Some(claimed)) => {
                debug!(
                    target: "webhook_delivery",
                    delivery_id = %claimed.id,
                    attempt_number = claimed.attempt_number,
                    "retry claimed"
                );
                self.dispatcher.attempt(claimed, &config).await;
                pass.retried += 1;
            }
            Ok(None) => {
                debug!(
                    target: "webhook_delivery",
                    delivery_id = %entry.id,
                    "retry already claimed elsewhere"
                );
                pass.skipped += 1;
            }
            Err(e) => {
                warn!(
                    target: "webhook_delivery",
                    delivery_id = %entry.id,
                    error = %e,
                    "failed to claim retry"
                );
                pass.skipped += 1;
            }
        }
    }

    async fn abandon(
        &self,
        mut entry: DeliveryLogEntry,
        reason: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if entry.abandon(reason, now).is_err() {
            return false;
        }
        match self
            .dispatcher
            .store()
            .update_delivery(&entry, DeliveryStatus::RetryScheduled)
            .await
        {
            Ok(()) => {
                warn!(
                    target: "webhook_delivery",
                    org_id = %entry.org_id,
                    webhook_config_id = %entry.webhook_config_id,
                    delivery_id = %entry.id,
                    attempt_number = entry.attempt_number,
                    reason,
                    "scheduled retry abandoned"
                );
                true
            }
            Err(StoreError::Conflict(_)) => false,
            Err(e) => {
                warn!(
                    target: "webhook_delivery",
                    delivery_id = %entry.id,
                    error = %e,
                    "failed to abandon scheduled retry"
                );
                false
            }
        }
    }
}

/// Background retry worker configuration.
#[derive(Debug, Clone)]
pub struct RetryWorkerConfig {
    /// Time between passes.
    pub interval: Duration,
    /// `limit` handed to each pass.
    pub batch_size: usize,
    /// Name for logging.
    pub name: String,
}

impl Default for RetryWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            batch_size: DEFAULT_RETRY_BATCH_SIZE,
            name: "webhook-retry-worker".to_string(),
        }
    }
}

impl RetryWorkerConfig {
    pub fn from_settings(settings: &DeliverySettings) -> Self {
        Self {
            interval: settings.retry_interval(),
            batch_size: settings.retry_batch_size,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RetryWorkerStats {
    pub passes: u64,
    pub requeued: u64,
    pub retried: u64,
    pub abandoned: u64,
    pub skipped: u64,
    pub failed_passes: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running retry worker.
#[derive(Debug)]
pub struct RetryWorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<RetryWorkerStats>>,
}

impl RetryWorkerHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> RetryWorkerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

impl<S, T> RetryScheduler<S, T>
where
    S: WebhookStore + 'static,
    T: HttpTransport + 'static,
{
    /// Run passes on a fixed interval in a background task.
    pub fn spawn(self, config: RetryWorkerConfig) -> RetryWorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(Mutex::new(RetryWorkerStats::default()));
        let join = tokio::spawn(worker_loop(self, config, shutdown_rx, stats.clone()));

        RetryWorkerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        }
    }
}

async fn worker_loop<S, T>(
    scheduler: RetryScheduler<S, T>,
    config: RetryWorkerConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
    stats: Arc<Mutex<RetryWorkerStats>>,
) where
    S: WebhookStore,
    T: HttpTransport,
{
    info!(
        worker = %config.name,
        interval_secs = config.interval.as_secs(),
        "retry worker started"
    );
    let start_time = Instant::now();
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {}
        }

        let result = scheduler.run_pass(config.batch_size).await;

        {
            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.passes += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(pass) => {
                    s.requeued += pass.requeued as u64;
                    s.retried += pass.retried as u64;
                    s.abandoned += pass.abandoned as u64;
                    s.skipped += pass.skipped as u64;
                }
                Err(_) => s.failed_passes += 1,
            }
        }

        if let Err(e) = result {
            error!(worker = %config.name, error = %e, "retry pass failed");
        }
    }

    info!(worker = %config.name, "retry worker stopped");
}
