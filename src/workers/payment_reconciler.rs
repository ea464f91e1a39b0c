use crate::database::transaction_repository::{PaymentTransaction, TransactionRepository};
use crate::services::payment_orchestrator::{OutcomeSource, PaymentOrchestrator};
use crate::services::webhook_processor::WebhookProcessor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Custom error type
// ---------------------------------------------------------------------------

/// Typed errors produced by the payment reconciler worker.
///
/// Callers at the `run` level only ever see these through logging; one
/// unresolvable transaction must not take the whole cycle down with it.
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(#[from] crate::database::error::DatabaseError),

    /// A gateway status check or ledger apply failed.
    #[error("reconciliation error: {0}")]
    Reconciliation(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often the worker wakes up to sweep pending attempts.
    pub poll_interval: Duration,
    /// Minimum age before a pending attempt is polled; younger attempts are
    /// still expected to resolve through callbacks.
    pub pending_grace: Duration,
    /// How far back (in hours) to sweep for pending attempts.
    pub window_hours: i32,
    /// Maximum pending attempts fetched per cycle.
    pub batch_size: i64,
    /// Retry budget for stored webhook events before they age out.
    pub max_event_attempts: i32,
    /// Maximum webhook events retried per cycle.
    pub event_batch_size: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(45),
            pending_grace: Duration::from_secs(90),
            window_hours: 24,
            batch_size: 100,
            max_event_attempts: 5,
            event_batch_size: 25,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval = Duration::from_secs(
            std::env::var("RECONCILER_POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.pending_grace = Duration::from_secs(
            std::env::var("RECONCILER_PENDING_GRACE_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.pending_grace.as_secs()),
        );
        cfg.window_hours = std::env::var("RECONCILER_WINDOW_HOURS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(cfg.window_hours);
        cfg.batch_size = std::env::var("RECONCILER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.batch_size);
        cfg.max_event_attempts = std::env::var("RECONCILER_MAX_EVENT_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(cfg.max_event_attempts);
        cfg.event_batch_size = std::env::var("RECONCILER_EVENT_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.event_batch_size);
        cfg
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Background sweep for payments whose callbacks never arrived.
///
/// Polls the gateway for aged pending attempts and applies whatever it
/// reports through the same idempotent path the push channels use, so a
/// transaction settled here is indistinguishable from one settled by a
/// webhook. Attempts whose payment window has lapsed while the gateway
/// still reports nothing terminal are closed out as failed.
pub struct PaymentReconcilerWorker {
    orchestrator: Arc<PaymentOrchestrator>,
    webhook_processor: Arc<WebhookProcessor>,
    transaction_repo: Arc<TransactionRepository>,
    config: ReconcilerConfig,
}

impl PaymentReconcilerWorker {
    pub fn new(
        orchestrator: Arc<PaymentOrchestrator>,
        webhook_processor: Arc<WebhookProcessor>,
        transaction_repo: Arc<TransactionRepository>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            orchestrator,
            webhook_processor,
            transaction_repo,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            pending_grace_secs = self.config.pending_grace.as_secs(),
            window_hours = self.config.window_hours,
            batch_size = self.config.batch_size,
            "payment reconciler worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("payment reconciler worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "reconciler cycle failed");
                    }
                }
            }
        }

        info!("payment reconciler worker stopped");
    }

    async fn run_cycle(&self) -> Result<(), ReconcilerError> {
        self.reconcile_pending_payments().await?;
        self.retry_webhook_events().await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pending-payment reconciliation
    // -----------------------------------------------------------------------

    async fn reconcile_pending_payments(&self) -> Result<(), ReconcilerError> {
        let pending = self
            .transaction_repo
            .find_pending_for_reconciliation(
                self.config.pending_grace.as_secs() as i64,
                self.config.window_hours,
                self.config.batch_size,
            )
            .await?;

        if pending.is_empty() {
            return Ok(());
        }

        let mut settled = 0usize;
        let mut expired = 0usize;
        let mut errors = 0usize;

        for transaction in &pending {
            match self.reconcile_one(transaction).await {
                Ok(ReconcileResult::Settled) => settled += 1,
                Ok(ReconcileResult::Expired) => expired += 1,
                Ok(ReconcileResult::StillPending) => {}
                Err(e) => {
                    errors += 1;
                    warn!(
                        merchant_transaction_id = %transaction.merchant_transaction_id,
                        error = %e,
                        "reconciliation failed for transaction"
                    );
                }
            }
        }

        info!(
            checked = pending.len(),
            settled = settled,
            expired = expired,
            errors = errors,
            "reconciliation cycle finished"
        );
        Ok(())
    }

    async fn reconcile_one(
        &self,
        transaction: &PaymentTransaction,
    ) -> Result<ReconcileResult, ReconcilerError> {
        // Gateway truth first. Expiry only applies once the gateway has
        // answered and still reports nothing terminal; a dead line tells
        // us nothing about the money.
        let outcome = self
            .orchestrator
            .poll_and_apply(
                &transaction.merchant_transaction_id,
                OutcomeSource::Reconciler,
            )
            .await
            .map_err(|e| ReconcilerError::Reconciliation(e.to_string()))?;

        if outcome.transaction.status != "pending" {
            return Ok(ReconcileResult::Settled);
        }

        if is_past_expiry(transaction.expires_at) {
            self.orchestrator
                .expire_transaction(&transaction.merchant_transaction_id)
                .await
                .map_err(|e| ReconcilerError::Reconciliation(e.to_string()))?;
            info!(
                merchant_transaction_id = %transaction.merchant_transaction_id,
                "pending attempt expired and closed out"
            );
            return Ok(ReconcileResult::Expired);
        }

        Ok(ReconcileResult::StillPending)
    }

    // -----------------------------------------------------------------------
    // Webhook event retries
    // -----------------------------------------------------------------------

    async fn retry_webhook_events(&self) {
        match self
            .webhook_processor
            .retry_pending(self.config.max_event_attempts, self.config.event_batch_size)
            .await
        {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "webhook event retry pass failed"),
        }
    }
}

enum ReconcileResult {
    Settled,
    Expired,
    StillPending,
}

// ---------------------------------------------------------------------------
// Pure helper functions
// ---------------------------------------------------------------------------

/// Returns `true` when the attempt's payment window has lapsed. Attempts
/// without a recorded window never expire here.
fn is_past_expiry(expires_at: Option<chrono::DateTime<chrono::Utc>>) -> bool {
    match expires_at {
        Some(deadline) => chrono::Utc::now() > deadline,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
