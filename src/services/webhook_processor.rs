//! Webhook Processor Service
//!
//! Receives gateway push notifications, verifies their signatures, and
//! hands verified terminal results to the payment orchestrator. Every
//! delivery is recorded before it is acted on, keyed so that redelivery
//! of the same event is absorbed without a second side effect.

use crate::database::webhook_event_repository::{WebhookEventRecord, WebhookEventRepository};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{Money, ProviderName, WebhookEvent};
use crate::services::payment_orchestrator::{
    terminal_status_from_state, OrchestratorError, OutcomeSource, PaymentOrchestrator,
    PaymentOutcome,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WebhookProcessorError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Already processed")]
    AlreadyProcessed,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),
}

pub struct WebhookProcessor {
    providers: HashMap<ProviderName, Arc<dyn PaymentProvider>>,
    orchestrator: Arc<PaymentOrchestrator>,
    event_repo: Arc<WebhookEventRepository>,
}

impl WebhookProcessor {
    pub fn new(
        providers: HashMap<ProviderName, Arc<dyn PaymentProvider>>,
        orchestrator: Arc<PaymentOrchestrator>,
        event_repo: Arc<WebhookEventRepository>,
    ) -> Self {
        Self {
            providers,
            orchestrator,
            event_repo,
        }
    }

    /// Process a push notification from a gateway.
    ///
    /// The payload is not trusted until its signature verifies against our
    /// own credentials and the transaction it names exists in our ledger.
    /// The delivery is recorded before the result is applied; a redelivery
    /// keyed to the same event is answered as already processed.
    pub async fn process_push(
        &self,
        provider_name: &str,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<(), WebhookProcessorError> {
        let name = ProviderName::from_str(provider_name)
            .map_err(|_| WebhookProcessorError::UnknownProvider(provider_name.to_string()))?;
        let provider = self
            .providers
            .get(&name)
            .ok_or_else(|| WebhookProcessorError::UnknownProvider(provider_name.to_string()))?;

        let signature = signature.ok_or(WebhookProcessorError::InvalidSignature)?;
        let verification = provider.verify_webhook(payload, signature);
        if !verification.valid {
            warn!(
                provider = %name,
                reason = verification.reason.as_deref().unwrap_or("signature mismatch"),
                "webhook rejected"
            );
            return Err(WebhookProcessorError::InvalidSignature);
        }

        let event = provider
            .parse_webhook_event(payload)
            .map_err(|e| WebhookProcessorError::ProcessingError(e.to_string()))?;

        let event_id = derive_event_id(&event);
        let record = self
            .event_repo
            .log_event(
                name.as_str(),
                &event_id,
                &event.event_type,
                event.transaction_reference.as_deref(),
                event.payload.clone(),
            )
            .await
            .map_err(|e| WebhookProcessorError::DatabaseError(e.to_string()))?;

        let record = match record {
            Some(record) => record,
            None => {
                info!(
                    provider = %name,
                    event_id = %event_id,
                    "duplicate webhook delivery absorbed"
                );
                return Err(WebhookProcessorError::AlreadyProcessed);
            }
        };

        info!(
            provider = %name,
            event_id = %event_id,
            event_type = %event.event_type,
            "webhook received"
        );

        match self.apply_event(&event, signature).await {
            Ok(applied) => {
                self.event_repo
                    .mark_completed(record.id)
                    .await
                    .map_err(|e| WebhookProcessorError::DatabaseError(e.to_string()))?;
                if !applied {
                    info!(
                        provider = %name,
                        event_id = %event_id,
                        "webhook carried no terminal result; recorded only"
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.event_repo
                    .record_failure(record.id, &e.to_string())
                    .await
                    .map_err(|db| WebhookProcessorError::DatabaseError(db.to_string()))?;
                Err(e)
            }
        }
    }

    /// Apply a verified event to the ledger. Returns whether the event
    /// carried a terminal result.
    async fn apply_event(
        &self,
        event: &WebhookEvent,
        signature: &str,
    ) -> Result<bool, WebhookProcessorError> {
        let merchant_transaction_id = event.transaction_reference.as_deref().ok_or_else(|| {
            WebhookProcessorError::ProcessingError(
                "event names no merchant transaction".to_string(),
            )
        })?;

        // Resolve the transaction from our own ledger before acting on
        // anything the payload claims.
        let transaction = self
            .orchestrator
            .transaction_repo()
            .find_by_merchant_transaction_id(merchant_transaction_id)
            .await
            .map_err(|e| WebhookProcessorError::DatabaseError(e.to_string()))?
            .ok_or_else(|| {
                WebhookProcessorError::TransactionNotFound(merchant_transaction_id.to_string())
            })?;

        if let Some(reported_minor) = payload_amount_minor(&event.payload) {
            let ledger_minor =
                Money::new(transaction.amount.to_string(), transaction.currency.clone())
                    .to_minor_units()
                    .ok();
            if ledger_minor.is_some() && ledger_minor != Some(reported_minor) {
                warn!(
                    merchant_transaction_id = %merchant_transaction_id,
                    ledger_minor = ?ledger_minor,
                    reported_minor = reported_minor,
                    "webhook amount disagrees with ledger; flagged for operator review"
                );
            }
        }

        let mut outcome = match PaymentOutcome::from_webhook_event(event) {
            Some(outcome) => outcome,
            None => return Ok(false),
        };
        outcome.signature = Some(signature.to_string());

        self.orchestrator
            .apply_payment_result(merchant_transaction_id, outcome)
            .await
            .map_err(|e| match e {
                OrchestratorError::TransactionNotFound { transaction_id } => {
                    WebhookProcessorError::TransactionNotFound(transaction_id)
                }
                OrchestratorError::Database(db) => {
                    WebhookProcessorError::DatabaseError(db.to_string())
                }
                other => WebhookProcessorError::ProcessingError(other.to_string()),
            })?;
        Ok(true)
    }

    /// Re-drive events that failed processing.
    ///
    /// The stored payload may be stale by now, so the retry does not replay
    /// it; it polls the gateway for the transaction's current state and
    /// applies that. Events without a transaction reference age out once
    /// their attempts are spent.
    pub async fn retry_pending(
        &self,
        max_attempts: i32,
        batch_size: i64,
    ) -> Result<usize, WebhookProcessorError> {
        let pending = self
            .event_repo
            .find_pending_for_retry(max_attempts, batch_size)
            .await
            .map_err(|e| WebhookProcessorError::DatabaseError(e.to_string()))?;

        let mut recovered = 0;
        for record in pending {
            match self.retry_event(&record).await {
                Ok(true) => {
                    self.event_repo
                        .mark_completed(record.id)
                        .await
                        .map_err(|e| WebhookProcessorError::DatabaseError(e.to_string()))?;
                    recovered += 1;
                }
                Ok(false) => {
                    // Nothing settled yet; spend an attempt and leave the
                    // event pending so a later sweep can pick it up.
                    info!(
                        event_id = %record.event_id,
                        attempts = record.attempts,
                        "gateway still reports the payment pending"
                    );
                    self.event_repo
                        .record_failure(record.id, "gateway state not terminal")
                        .await
                        .map_err(|db| WebhookProcessorError::DatabaseError(db.to_string()))?;
                }
                Err(e) => {
                    warn!(
                        event_id = %record.event_id,
                        attempts = record.attempts,
                        error = %e,
                        "webhook retry failed"
                    );
                    self.event_repo
                        .record_failure(record.id, &e.to_string())
                        .await
                        .map_err(|db| WebhookProcessorError::DatabaseError(db.to_string()))?;
                }
            }
        }

        if recovered > 0 {
            info!(recovered = recovered, "webhook retries recovered");
        }
        Ok(recovered)
    }

    /// Returns whether the poll reached a terminal state; a still-pending
    /// payment leaves the event open for a later sweep.
    async fn retry_event(&self, record: &WebhookEventRecord) -> Result<bool, WebhookProcessorError> {
        let merchant_transaction_id =
            record.merchant_transaction_id.as_deref().ok_or_else(|| {
                WebhookProcessorError::ProcessingError(
                    "event names no merchant transaction".to_string(),
                )
            })?;
        let outcome = self
            .orchestrator
            .poll_and_apply(merchant_transaction_id, OutcomeSource::Reconciler)
            .await
            .map_err(|e| match e {
                OrchestratorError::TransactionNotFound { transaction_id } => {
                    WebhookProcessorError::TransactionNotFound(transaction_id)
                }
                OrchestratorError::Database(db) => {
                    WebhookProcessorError::DatabaseError(db.to_string())
                }
                other => WebhookProcessorError::ProcessingError(other.to_string()),
            })?;
        Ok(terminal_status_from_state(&outcome.gateway_state).is_some())
    }
}

/// Build the dedupe key for a delivery. Gateways redeliver the same event
/// with the same transaction and type, so that pair identifies it; a
/// delivery naming neither gets a unique id and is only recorded.
fn derive_event_id(event: &WebhookEvent) -> String {
    if let Some(mtid) = &event.transaction_reference {
        return format!("{}:{}", mtid, event.event_type);
    }
    if let Some(provider_ref) = &event.provider_reference {
        return format!("{}:{}", provider_ref, event.event_type);
    }
    Uuid::new_v4().to_string()
}

/// Pull the minor-unit amount out of a raw webhook payload, wherever the
/// gateway put it.
fn payload_amount_minor(payload: &JsonValue) -> Option<i64> {
    payload
        .get("data")
        .and_then(|d| d.get("amount"))
        .and_then(|a| a.as_i64())
        .or_else(|| {
            payload
                .get("payload")
                .and_then(|p| p.get("payment"))
                .and_then(|p| p.get("entity"))
                .and_then(|e| e.get("amount"))
                .and_then(|a| a.as_i64())
        })
}
