//! Payment Orchestrator Service
//!
//! Owns the payment lifecycle around the gateway adapters: creating ledger
//! entries, initiating payments, and applying terminal results. Webhooks,
//! client verification calls, redirect returns, and the reconciler all race
//! toward the same transaction; every one of them funnels through a single
//! idempotent apply function so the end state does not depend on which
//! channel wins.

use crate::database::error::DatabaseError;
use crate::database::order_repository::{Order, OrderRepository};
use crate::database::transaction_repository::{
    LedgerWrite, PaymentTransaction, TransactionRepository,
};
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::payments::error::PaymentError;
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    CheckoutConfirmation, CustomerContact, Money, PaymentRequest, PaymentState, ProviderName,
    StatusRequest, WebhookEvent,
};
use crate::payments::utils::generate_transaction_id;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the payment orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Prefix for generated merchant transaction ids
    pub transaction_prefix: String,
    /// Attempts when fetching an order that may lag behind its creation
    pub order_fetch_attempts: u32,
    /// Fixed delay between order fetch attempts, in milliseconds
    pub order_fetch_delay_ms: u64,
    /// How long an initiated payment stays payable, in seconds
    pub payment_expiry_secs: i64,
    /// Base URL the gateways redirect and post callbacks to
    pub public_base_url: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            transaction_prefix: "SF".to_string(),
            order_fetch_attempts: 3,
            order_fetch_delay_ms: 200,
            payment_expiry_secs: 1800,
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            transaction_prefix: std::env::var("TRANSACTION_ID_PREFIX")
                .unwrap_or_else(|_| "SF".to_string()),
            order_fetch_attempts: std::env::var("ORDER_FETCH_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            order_fetch_delay_ms: std::env::var("ORDER_FETCH_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
            payment_expiry_secs: std::env::var("PAYMENT_EXPIRY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1800),
            public_base_url: std::env::var("APP_PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Payment status stored on transactions and on the order's payment column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Failed)
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    pub fn to_db_status(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db_status())
    }
}

/// Order fulfillment status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Deleted,
}

impl OrderStatus {
    pub fn from_db_status(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "confirmed" => Some(OrderStatus::Confirmed),
            "processing" => Some(OrderStatus::Processing),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            "deleted" => Some(OrderStatus::Deleted),
            _ => None,
        }
    }

    pub fn to_db_status(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Deleted => "deleted",
        }
    }

    /// An order can be cancelled until fulfillment has moved past
    /// processing.
    pub fn allows_cancellation(&self) -> bool {
        !matches!(
            self,
            OrderStatus::Shipped
                | OrderStatus::Delivered
                | OrderStatus::Cancelled
                | OrderStatus::Deleted
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db_status())
    }
}

// ============================================================================
// Outcome Types
// ============================================================================

/// Which channel reported a payment result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSource {
    Webhook,
    ClientVerification,
    RedirectReturn,
    Reconciler,
}

impl std::fmt::Display for OutcomeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutcomeSource::Webhook => "webhook",
            OutcomeSource::ClientVerification => "client_verification",
            OutcomeSource::RedirectReturn => "redirect_return",
            OutcomeSource::Reconciler => "reconciler",
        };
        write!(f, "{}", name)
    }
}

/// A terminal payment result ready to be applied to the ledger and order.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub status: PaymentStatus,
    pub provider_payment_id: Option<String>,
    pub provider_response: Option<JsonValue>,
    /// Signature presented by the notifying party, kept on the ledger row.
    pub signature: Option<String>,
    pub source: OutcomeSource,
}

impl PaymentOutcome {
    /// Build an outcome from a parsed push notification. Returns `None`
    /// when the event does not report a terminal state.
    pub fn from_webhook_event(event: &WebhookEvent) -> Option<Self> {
        let status = terminal_status_from_state(event.status.as_ref()?)?;
        Some(Self {
            status,
            provider_payment_id: event.provider_reference.clone(),
            provider_response: Some(event.payload.clone()),
            signature: None,
            source: OutcomeSource::Webhook,
        })
    }
}

/// How an apply call landed against the ledger.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// This call moved the transaction to its terminal status.
    Applied(PaymentTransaction),
    /// The same terminal status was already stored; nothing changed.
    Replayed(PaymentTransaction),
    /// A different terminal status was already stored and was kept.
    Conflict(PaymentTransaction),
}

impl ApplyOutcome {
    pub fn transaction(&self) -> &PaymentTransaction {
        match self {
            ApplyOutcome::Applied(t) | ApplyOutcome::Replayed(t) | ApplyOutcome::Conflict(t) => t,
        }
    }
}

/// What the caller gets back from a successful initiation.
#[derive(Debug, Clone, Serialize)]
pub struct InitiationOutcome {
    pub merchant_transaction_id: String,
    pub provider: ProviderName,
    /// Hosted payment page, for the redirect flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    /// Gateway order id, for the embedded checkout flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_order_id: Option<String>,
    /// Public key id the checkout widget needs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_key_id: Option<String>,
    pub amount: Money,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Result of a checkout-confirmation verification.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutVerification {
    pub verified: bool,
    pub merchant_transaction_id: String,
    pub payment_status: PaymentStatus,
}

/// Result of polling the gateway for a transaction.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub transaction: PaymentTransaction,
    pub gateway_state: PaymentState,
}

// ============================================================================
// Error Types
// ============================================================================

/// Orchestrator error types
#[derive(Debug)]
pub enum OrchestratorError {
    OrderNotFound {
        order_id: String,
    },
    TransactionNotFound {
        transaction_id: String,
    },
    DuplicateTransaction {
        transaction_id: String,
    },
    InvalidOrderState {
        order_id: String,
        current_state: String,
        attempted: String,
    },
    AmountMismatch {
        expected: String,
        actual: String,
    },
    InvalidAmount {
        amount: String,
        reason: String,
    },
    SignatureMismatch {
        provider: String,
    },
    Validation {
        message: String,
    },
    Gateway(PaymentError),
    Database(DatabaseError),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrderNotFound { order_id } => write!(f, "Order not found: {}", order_id),
            Self::TransactionNotFound { transaction_id } => {
                write!(f, "Transaction not found: {}", transaction_id)
            }
            Self::DuplicateTransaction { transaction_id } => {
                write!(f, "Duplicate transaction: {}", transaction_id)
            }
            Self::InvalidOrderState {
                order_id,
                current_state,
                attempted,
            } => write!(
                f,
                "Order {} is {}; cannot {}",
                order_id, current_state, attempted
            ),
            Self::AmountMismatch { expected, actual } => {
                write!(f, "Amount mismatch: expected {}, got {}", expected, actual)
            }
            Self::InvalidAmount { amount, reason } => {
                write!(f, "Invalid amount {}: {}", amount, reason)
            }
            Self::SignatureMismatch { provider } => {
                write!(f, "Signature verification failed for {}", provider)
            }
            Self::Validation { message } => write!(f, "{}", message),
            Self::Gateway(e) => write!(f, "{}", e),
            Self::Database(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<PaymentError> for OrchestratorError {
    fn from(error: PaymentError) -> Self {
        OrchestratorError::Gateway(error)
    }
}

impl From<DatabaseError> for OrchestratorError {
    fn from(error: DatabaseError) -> Self {
        OrchestratorError::Database(error)
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::OrderNotFound { order_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::OrderNotFound { order_id }))
            }
            OrchestratorError::TransactionNotFound { transaction_id } => AppError::new(
                AppErrorKind::Domain(DomainError::TransactionNotFound { transaction_id }),
            ),
            OrchestratorError::DuplicateTransaction { transaction_id } => AppError::new(
                AppErrorKind::Domain(DomainError::DuplicateTransaction { transaction_id }),
            ),
            OrchestratorError::InvalidOrderState {
                order_id,
                current_state,
                attempted,
            } => AppError::new(AppErrorKind::Domain(DomainError::InvalidOrderState {
                order_id,
                current_state,
                attempted,
            })),
            OrchestratorError::AmountMismatch { expected, actual } => AppError::new(
                AppErrorKind::Domain(DomainError::AmountMismatch { expected, actual }),
            ),
            OrchestratorError::InvalidAmount { amount, reason } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidAmount {
                    amount,
                    reason,
                }))
            }
            OrchestratorError::SignatureMismatch { provider } => {
                AppError::new(AppErrorKind::Domain(DomainError::SignatureMismatch {
                    provider,
                }))
            }
            OrchestratorError::Validation { message } => AppError::new(AppErrorKind::Validation(
                ValidationError::InvalidField {
                    field: "request".to_string(),
                    reason: message,
                },
            )),
            OrchestratorError::Gateway(e) => e.into(),
            OrchestratorError::Database(e) => e.into(),
        }
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

/// Coordinates gateways, the transaction ledger, and order state.
pub struct PaymentOrchestrator {
    providers: HashMap<ProviderName, Arc<dyn PaymentProvider>>,
    default_provider: ProviderName,
    order_repo: Arc<OrderRepository>,
    transaction_repo: Arc<TransactionRepository>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        providers: HashMap<ProviderName, Arc<dyn PaymentProvider>>,
        default_provider: ProviderName,
        order_repo: Arc<OrderRepository>,
        transaction_repo: Arc<TransactionRepository>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            providers,
            default_provider,
            order_repo,
            transaction_repo,
            config,
        }
    }

    pub fn transaction_repo(&self) -> &Arc<TransactionRepository> {
        &self.transaction_repo
    }

    fn provider(&self, name: &ProviderName) -> OrchestratorResult<&Arc<dyn PaymentProvider>> {
        self.providers
            .get(name)
            .ok_or_else(|| OrchestratorError::Validation {
                message: format!("provider {} is not configured", name),
            })
    }

    fn provider_for_transaction(
        &self,
        transaction: &PaymentTransaction,
    ) -> OrchestratorResult<(ProviderName, &Arc<dyn PaymentProvider>)> {
        let name = ProviderName::from_str(&transaction.provider).map_err(|_| {
            OrchestratorError::Validation {
                message: format!(
                    "transaction {} references unknown provider {}",
                    transaction.merchant_transaction_id, transaction.provider
                ),
            }
        })?;
        let provider = self.provider(&name)?;
        Ok((name, provider))
    }

    // =========================================================================
    // Order Fetching
    // =========================================================================

    /// Fetch an order scoped to its owner, retrying a few times with a
    /// short fixed delay. Order rows can lag their creation by a beat when
    /// checkout and payment initiation race; beyond the budget the caller
    /// gets a clean not-found instead of a hang.
    pub async fn fetch_order_with_retry(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> OrchestratorResult<Order> {
        let attempts = self.config.order_fetch_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(order) = self
                .order_repo
                .find_by_id_for_user(order_id, user_id)
                .await?
            {
                return Ok(order);
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.config.order_fetch_delay_ms)).await;
            }
        }
        warn!(order_id = %order_id, attempts = attempts, "order not found after retries");
        Err(OrchestratorError::OrderNotFound {
            order_id: order_id.to_string(),
        })
    }

    // =========================================================================
    // Initiation
    // =========================================================================

    /// Start a payment attempt for an order.
    ///
    /// Creates the ledger entry first, then calls the gateway. A definitive
    /// gateway rejection marks the attempt failed with the raw response
    /// preserved; a transport failure leaves it pending for the reconciler,
    /// because the gateway may have accepted the request before the line
    /// dropped. The order itself is never touched here.
    pub async fn initiate_payment(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        provider_name: Option<ProviderName>,
        expected_amount: Option<Money>,
    ) -> OrchestratorResult<InitiationOutcome> {
        let order = self.fetch_order_with_retry(order_id, user_id).await?;

        let payment_status =
            PaymentStatus::from_db_status(&order.payment_status).unwrap_or(PaymentStatus::Pending);
        if payment_status == PaymentStatus::Completed {
            return Err(OrchestratorError::InvalidOrderState {
                order_id: order_id.to_string(),
                current_state: "paid".to_string(),
                attempted: "initiate another payment".to_string(),
            });
        }
        let order_status =
            OrderStatus::from_db_status(&order.status).unwrap_or(OrderStatus::Pending);
        if matches!(order_status, OrderStatus::Cancelled | OrderStatus::Deleted) {
            return Err(OrchestratorError::InvalidOrderState {
                order_id: order_id.to_string(),
                current_state: order.status.clone(),
                attempted: "initiate payment".to_string(),
            });
        }

        let amount = Money::new(order.total_amount.to_string(), order.currency.clone());
        amount.to_minor_units().map_err(OrchestratorError::Gateway)?;

        // The client echoes back the total it displayed; a disagreement
        // means the order changed underneath the buyer.
        if let Some(expected) = expected_amount {
            let expected_value = BigDecimal::from_str(&expected.amount).map_err(|_| {
                OrchestratorError::InvalidAmount {
                    amount: expected.amount.clone(),
                    reason: "not a valid decimal number".to_string(),
                }
            })?;
            if expected_value != order.total_amount {
                return Err(OrchestratorError::AmountMismatch {
                    expected: order.total_amount.to_string(),
                    actual: expected.amount,
                });
            }
        }

        let name = provider_name.unwrap_or_else(|| self.default_provider.clone());
        let provider = self.provider(&name)?;

        let merchant_transaction_id = generate_transaction_id(&self.config.transaction_prefix);
        let expires_at =
            chrono::Utc::now() + chrono::Duration::seconds(self.config.payment_expiry_secs);
        let transaction = self
            .create_ledger_entry(&merchant_transaction_id, &order, &name, expires_at)
            .await?;

        let request = PaymentRequest {
            amount: amount.clone(),
            customer: customer_from_order(&order),
            order_id: order.id.to_string(),
            transaction_reference: transaction.merchant_transaction_id.clone(),
            redirect_url: Some(format!(
                "{}/payments/callback?merchantTransactionId={}",
                self.config.public_base_url, transaction.merchant_transaction_id
            )),
            callback_url: Some(format!("{}/payments/callback", self.config.public_base_url)),
            metadata: Some(serde_json::json!({
                "order_id": order.id,
                "user_id": user_id,
            })),
        };

        match provider.initiate_payment(&request).await {
            Ok(response) => {
                self.transaction_repo
                    .record_initiation(
                        &transaction.merchant_transaction_id,
                        response.provider_order_id.as_deref(),
                        response.provider_reference.as_deref(),
                        response
                            .provider_data
                            .clone()
                            .unwrap_or_else(|| serde_json::json!({})),
                    )
                    .await?;

                info!(
                    merchant_transaction_id = %transaction.merchant_transaction_id,
                    order_id = %order.id,
                    provider = %name,
                    "payment initiated"
                );

                let checkout_key_id = response
                    .provider_data
                    .as_ref()
                    .and_then(|d| d.get("key_id"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
                Ok(InitiationOutcome {
                    merchant_transaction_id: transaction.merchant_transaction_id,
                    provider: name,
                    redirect_url: response.payment_url,
                    provider_order_id: response.provider_order_id,
                    checkout_key_id,
                    amount,
                    expires_at,
                })
            }
            Err(e) => {
                if let PaymentError::GatewayRejected { raw_response, .. } = &e {
                    // Definitive rejection: close the attempt, keep what
                    // the gateway said. The order stays pending for retry.
                    let raw = raw_response
                        .as_deref()
                        .and_then(|r| serde_json::from_str::<JsonValue>(r).ok())
                        .unwrap_or_else(|| serde_json::json!({ "error": e.to_string() }));
                    self.transaction_repo
                        .apply_terminal_status(
                            &transaction.merchant_transaction_id,
                            PaymentStatus::Failed.to_db_status(),
                            None,
                            Some(raw),
                            None,
                        )
                        .await?;
                    warn!(
                        merchant_transaction_id = %transaction.merchant_transaction_id,
                        provider = %name,
                        error = %e,
                        "gateway rejected initiation"
                    );
                } else {
                    warn!(
                        merchant_transaction_id = %transaction.merchant_transaction_id,
                        provider = %name,
                        error = %e,
                        "initiation failed without a definitive answer; attempt left pending"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Insert the ledger row for a new attempt. A unique-key collision is
    /// benign when the existing row is the same pending attempt for the
    /// same order and amount; anything else is a real duplicate.
    async fn create_ledger_entry(
        &self,
        merchant_transaction_id: &str,
        order: &Order,
        provider: &ProviderName,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> OrchestratorResult<PaymentTransaction> {
        let created = self
            .transaction_repo
            .create_transaction(
                merchant_transaction_id,
                order.id,
                provider.as_str(),
                order.total_amount.clone(),
                &order.currency,
                order.payment_method.as_deref(),
                Some(expires_at),
            )
            .await;

        match created {
            Ok(transaction) => Ok(transaction),
            Err(e) if e.is_unique_violation() => {
                let existing = self
                    .transaction_repo
                    .find_by_merchant_transaction_id(merchant_transaction_id)
                    .await?
                    .ok_or(OrchestratorError::DuplicateTransaction {
                        transaction_id: merchant_transaction_id.to_string(),
                    })?;
                let matches_request = existing.order_id == order.id
                    && existing.amount == order.total_amount
                    && existing.status == "pending";
                if matches_request {
                    info!(
                        merchant_transaction_id = %merchant_transaction_id,
                        "reusing existing pending attempt"
                    );
                    Ok(existing)
                } else {
                    Err(OrchestratorError::DuplicateTransaction {
                        transaction_id: merchant_transaction_id.to_string(),
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Applying Results
    // =========================================================================

    /// Apply a terminal payment result to the ledger and the order.
    ///
    /// This is the only path that moves transactions and orders to their
    /// settled state; webhooks, client verification, redirect returns, and
    /// the reconciler all call it. Safe to call any number of times: the
    /// ledger write is first-writer-wins and every order write is guarded,
    /// so replays re-check and change nothing.
    pub async fn apply_payment_result(
        &self,
        merchant_transaction_id: &str,
        outcome: PaymentOutcome,
    ) -> OrchestratorResult<ApplyOutcome> {
        if !outcome.status.is_terminal() {
            return Err(OrchestratorError::Validation {
                message: "only terminal statuses can be applied".to_string(),
            });
        }

        let write = self
            .transaction_repo
            .apply_terminal_status(
                merchant_transaction_id,
                outcome.status.to_db_status(),
                outcome.provider_payment_id.as_deref(),
                outcome.provider_response.clone(),
                outcome.signature.as_deref(),
            )
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    OrchestratorError::TransactionNotFound {
                        transaction_id: merchant_transaction_id.to_string(),
                    }
                } else {
                    OrchestratorError::Database(e)
                }
            })?;

        match write {
            LedgerWrite::Applied(transaction) => {
                info!(
                    merchant_transaction_id = %merchant_transaction_id,
                    status = %outcome.status,
                    source = %outcome.source,
                    "payment result applied"
                );
                self.sync_order_after_result(&transaction, outcome.status)
                    .await?;
                Ok(ApplyOutcome::Applied(transaction))
            }
            LedgerWrite::Replayed(transaction) => {
                info!(
                    merchant_transaction_id = %merchant_transaction_id,
                    status = %outcome.status,
                    source = %outcome.source,
                    "payment result replayed; no change"
                );
                // Re-drive the guarded order writes so a crash between the
                // ledger write and the order write heals on replay.
                self.sync_order_after_result(&transaction, outcome.status)
                    .await?;
                Ok(ApplyOutcome::Replayed(transaction))
            }
            LedgerWrite::Conflict(stored) => {
                warn!(
                    merchant_transaction_id = %merchant_transaction_id,
                    stored_status = %stored.status,
                    incoming_status = %outcome.status,
                    source = %outcome.source,
                    "conflicting terminal status kept out; flagged for operator review"
                );
                Ok(ApplyOutcome::Conflict(stored))
            }
        }
    }

    /// Propagate a settled transaction onto its order. Every write is a
    /// guarded single-row update, so this is idempotent and safe under
    /// races between the notification channels.
    async fn sync_order_after_result(
        &self,
        transaction: &PaymentTransaction,
        status: PaymentStatus,
    ) -> OrchestratorResult<()> {
        match status {
            PaymentStatus::Completed => {
                let payment_reference = transaction
                    .provider_payment_id
                    .clone()
                    .unwrap_or_else(|| transaction.merchant_transaction_id.clone());
                self.order_repo
                    .mark_payment_completed(transaction.order_id, &payment_reference)
                    .await?;
                self.order_repo
                    .advance_to_processing(transaction.order_id)
                    .await?;
            }
            PaymentStatus::Failed => {
                let updated = self
                    .order_repo
                    .mark_payment_failed(transaction.order_id)
                    .await?;
                if updated.is_none() {
                    // Either another attempt already settled this order or
                    // the failure was seen before. Only the paid case is
                    // worth an operator's attention.
                    if let Some(order) =
                        self.order_repo.find_by_order_id(transaction.order_id).await?
                    {
                        if order.payment_status == "completed" {
                            warn!(
                                order_id = %transaction.order_id,
                                merchant_transaction_id = %transaction.merchant_transaction_id,
                                "failed attempt reported against a paid order; flagged for operator review"
                            );
                        }
                    }
                }
            }
            PaymentStatus::Pending => {}
        }
        Ok(())
    }

    // =========================================================================
    // Client Verification
    // =========================================================================

    /// Verify an embedded-checkout confirmation and settle the payment.
    ///
    /// The transaction is resolved from our own ledger before anything in
    /// the payload is trusted. A bad signature stops everything; a good
    /// signature is still not proof of capture, so the payment is fetched
    /// from the gateway and only a captured payment completes the order.
    pub async fn verify_and_apply_checkout(
        &self,
        confirmation: &CheckoutConfirmation,
    ) -> OrchestratorResult<CheckoutVerification> {
        let transaction = self
            .transaction_repo
            .find_by_provider_order_id(&confirmation.provider_order_id)
            .await?
            .ok_or_else(|| OrchestratorError::TransactionNotFound {
                transaction_id: confirmation.provider_order_id.clone(),
            })?;
        let (name, provider) = self.provider_for_transaction(&transaction)?;

        let signature_valid = provider.verify_checkout_confirmation(confirmation)?;
        if !signature_valid {
            warn!(
                merchant_transaction_id = %transaction.merchant_transaction_id,
                provider = %name,
                "checkout confirmation signature mismatch"
            );
            return Err(OrchestratorError::SignatureMismatch {
                provider: name.to_string(),
            });
        }

        let details = provider
            .fetch_payment_details(&confirmation.provider_payment_id)
            .await?;

        match terminal_status_from_state(&details.status) {
            Some(status) => {
                let applied = self
                    .apply_payment_result(
                        &transaction.merchant_transaction_id,
                        PaymentOutcome {
                            status,
                            provider_payment_id: Some(confirmation.provider_payment_id.clone()),
                            provider_response: details.provider_data.clone(),
                            signature: Some(confirmation.signature.clone()),
                            source: OutcomeSource::ClientVerification,
                        },
                    )
                    .await?;
                let stored = applied.transaction();
                Ok(CheckoutVerification {
                    verified: status == PaymentStatus::Completed && stored.status == "completed",
                    merchant_transaction_id: stored.merchant_transaction_id.clone(),
                    payment_status: PaymentStatus::from_db_status(&stored.status)
                        .unwrap_or(PaymentStatus::Pending),
                })
            }
            None => {
                // Signature checks out but the money has not settled; never
                // report success early.
                info!(
                    merchant_transaction_id = %transaction.merchant_transaction_id,
                    gateway_state = ?details.status,
                    "checkout confirmed but payment not captured yet"
                );
                Ok(CheckoutVerification {
                    verified: false,
                    merchant_transaction_id: transaction.merchant_transaction_id,
                    payment_status: PaymentStatus::Pending,
                })
            }
        }
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Ask the gateway for a transaction's current state and apply it.
    ///
    /// This is the fallback for lost webhooks: the landing page, manual
    /// verification, and the reconciler all use it, and it converges to the
    /// same end state the push path produces.
    pub async fn poll_and_apply(
        &self,
        merchant_transaction_id: &str,
        source: OutcomeSource,
    ) -> OrchestratorResult<PollOutcome> {
        let transaction = self
            .transaction_repo
            .find_by_merchant_transaction_id(merchant_transaction_id)
            .await?
            .ok_or_else(|| OrchestratorError::TransactionNotFound {
                transaction_id: merchant_transaction_id.to_string(),
            })?;
        let (_, provider) = self.provider_for_transaction(&transaction)?;

        let request = StatusRequest {
            transaction_reference: Some(transaction.merchant_transaction_id.clone()),
            provider_reference: transaction
                .provider_payment_id
                .clone()
                .or_else(|| transaction.provider_order_id.clone()),
        };
        let response = provider.get_payment_status(&request).await?;

        let gateway_state = response.status.clone();
        match terminal_status_from_state(&gateway_state) {
            Some(status) => {
                let applied = self
                    .apply_payment_result(
                        merchant_transaction_id,
                        PaymentOutcome {
                            status,
                            provider_payment_id: response.provider_reference.clone(),
                            provider_response: response.provider_data.clone(),
                            signature: None,
                            source,
                        },
                    )
                    .await?;
                Ok(PollOutcome {
                    transaction: applied.transaction().clone(),
                    gateway_state,
                })
            }
            None => Ok(PollOutcome {
                transaction,
                gateway_state,
            }),
        }
    }

    /// Close out a pending attempt whose payment window has expired.
    pub async fn expire_transaction(
        &self,
        merchant_transaction_id: &str,
    ) -> OrchestratorResult<ApplyOutcome> {
        self.apply_payment_result(
            merchant_transaction_id,
            PaymentOutcome {
                status: PaymentStatus::Failed,
                provider_payment_id: None,
                provider_response: Some(serde_json::json!({
                    "reason": "payment window expired"
                })),
                signature: None,
                source: OutcomeSource::Reconciler,
            },
        )
        .await
    }

    // =========================================================================
    // Cancellation & Refunds
    // =========================================================================

    /// Cancel an order that has not shipped. Requires a human-supplied
    /// reason for the audit trail.
    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        reason: &str,
    ) -> OrchestratorResult<Order> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(OrchestratorError::Validation {
                message: "a cancellation reason is required".to_string(),
            });
        }

        let order = self.fetch_order_with_retry(order_id, user_id).await?;
        let status = OrderStatus::from_db_status(&order.status).unwrap_or(OrderStatus::Pending);
        if !status.allows_cancellation() {
            return Err(OrchestratorError::InvalidOrderState {
                order_id: order_id.to_string(),
                current_state: order.status,
                attempted: "cancel".to_string(),
            });
        }

        let cancelled = self
            .order_repo
            .cancel_order(order_id, reason)
            .await?
            .ok_or_else(|| OrchestratorError::InvalidOrderState {
                order_id: order_id.to_string(),
                current_state: "advanced".to_string(),
                attempted: "cancel".to_string(),
            })?;
        info!(order_id = %order_id, "order cancelled");
        Ok(cancelled)
    }

    /// Record a refund against a paid order. The cumulative refunded
    /// amount can never exceed the order total; a violating request is
    /// rejected and the order left untouched.
    pub async fn refund_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        amount: Money,
        reason: &str,
    ) -> OrchestratorResult<Order> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(OrchestratorError::Validation {
                message: "a refund reason is required".to_string(),
            });
        }

        let requested =
            BigDecimal::from_str(&amount.amount).map_err(|_| OrchestratorError::InvalidAmount {
                amount: amount.amount.clone(),
                reason: "not a valid decimal number".to_string(),
            })?;
        if requested <= BigDecimal::from(0) {
            return Err(OrchestratorError::InvalidAmount {
                amount: amount.amount.clone(),
                reason: "refund must be greater than zero".to_string(),
            });
        }

        let order = self.fetch_order_with_retry(order_id, user_id).await?;
        if order.payment_status != "completed" {
            return Err(OrchestratorError::InvalidOrderState {
                order_id: order_id.to_string(),
                current_state: format!("payment {}", order.payment_status),
                attempted: "refund".to_string(),
            });
        }
        validate_refund_amount(&order.total_amount, &order.refund_amount, &requested)?;

        let refunded = self
            .order_repo
            .apply_refund(order_id, requested.clone(), reason)
            .await?
            .ok_or_else(|| OrchestratorError::InvalidAmount {
                amount: amount.amount.clone(),
                reason: "refund exceeds the remaining refundable amount".to_string(),
            })?;
        info!(
            order_id = %order_id,
            refunded = %requested,
            "refund recorded"
        );
        Ok(refunded)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Map a gateway-reported state to a terminal ledger status. Non-terminal
/// and indeterminate states map to `None` and must not be applied.
pub fn terminal_status_from_state(state: &PaymentState) -> Option<PaymentStatus> {
    match state {
        PaymentState::Success => Some(PaymentStatus::Completed),
        PaymentState::Failed | PaymentState::Cancelled => Some(PaymentStatus::Failed),
        PaymentState::Pending
        | PaymentState::Processing
        | PaymentState::Refunded
        | PaymentState::Unknown => None,
    }
}

/// Reject a refund that would push the cumulative refunded amount past
/// the order total.
pub fn validate_refund_amount(
    total: &BigDecimal,
    already_refunded: &BigDecimal,
    requested: &BigDecimal,
) -> OrchestratorResult<()> {
    let remaining = total - already_refunded;
    if requested > &remaining {
        return Err(OrchestratorError::InvalidAmount {
            amount: requested.to_string(),
            reason: format!("exceeds remaining refundable amount {}", remaining),
        });
    }
    Ok(())
}

fn customer_from_order(order: &Order) -> CustomerContact {
    CustomerContact {
        email: order
            .metadata
            .get("customer_email")
            .and_then(|v| v.as_str())
            .map(String::from),
        phone: order
            .metadata
            .get("customer_phone")
            .and_then(|v| v.as_str())
            .map(String::from),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // --- status mapping ---

    #[test]
    fn payment_status_round_trips_through_db_strings() {
        assert_eq!(
            PaymentStatus::from_db_status("pending"),
            Some(PaymentStatus::Pending)
        );
        assert_eq!(
            PaymentStatus::from_db_status("completed"),
            Some(PaymentStatus::Completed)
        );
        assert_eq!(
            PaymentStatus::from_db_status("failed"),
            Some(PaymentStatus::Failed)
        );
        assert_eq!(PaymentStatus::from_db_status("settled"), None);
        assert_eq!(PaymentStatus::Completed.to_db_status(), "completed");
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(PaymentStatus::Completed.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(!PaymentStatus::Pending.is_terminal());
    }

    #[test]
    fn gateway_states_map_to_terminal_statuses() {
        assert_eq!(
            terminal_status_from_state(&PaymentState::Success),
            Some(PaymentStatus::Completed)
        );
        assert_eq!(
            terminal_status_from_state(&PaymentState::Failed),
            Some(PaymentStatus::Failed)
        );
        assert_eq!(
            terminal_status_from_state(&PaymentState::Cancelled),
            Some(PaymentStatus::Failed)
        );
        assert_eq!(terminal_status_from_state(&PaymentState::Pending), None);
        assert_eq!(terminal_status_from_state(&PaymentState::Unknown), None);
    }

    // --- cancellation gate ---

    #[test]
    fn cancellation_is_blocked_once_shipped() {
        assert!(OrderStatus::Pending.allows_cancellation());
        assert!(OrderStatus::Confirmed.allows_cancellation());
        assert!(OrderStatus::Processing.allows_cancellation());
        assert!(!OrderStatus::Shipped.allows_cancellation());
        assert!(!OrderStatus::Delivered.allows_cancellation());
        assert!(!OrderStatus::Cancelled.allows_cancellation());
        assert!(!OrderStatus::Deleted.allows_cancellation());
    }

    // --- refund bound ---

    #[test]
    fn refund_within_remaining_amount_is_accepted() {
        let total = BigDecimal::from(200);
        let refunded = BigDecimal::from(50);
        assert!(validate_refund_amount(&total, &refunded, &BigDecimal::from(150)).is_ok());
        assert!(validate_refund_amount(&total, &refunded, &BigDecimal::from(100)).is_ok());
    }

    #[test]
    fn refund_beyond_the_total_is_rejected() {
        let total = BigDecimal::from(200);
        let refunded = BigDecimal::from(0);
        let result = validate_refund_amount(&total, &refunded, &BigDecimal::from(300));
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidAmount { .. })
        ));

        let refunded = BigDecimal::from(150);
        let result = validate_refund_amount(&total, &refunded, &BigDecimal::from(100));
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidAmount { .. })
        ));
    }

    // --- webhook outcome mapping ---

    #[test]
    fn webhook_events_with_terminal_states_become_outcomes() {
        let event = WebhookEvent {
            provider: ProviderName::PhonePe,
            event_type: "PAYMENT_SUCCESS".to_string(),
            transaction_reference: Some("SF_1_abc".to_string()),
            provider_reference: Some("T123".to_string()),
            status: Some(PaymentState::Success),
            payload: serde_json::json!({"code": "PAYMENT_SUCCESS"}),
            received_at: chrono::Utc::now().to_rfc3339(),
        };
        let outcome = PaymentOutcome::from_webhook_event(&event)
            .expect("terminal event should become an outcome");
        assert_eq!(outcome.status, PaymentStatus::Completed);
        assert_eq!(outcome.provider_payment_id.as_deref(), Some("T123"));
        assert_eq!(outcome.source, OutcomeSource::Webhook);
    }

    #[test]
    fn webhook_events_with_pending_states_are_ignored() {
        let event = WebhookEvent {
            provider: ProviderName::PhonePe,
            event_type: "PAYMENT_PENDING".to_string(),
            transaction_reference: Some("SF_1_abc".to_string()),
            provider_reference: None,
            status: Some(PaymentState::Pending),
            payload: serde_json::json!({"code": "PAYMENT_PENDING"}),
            received_at: chrono::Utc::now().to_rfc3339(),
        };
        assert!(PaymentOutcome::from_webhook_event(&event).is_none());

        let no_status = WebhookEvent {
            status: None,
            ..event
        };
        assert!(PaymentOutcome::from_webhook_event(&no_status).is_none());
    }

    // --- error mapping ---

    #[test]
    fn orchestrator_errors_map_to_domain_app_errors() {
        let app: AppError = OrchestratorError::SignatureMismatch {
            provider: "razorpay".to_string(),
        }
        .into();
        assert_eq!(app.status_code(), 401);

        let app: AppError = OrchestratorError::OrderNotFound {
            order_id: "o1".to_string(),
        }
        .into();
        assert_eq!(app.status_code(), 404);

        let app: AppError = OrchestratorError::AmountMismatch {
            expected: "200".to_string(),
            actual: "300".to_string(),
        }
        .into();
        assert_eq!(app.status_code(), 422);
    }
}
