//! Comprehensive error handling for ShopFlow backend
//!
//! This module provides a unified error system with proper HTTP status mapping,
//! user-friendly messages, and structured error codes for client handling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Payment and order error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "DUPLICATE_TRANSACTION")]
    DuplicateTransaction,
    #[serde(rename = "INVALID_AMOUNT")]
    InvalidAmount,
    #[serde(rename = "AMOUNT_MISMATCH")]
    AmountMismatch,
    #[serde(rename = "INVALID_ORDER_STATE")]
    InvalidOrderState,
    #[serde(rename = "SIGNATURE_MISMATCH")]
    SignatureMismatch,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "GATEWAY_UNAVAILABLE")]
    GatewayUnavailable,
    #[serde(rename = "GATEWAY_REJECTED")]
    GatewayRejected,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Domain-specific business logic errors
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Order with given ID doesn't exist
    OrderNotFound { order_id: String },
    /// Payment transaction with given ID doesn't exist
    TransactionNotFound { transaction_id: String },
    /// A transaction with the same merchant transaction ID already exists
    DuplicateTransaction { transaction_id: String },
    /// Amount is invalid (negative, zero, or out of range)
    InvalidAmount { amount: String, reason: String },
    /// Paid or refunded amount disagrees with what the order expects
    AmountMismatch { expected: String, actual: String },
    /// The order's current state forbids the requested operation
    InvalidOrderState {
        order_id: String,
        current_state: String,
        attempted: String,
    },
    /// A gateway callback or verification payload failed signature checks
    SignatureMismatch { provider: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// External service errors (payment gateways)
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Gateway (PhonePe, Razorpay) could not be reached or answered abnormally
    Gateway {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// Gateway answered but declined the request; raw response kept for support
    GatewayRejected { provider: String, message: String },
    /// Rate limit exceeded
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Required field missing
    MissingField { field: String },
    /// Field value is malformed
    InvalidField { field: String, reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { .. } => 404,
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::DuplicateTransaction { .. } => 409, // Conflict
                DomainError::InvalidAmount { .. } => 400,
                DomainError::AmountMismatch { .. } => 422, // Unprocessable Entity
                DomainError::InvalidOrderState { .. } => 409,
                DomainError::SignatureMismatch { .. } => 401, // Unauthorized
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => 500,
                InfrastructureError::Configuration { .. } => 500,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { .. } => 502, // Bad Gateway
                ExternalError::GatewayRejected { .. } => 502,
                ExternalError::RateLimit { .. } => 429, // Too Many Requests
                ExternalError::Timeout { .. } => 504,   // Gateway Timeout
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { .. } => 400,
                ValidationError::MissingField { .. } => 400,
                ValidationError::InvalidField { .. } => 400,
            },
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::DuplicateTransaction { .. } => ErrorCode::DuplicateTransaction,
                DomainError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
                DomainError::AmountMismatch { .. } => ErrorCode::AmountMismatch,
                DomainError::InvalidOrderState { .. } => ErrorCode::InvalidOrderState,
                DomainError::SignatureMismatch { .. } => ErrorCode::SignatureMismatch,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { .. } => ErrorCode::GatewayUnavailable,
                ExternalError::GatewayRejected { .. } => ErrorCode::GatewayRejected,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { order_id } => {
                    format!("Order '{}' not found", order_id)
                }
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Payment transaction '{}' not found", transaction_id)
                }
                DomainError::DuplicateTransaction { transaction_id } => {
                    format!("Payment transaction '{}' already exists", transaction_id)
                }
                DomainError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                DomainError::AmountMismatch { expected, actual } => {
                    format!("Amount mismatch: expected {}, received {}", expected, actual)
                }
                DomainError::InvalidOrderState {
                    order_id,
                    current_state,
                    attempted,
                } => {
                    format!(
                        "Order '{}' cannot be {} while in state '{}'",
                        order_id, attempted, current_state
                    )
                }
                DomainError::SignatureMismatch { .. } => {
                    "Payment signature verification failed".to_string()
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment gateway ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::GatewayRejected { provider, .. } => {
                    format!(
                        "Payment gateway ({}) declined the request. Please contact support",
                        provider
                    )
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => {
                    if let Some(secs) = retry_after {
                        format!(
                            "Rate limit exceeded for {}. Please try again in {} seconds",
                            service, secs
                        )
                    } else {
                        format!(
                            "Rate limit exceeded for {}. Please try again later",
                            service
                        )
                    }
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => {
                    format!(
                        "{} request timed out after {} seconds. Please try again",
                        service, timeout_secs
                    )
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for field '{}': {}", field, reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { is_retryable, .. } => *is_retryable,
                ExternalError::GatewayRejected { .. } => false,
                ExternalError::RateLimit { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Conversions from specific error types
// Note: From<DatabaseError> is implemented in database/error.rs and
// From<PaymentError> in payments/error.rs to avoid circular dependencies

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_transaction_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::DuplicateTransaction {
            transaction_id: "SF_1700000000_a1b2c3".to_string(),
        }));

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::DuplicateTransaction);
        assert!(error.user_message().contains("already exists"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_signature_mismatch_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::SignatureMismatch {
            provider: "phonepe".to_string(),
        }));

        assert_eq!(error.status_code(), 401);
        assert_eq!(error.error_code(), ErrorCode::SignatureMismatch);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_gateway_unavailable_is_retryable() {
        let error = AppError::new(AppErrorKind::External(ExternalError::Gateway {
            provider: "phonepe".to_string(),
            message: "connection refused".to_string(),
            is_retryable: true,
        }));

        assert_eq!(error.status_code(), 502);
        assert_eq!(error.error_code(), ErrorCode::GatewayUnavailable);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_gateway_rejection_is_not_retryable() {
        let error = AppError::new(AppErrorKind::External(ExternalError::GatewayRejected {
            provider: "razorpay".to_string(),
            message: "{\"error\":{\"code\":\"BAD_REQUEST_ERROR\"}}".to_string(),
        }));

        assert_eq!(error.status_code(), 502);
        assert_eq!(error.error_code(), ErrorCode::GatewayRejected);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_invalid_order_state_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::InvalidOrderState {
            order_id: "ord_42".to_string(),
            current_state: "shipped".to_string(),
            attempted: "cancelled".to_string(),
        }));

        assert_eq!(error.status_code(), 409);
        assert!(error.user_message().contains("shipped"));
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
            amount: "-100".to_string(),
            reason: "Amount cannot be negative".to_string(),
        }));

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert!(!error.is_retryable());
    }
}
