use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Invalid amount '{amount}': {reason}")]
    InvalidAmount { amount: String, reason: String },

    #[error("Amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: String, actual: String },

    #[error("Gateway unavailable: provider={provider}, message={message}")]
    GatewayUnavailable {
        provider: String,
        message: String,
        retryable: bool,
    },

    #[error("Gateway rejected request: provider={provider}, message={message}")]
    GatewayRejected {
        provider: String,
        message: String,
        /// Raw provider response body, preserved for the transaction ledger.
        raw_response: Option<String>,
    },

    #[error("Signature mismatch: provider={provider}, context={context}")]
    SignatureMismatch { provider: String, context: String },

    #[error("Duplicate transaction: {transaction_id}")]
    DuplicateTransaction { transaction_id: String },

    #[error("{resource} not found: {reference}")]
    NotFound { resource: String, reference: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::ConfigurationError { .. } => false,
            PaymentError::InvalidAmount { .. } => false,
            PaymentError::AmountMismatch { .. } => false,
            PaymentError::GatewayUnavailable { retryable, .. } => *retryable,
            PaymentError::GatewayRejected { .. } => false,
            PaymentError::SignatureMismatch { .. } => false,
            PaymentError::DuplicateTransaction { .. } => false,
            PaymentError::NotFound { .. } => false,
            PaymentError::RateLimitError { .. } => true,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::ConfigurationError { .. } => 500,
            PaymentError::InvalidAmount { .. } => 400,
            PaymentError::AmountMismatch { .. } => 422,
            PaymentError::GatewayUnavailable { .. } => 502,
            PaymentError::GatewayRejected { .. } => 502,
            PaymentError::SignatureMismatch { .. } => 401,
            PaymentError::DuplicateTransaction { .. } => 409,
            PaymentError::NotFound { .. } => 404,
            PaymentError::RateLimitError { .. } => 429,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::ConfigurationError { .. } => {
                "Payment service is misconfigured. Please contact support".to_string()
            }
            PaymentError::InvalidAmount { amount, reason } => {
                format!("Invalid amount '{}': {}", amount, reason)
            }
            PaymentError::AmountMismatch { .. } => {
                "Payment amount does not match the order total".to_string()
            }
            PaymentError::GatewayUnavailable { .. } => {
                "Payment gateway is temporarily unavailable. Please try again".to_string()
            }
            PaymentError::GatewayRejected { .. } => {
                "Payment was declined by the gateway".to_string()
            }
            PaymentError::SignatureMismatch { .. } => {
                "Payment verification failed".to_string()
            }
            PaymentError::DuplicateTransaction { .. } => {
                "A payment for this order is already in progress".to_string()
            }
            PaymentError::NotFound { resource, .. } => {
                format!("{} could not be found", resource)
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment gateway. Please retry shortly".to_string()
            }
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{
            AppError, AppErrorKind, DomainError, ExternalError, InfrastructureError,
            ValidationError,
        };

        let kind = match err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            PaymentError::ConfigurationError { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration { message })
            }
            PaymentError::InvalidAmount { amount, reason } => {
                AppErrorKind::Domain(DomainError::InvalidAmount { amount, reason })
            }
            PaymentError::AmountMismatch { expected, actual } => {
                AppErrorKind::Domain(DomainError::AmountMismatch { expected, actual })
            }
            PaymentError::GatewayUnavailable {
                provider,
                message,
                retryable,
            } => AppErrorKind::External(ExternalError::Gateway {
                provider,
                message,
                is_retryable: retryable,
            }),
            PaymentError::GatewayRejected {
                provider,
                message,
                raw_response,
            } => AppErrorKind::External(ExternalError::GatewayRejected {
                provider,
                message: raw_response.unwrap_or(message),
            }),
            PaymentError::SignatureMismatch { provider, .. } => {
                AppErrorKind::Domain(DomainError::SignatureMismatch { provider })
            }
            PaymentError::DuplicateTransaction { transaction_id } => {
                AppErrorKind::Domain(DomainError::DuplicateTransaction { transaction_id })
            }
            PaymentError::NotFound {
                resource,
                reference,
            } => {
                if resource.eq_ignore_ascii_case("order") {
                    AppErrorKind::Domain(DomainError::OrderNotFound {
                        order_id: reference,
                    })
                } else {
                    AppErrorKind::Domain(DomainError::TransactionNotFound {
                        transaction_id: reference,
                    })
                }
            }
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "payment gateway".to_string(),
                retry_after: retry_after_seconds,
            }),
        };

        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_http_status_mapping_is_correct() {
        assert_eq!(
            PaymentError::ValidationError {
                message: "bad".to_string(),
                field: None
            }
            .http_status_code(),
            400
        );
        assert_eq!(
            PaymentError::SignatureMismatch {
                provider: "razorpay".to_string(),
                context: "checkout confirmation".to_string()
            }
            .http_status_code(),
            401
        );
        assert_eq!(
            PaymentError::DuplicateTransaction {
                transaction_id: "SF_1".to_string()
            }
            .http_status_code(),
            409
        );
        assert_eq!(
            PaymentError::RateLimitError {
                message: "limited".to_string(),
                retry_after_seconds: Some(30)
            }
            .http_status_code(),
            429
        );
    }

    #[test]
    fn retryable_flags_are_set() {
        assert!(PaymentError::GatewayUnavailable {
            provider: "phonepe".to_string(),
            message: "timeout".to_string(),
            retryable: true
        }
        .is_retryable());
        assert!(!PaymentError::GatewayRejected {
            provider: "phonepe".to_string(),
            message: "declined".to_string(),
            raw_response: None
        }
        .is_retryable());
        assert!(!PaymentError::SignatureMismatch {
            provider: "razorpay".to_string(),
            context: "webhook".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn app_error_conversion_keeps_domain_codes() {
        use crate::error::ErrorCode;

        let err: crate::error::AppError = PaymentError::NotFound {
            resource: "order".to_string(),
            reference: "ord_1".to_string(),
        }
        .into();
        assert_eq!(err.error_code(), ErrorCode::OrderNotFound);

        let err: crate::error::AppError = PaymentError::NotFound {
            resource: "transaction".to_string(),
            reference: "SF_1".to_string(),
        }
        .into();
        assert_eq!(err.error_code(), ErrorCode::TransactionNotFound);

        let err: crate::error::AppError = PaymentError::GatewayRejected {
            provider: "phonepe".to_string(),
            message: "missing redirect info".to_string(),
            raw_response: Some("{\"success\":false}".to_string()),
        }
        .into();
        assert_eq!(err.error_code(), ErrorCode::GatewayRejected);
    }
}
