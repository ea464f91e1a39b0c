//! Payment API endpoints
//!
//! The initiate/verify/refund/cancel routes speak to the orchestrator and
//! report errors through the shared error envelope. The callback routes are
//! gateway-facing: they carry no transport auth, authenticate payloads by
//! signature alone, and acknowledge processed or replayed deliveries so the
//! gateway stops redelivering.

use crate::error::AppError;
use crate::middleware::error::{get_request_id_from_headers, json_error_response, success_response};
use crate::payments::types::{CheckoutConfirmation, Money, ProviderName};
use crate::services::payment_orchestrator::{OutcomeSource, PaymentOrchestrator};
use crate::services::webhook_processor::{WebhookProcessor, WebhookProcessorError};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct PaymentApiState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub webhook_processor: Arc<WebhookProcessor>,
}

pub fn router(state: PaymentApiState) -> Router {
    Router::new()
        .route("/payments/initiate", post(initiate_payment))
        .route("/payments/verify", post(verify_payment))
        .route(
            "/payments/callback",
            post(handle_gateway_callback).get(handle_redirect_return),
        )
        .route("/payments/callback/{provider}", post(handle_provider_callback))
        .route("/payments/refund", post(refund_payment))
        .route("/payments/cancel", post(cancel_order))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub provider: Option<ProviderName>,
    /// Total the client displayed, echoed back for cross-checking.
    #[serde(default)]
    pub amount: Option<Money>,
}

/// The verify route accepts either a checkout confirmation from the
/// embedded widget or a bare transaction reference to re-check.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum VerifyPaymentRequest {
    Checkout {
        provider_order_id: String,
        provider_payment_id: String,
        signature: String,
    },
    Reference {
        merchant_transaction_id: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: Money,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct RedirectReturnQuery {
    #[serde(rename = "merchantTransactionId")]
    pub merchant_transaction_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Customer-facing handlers
// ---------------------------------------------------------------------------

/// POST /payments/initiate
pub async fn initiate_payment(
    State(state): State<PaymentApiState>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .orchestrator
        .initiate_payment(
            request.user_id,
            request.order_id,
            request.provider,
            request.amount,
        )
        .await
        .map_err(AppError::from)?;
    Ok((StatusCode::CREATED, success_response(outcome)))
}

/// POST /payments/verify
pub async fn verify_payment(
    State(state): State<PaymentApiState>,
    Json(request): Json<VerifyPaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    match request {
        VerifyPaymentRequest::Checkout {
            provider_order_id,
            provider_payment_id,
            signature,
        } => {
            let confirmation = CheckoutConfirmation {
                provider_order_id,
                provider_payment_id,
                signature,
            };
            let verification = state
                .orchestrator
                .verify_and_apply_checkout(&confirmation)
                .await
                .map_err(AppError::from)?;
            Ok(success_response(serde_json::json!({
                "verified": verification.verified,
                "merchant_transaction_id": verification.merchant_transaction_id,
                "payment_status": verification.payment_status,
            })))
        }
        VerifyPaymentRequest::Reference {
            merchant_transaction_id,
        } => {
            let outcome = state
                .orchestrator
                .poll_and_apply(&merchant_transaction_id, OutcomeSource::ClientVerification)
                .await
                .map_err(AppError::from)?;
            Ok(success_response(serde_json::json!({
                "merchant_transaction_id": outcome.transaction.merchant_transaction_id,
                "payment_status": outcome.transaction.status,
                "gateway_state": outcome.gateway_state,
            })))
        }
    }
}

/// POST /payments/refund
pub async fn refund_payment(
    State(state): State<PaymentApiState>,
    Json(request): Json<RefundRequest>,
) -> Result<impl IntoResponse, AppError> {
    let order = state
        .orchestrator
        .refund_order(
            request.user_id,
            request.order_id,
            request.amount,
            &request.reason,
        )
        .await
        .map_err(AppError::from)?;
    Ok(success_response(serde_json::json!({
        "order_id": order.id,
        "refund_amount": order.refund_amount.to_string(),
        "refund_status": order.refund_status,
    })))
}

/// POST /payments/cancel
pub async fn cancel_order(
    State(state): State<PaymentApiState>,
    Json(request): Json<CancelRequest>,
) -> Result<impl IntoResponse, AppError> {
    let order = state
        .orchestrator
        .cancel_order(request.user_id, request.order_id, &request.reason)
        .await
        .map_err(AppError::from)?;
    Ok(success_response(serde_json::json!({
        "order_id": order.id,
        "status": order.status,
        "cancelled_at": order.cancelled_at,
    })))
}

// ---------------------------------------------------------------------------
// Gateway-facing handlers
// ---------------------------------------------------------------------------

/// POST /payments/callback
///
/// Server-to-server callback from the redirect gateway. The body arrives
/// either as JSON or a form, both wrapping a base64 payload that the
/// signature covers.
pub async fn handle_gateway_callback(
    State(state): State<PaymentApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    process_gateway_callback(&state, "phonepe", &headers, &body).await
}

/// POST /payments/callback/{provider}
pub async fn handle_provider_callback(
    State(state): State<PaymentApiState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    process_gateway_callback(&state, &provider, &headers, &body).await
}

async fn process_gateway_callback(
    state: &PaymentApiState,
    provider: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    info!(provider = %provider, "received gateway callback");
    let request_id = get_request_id_from_headers(headers);

    // A gateway we never integrated has no callback endpoint at all; answer
    // before the signature check, which only knows integrated providers.
    if ProviderName::from_str(provider).is_err() {
        warn!(provider = %provider, "callback for unknown provider");
        return json_error_response(StatusCode::NOT_FOUND, "Unknown provider", request_id)
            .into_response();
    }

    let signature = extract_signature(provider, headers);
    if signature.is_none() {
        warn!(provider = %provider, "callback missing signature header");
        return json_error_response(StatusCode::UNAUTHORIZED, "Missing signature", request_id)
            .into_response();
    }

    let payload = match extract_gateway_payload(provider, body) {
        Some(payload) => payload,
        None => {
            warn!(provider = %provider, "callback body carried no payload");
            return json_error_response(StatusCode::BAD_REQUEST, "Invalid payload", request_id)
                .into_response();
        }
    };

    match state
        .webhook_processor
        .process_push(provider, signature.as_deref(), &payload)
        .await
    {
        Ok(()) => {
            (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
        }
        Err(WebhookProcessorError::InvalidSignature) => {
            json_error_response(StatusCode::UNAUTHORIZED, "Invalid signature", request_id)
                .into_response()
        }
        Err(WebhookProcessorError::AlreadyProcessed) => {
            (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
        }
        Err(WebhookProcessorError::UnknownProvider(name)) => {
            warn!(provider = %name, "callback for unknown provider");
            json_error_response(StatusCode::NOT_FOUND, "Unknown provider", request_id)
                .into_response()
        }
        Err(e) => {
            // Acknowledge so the gateway stops redelivering; the event is
            // recorded and the reconciler will settle the payment.
            warn!(provider = %provider, error = %e, "callback processing failed");
            (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
        }
    }
}

/// GET /payments/callback
///
/// Browser landing after the hosted payment page. The query parameter only
/// says which transaction to look at; the actual state comes from polling
/// the gateway.
pub async fn handle_redirect_return(
    State(state): State<PaymentApiState>,
    Query(params): Query<RedirectReturnQuery>,
) -> Result<impl IntoResponse, AppError> {
    let merchant_transaction_id = params.merchant_transaction_id.ok_or_else(|| {
        AppError::new(crate::error::AppErrorKind::Validation(
            crate::error::ValidationError::MissingField {
                field: "merchantTransactionId".to_string(),
            },
        ))
    })?;

    let outcome = state
        .orchestrator
        .poll_and_apply(&merchant_transaction_id, OutcomeSource::RedirectReturn)
        .await
        .map_err(AppError::from)?;
    Ok(success_response(serde_json::json!({
        "merchant_transaction_id": outcome.transaction.merchant_transaction_id,
        "payment_status": outcome.transaction.status,
    })))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn extract_signature(provider: &str, headers: &HeaderMap) -> Option<String> {
    match provider {
        "phonepe" => headers
            .get("x-verify")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        "razorpay" => headers
            .get("x-razorpay-signature")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Unwrap the transport envelope around a callback body. The redirect
/// gateway wraps its base64 payload in either JSON or a form field named
/// `response`; the checkout gateway signs the raw body as-is.
fn extract_gateway_payload(provider: &str, body: &Bytes) -> Option<Vec<u8>> {
    if provider != "phonepe" {
        return Some(body.to_vec());
    }

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(response) = value.get("response").and_then(|v| v.as_str()) {
            return Some(response.as_bytes().to_vec());
        }
    }

    #[derive(Deserialize)]
    struct CallbackForm {
        response: String,
    }
    if let Ok(form) = serde_urlencoded::from_bytes::<CallbackForm>(body) {
        return Some(form.response.into_bytes());
    }

    // Some integrations post the base64 payload bare.
    let trimmed = body.iter().all(|b| !b.is_ascii_whitespace());
    if !body.is_empty() && trimmed {
        return Some(body.to_vec());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- signature extraction ---

    #[test]
    fn signature_headers_are_provider_specific() {
        let mut headers = HeaderMap::new();
        headers.insert("x-verify", "abc###1".parse().unwrap());
        headers.insert("x-razorpay-signature", "deadbeef".parse().unwrap());

        assert_eq!(
            extract_signature("phonepe", &headers).as_deref(),
            Some("abc###1")
        );
        assert_eq!(
            extract_signature("razorpay", &headers).as_deref(),
            Some("deadbeef")
        );
        assert_eq!(extract_signature("stripe", &headers), None);
    }

    // --- payload extraction ---

    #[test]
    fn json_wrapped_payload_is_unwrapped() {
        let body = Bytes::from(r#"{"response": "eyJjb2RlIjoiUEFZTUVOVF9TVUNDRVNTIn0="}"#);
        let payload = extract_gateway_payload("phonepe", &body).unwrap();
        assert_eq!(payload, b"eyJjb2RlIjoiUEFZTUVOVF9TVUNDRVNTIn0=");
    }

    #[test]
    fn form_wrapped_payload_is_unwrapped() {
        let body = Bytes::from("response=eyJjb2RlIjoiUEFZTUVOVF9TVUNDRVNTIn0%3D");
        let payload = extract_gateway_payload("phonepe", &body).unwrap();
        assert_eq!(payload, b"eyJjb2RlIjoiUEFZTUVOVF9TVUNDRVNTIn0=");
    }

    #[test]
    fn bare_base64_payload_passes_through() {
        let body = Bytes::from("eyJjb2RlIjoiUEFZTUVOVF9TVUNDRVNTIn0=");
        let payload = extract_gateway_payload("phonepe", &body).unwrap();
        assert_eq!(payload, b"eyJjb2RlIjoiUEFZTUVOVF9TVUNDRVNTIn0=");
    }

    #[test]
    fn checkout_gateway_body_is_passed_raw() {
        let body = Bytes::from(r#"{"event":"payment.captured"}"#);
        let payload = extract_gateway_payload("razorpay", &body).unwrap();
        assert_eq!(payload, br#"{"event":"payment.captured"}"#);
    }

    // --- verify request shapes ---

    #[test]
    fn verify_request_parses_both_shapes() {
        let checkout: VerifyPaymentRequest = serde_json::from_str(
            r#"{"provider_order_id": "order_9", "provider_payment_id": "pay_9", "signature": "s"}"#,
        )
        .unwrap();
        assert!(matches!(checkout, VerifyPaymentRequest::Checkout { .. }));

        let reference: VerifyPaymentRequest =
            serde_json::from_str(r#"{"merchant_transaction_id": "SF_1_abc"}"#).unwrap();
        assert!(matches!(reference, VerifyPaymentRequest::Reference { .. }));
    }
}
