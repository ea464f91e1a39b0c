//! Embedded-checkout gateway adapter.
//!
//! The server creates a gateway order up front; the browser runs the
//! checkout widget against it and comes back with a payment id and an
//! HMAC signature over `"{order_id}|{payment_id}"`. Signature checks alone
//! are never trusted for completion: the payment is fetched from the API
//! and only a `captured` payment counts as money received.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::signature::{verify_hmac_sha256_hex, CheckoutSigner};
use crate::payments::types::{
    CheckoutConfirmation, Money, PaymentMethod, PaymentRequest, PaymentResponse, PaymentState,
    ProviderName, StatusRequest, StatusResponse, WebhookEvent, WebhookVerificationResult,
};
use crate::payments::utils::{HttpAuth, PaymentHttpClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::info;

const DEFAULT_BASE_URL: &str = "https://api.razorpay.com";

#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for RazorpayConfig {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            key_secret: String::new(),
            webhook_secret: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl RazorpayConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let key_id = require_env("RAZORPAY_KEY_ID")?;
        let key_secret = require_env("RAZORPAY_KEY_SECRET")?;

        Ok(Self {
            key_id,
            key_secret,
            webhook_secret: std::env::var("RAZORPAY_WEBHOOK_SECRET").ok(),
            base_url: std::env::var("RAZORPAY_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            timeout_secs: std::env::var("RAZORPAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            max_retries: std::env::var("RAZORPAY_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
        })
    }
}

fn require_env(name: &str) -> PaymentResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PaymentError::ConfigurationError {
            message: format!("{} environment variable is required", name),
        })
}

pub struct RazorpayProvider {
    config: RazorpayConfig,
    signer: CheckoutSigner,
    http: PaymentHttpClient,
}

impl RazorpayProvider {
    pub fn new(config: RazorpayConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(Some(config.timeout_secs), Some(config.max_retries))?;
        let signer = CheckoutSigner::new(config.key_secret.clone());
        Ok(Self {
            config,
            signer,
            http,
        })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(RazorpayConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn auth(&self) -> HttpAuth<'_> {
        HttpAuth::Basic {
            username: &self.config.key_id,
            password: Some(&self.config.key_secret),
        }
    }

    fn map_payment_state(status: &str, captured: Option<bool>) -> PaymentState {
        if captured == Some(true) {
            return PaymentState::Success;
        }
        match status {
            "captured" => PaymentState::Success,
            "created" | "authorized" => PaymentState::Pending,
            "failed" => PaymentState::Failed,
            "refunded" => PaymentState::Refunded,
            _ => PaymentState::Unknown,
        }
    }

    fn map_method(method: Option<&str>) -> Option<PaymentMethod> {
        method.map(|m| match m {
            "upi" => PaymentMethod::Upi,
            "card" => PaymentMethod::Card,
            "netbanking" => PaymentMethod::NetBanking,
            "wallet" => PaymentMethod::Wallet,
            _ => PaymentMethod::Other,
        })
    }

    fn status_from_payment(payment: RazorpayPayment) -> StatusResponse {
        let status = Self::map_payment_state(&payment.status, payment.captured);
        StatusResponse {
            status,
            transaction_reference: payment
                .notes
                .as_ref()
                .and_then(|n| n.get("merchant_transaction_id"))
                .and_then(|v| v.as_str())
                .map(String::from),
            provider_reference: Some(payment.id.clone()),
            amount: Some(Money::from_minor_units(payment.amount, payment.currency)),
            payment_method: Self::map_method(payment.method.as_deref()),
            timestamp: payment
                .created_at
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                .map(|t| t.to_rfc3339()),
            failure_reason: payment.error_description,
            provider_data: Some(serde_json::json!({
                "order_id": payment.order_id,
                "status": payment.status,
                "captured": payment.captured,
            })),
        }
    }

    /// Pick the payment that best describes an order's outcome: a captured
    /// payment wins, then an authorized one, then the latest attempt.
    fn best_payment(mut payments: Vec<RazorpayPayment>) -> Option<RazorpayPayment> {
        if let Some(idx) = payments
            .iter()
            .position(|p| p.captured == Some(true) || p.status == "captured")
        {
            return Some(payments.swap_remove(idx));
        }
        if let Some(idx) = payments.iter().position(|p| p.status == "authorized") {
            return Some(payments.swap_remove(idx));
        }
        payments.pop()
    }
}

#[async_trait]
impl PaymentProvider for RazorpayProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Razorpay
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["INR"]
    }

    async fn initiate_payment(&self, request: &PaymentRequest) -> PaymentResult<PaymentResponse> {
        request.amount.validate_positive("amount")?;
        let amount_minor = request.amount.to_minor_units()?;

        let payload = serde_json::json!({
            "amount": amount_minor,
            "currency": request.amount.currency,
            "receipt": request.order_id,
            "payment_capture": 1,
            "notes": {
                "merchant_transaction_id": request.transaction_reference,
                "order_id": request.order_id,
            },
        });

        let order: RazorpayOrder = self
            .http
            .request_json(
                "razorpay",
                reqwest::Method::POST,
                &self.endpoint("/v1/orders"),
                &[("Content-Type", "application/json")],
                Some(self.auth()),
                Some(&payload),
            )
            .await?;

        info!(
            transaction_reference = %request.transaction_reference,
            provider_order_id = %order.id,
            "checkout order created"
        );

        Ok(PaymentResponse {
            status: PaymentState::Pending,
            transaction_reference: request.transaction_reference.clone(),
            provider_order_id: Some(order.id.clone()),
            provider_reference: None,
            payment_url: None,
            amount: Some(request.amount.clone()),
            provider_data: Some(serde_json::json!({
                // The browser needs the public key id to open the widget.
                "key_id": self.config.key_id,
                "order_id": order.id,
                "order_status": order.status,
            })),
        })
    }

    async fn get_payment_status(&self, request: &StatusRequest) -> PaymentResult<StatusResponse> {
        let reference = request
            .provider_reference
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| PaymentError::ValidationError {
                message: "status lookups need a gateway reference (order_… or pay_…)".to_string(),
                field: Some("provider_reference".to_string()),
            })?;

        if reference.starts_with("pay_") {
            return self.fetch_payment_details(reference).await;
        }

        let list: RazorpayPaymentList = self
            .http
            .request_json(
                "razorpay",
                reqwest::Method::GET,
                &self.endpoint(&format!("/v1/orders/{}/payments", reference)),
                &[],
                Some(self.auth()),
                None,
            )
            .await?;

        match Self::best_payment(list.items) {
            Some(payment) => Ok(Self::status_from_payment(payment)),
            None => Ok(StatusResponse {
                status: PaymentState::Pending,
                transaction_reference: request.transaction_reference.clone(),
                provider_reference: Some(reference.to_string()),
                amount: None,
                payment_method: None,
                timestamp: None,
                failure_reason: None,
                provider_data: Some(serde_json::json!({ "payment_count": 0 })),
            }),
        }
    }

    async fn fetch_payment_details(
        &self,
        provider_payment_id: &str,
    ) -> PaymentResult<StatusResponse> {
        let payment: RazorpayPayment = self
            .http
            .request_json(
                "razorpay",
                reqwest::Method::GET,
                &self.endpoint(&format!("/v1/payments/{}", provider_payment_id)),
                &[],
                Some(self.auth()),
                None,
            )
            .await?;
        Ok(Self::status_from_payment(payment))
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> WebhookVerificationResult {
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .unwrap_or(&self.config.key_secret);
        let valid = verify_hmac_sha256_hex(payload, secret, signature);
        WebhookVerificationResult {
            valid,
            reason: (!valid).then(|| "webhook signature mismatch".to_string()),
        }
    }

    fn verify_checkout_confirmation(
        &self,
        confirmation: &CheckoutConfirmation,
    ) -> PaymentResult<bool> {
        Ok(self.signer.verify(
            &confirmation.provider_order_id,
            &confirmation.provider_payment_id,
            &confirmation.signature,
        ))
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue =
            serde_json::from_slice(payload).map_err(|e| PaymentError::ValidationError {
                message: format!("invalid webhook JSON payload: {}", e),
                field: None,
            })?;

        let event_type = parsed
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let entity = parsed
            .get("payload")
            .and_then(|p| p.get("payment"))
            .and_then(|p| p.get("entity"));
        let provider_reference = entity
            .and_then(|e| e.get("id"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let transaction_reference = entity
            .and_then(|e| e.get("notes"))
            .and_then(|n| n.get("merchant_transaction_id"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let status = entity
            .and_then(|e| e.get("status"))
            .and_then(|v| v.as_str())
            .map(|s| Self::map_payment_state(s, None));

        Ok(WebhookEvent {
            provider: ProviderName::Razorpay,
            event_type,
            transaction_reference,
            provider_reference,
            status,
            payload: parsed,
            received_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayPayment {
    id: String,
    #[serde(default)]
    order_id: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    #[serde(default)]
    captured: Option<bool>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    notes: Option<JsonValue>,
    #[serde(default)]
    created_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RazorpayPaymentList {
    #[allow(dead_code)]
    #[serde(default)]
    count: u32,
    items: Vec<RazorpayPayment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> RazorpayProvider {
        RazorpayProvider::new(RazorpayConfig {
            key_id: "rzp_test_key".to_string(),
            key_secret: "test-key-secret".to_string(),
            webhook_secret: Some("whsec_test".to_string()),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 5,
            max_retries: 1,
        })
        .expect("provider init should succeed")
    }

    fn payment(status: &str, captured: Option<bool>) -> RazorpayPayment {
        RazorpayPayment {
            id: "pay_MkWvYzNqrstuv".to_string(),
            order_id: Some("order_MkWvR2aBCDEfgh".to_string()),
            amount: 49900,
            currency: "INR".to_string(),
            status: status.to_string(),
            captured,
            method: Some("upi".to_string()),
            error_description: None,
            notes: Some(serde_json::json!({
                "merchant_transaction_id": "SF_1700000000000_a1b2c3d4"
            })),
            created_at: Some(1_700_000_000),
        }
    }

    #[test]
    fn payment_states_map_from_gateway_status() {
        assert_eq!(
            RazorpayProvider::map_payment_state("captured", None),
            PaymentState::Success
        );
        assert_eq!(
            RazorpayProvider::map_payment_state("authorized", Some(true)),
            PaymentState::Success
        );
        assert_eq!(
            RazorpayProvider::map_payment_state("authorized", Some(false)),
            PaymentState::Pending
        );
        assert_eq!(
            RazorpayProvider::map_payment_state("created", None),
            PaymentState::Pending
        );
        assert_eq!(
            RazorpayProvider::map_payment_state("failed", None),
            PaymentState::Failed
        );
        assert_eq!(
            RazorpayProvider::map_payment_state("refunded", None),
            PaymentState::Refunded
        );
    }

    #[test]
    fn checkout_confirmation_accepts_valid_signature() {
        let provider = provider();
        let signer = CheckoutSigner::new("test-key-secret");
        let signature = signer
            .sign("order_MkWvR2aBCDEfgh", "pay_MkWvYzNqrstuv")
            .expect("signing should succeed");

        let confirmation = CheckoutConfirmation {
            provider_order_id: "order_MkWvR2aBCDEfgh".to_string(),
            provider_payment_id: "pay_MkWvYzNqrstuv".to_string(),
            signature,
        };
        assert!(provider
            .verify_checkout_confirmation(&confirmation)
            .expect("verification should not error"));
    }

    #[test]
    fn checkout_confirmation_rejects_forged_signature_without_error() {
        let provider = provider();
        let confirmation = CheckoutConfirmation {
            provider_order_id: "order_MkWvR2aBCDEfgh".to_string(),
            provider_payment_id: "pay_MkWvYzNqrstuv".to_string(),
            signature: "invalid_signature".to_string(),
        };
        let verified = provider
            .verify_checkout_confirmation(&confirmation)
            .expect("verification should not error");
        assert!(!verified);
    }

    #[test]
    fn webhook_signature_validation_invalid() {
        let provider = provider();
        let payload = br#"{"event":"payment.captured"}"#;
        let result = provider.verify_webhook(payload, "invalid_signature");
        assert!(!result.valid);
    }

    #[test]
    fn webhook_event_extracts_merchant_transaction_id_from_notes() {
        let provider = provider();
        let payload = serde_json::json!({
            "event": "payment.captured",
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_MkWvYzNqrstuv",
                        "order_id": "order_MkWvR2aBCDEfgh",
                        "status": "captured",
                        "amount": 49900,
                        "currency": "INR",
                        "notes": {
                            "merchant_transaction_id": "SF_1700000000000_a1b2c3d4"
                        }
                    }
                }
            }
        });
        let event = provider
            .parse_webhook_event(payload.to_string().as_bytes())
            .expect("parse should succeed");
        assert_eq!(event.event_type, "payment.captured");
        assert_eq!(
            event.transaction_reference.as_deref(),
            Some("SF_1700000000000_a1b2c3d4")
        );
        assert_eq!(event.provider_reference.as_deref(), Some("pay_MkWvYzNqrstuv"));
        assert_eq!(event.status, Some(PaymentState::Success));
    }

    #[test]
    fn best_payment_prefers_captured_over_failed_attempts() {
        let chosen = RazorpayProvider::best_payment(vec![
            payment("failed", Some(false)),
            payment("captured", Some(true)),
            payment("failed", Some(false)),
        ])
        .expect("a payment should be chosen");
        assert_eq!(chosen.status, "captured");

        let chosen = RazorpayProvider::best_payment(vec![
            payment("failed", Some(false)),
            payment("authorized", Some(false)),
        ])
        .expect("a payment should be chosen");
        assert_eq!(chosen.status, "authorized");

        assert!(RazorpayProvider::best_payment(vec![]).is_none());
    }

    #[test]
    fn captured_payment_maps_to_success_status() {
        let response = RazorpayProvider::status_from_payment(payment("captured", Some(true)));
        assert_eq!(response.status, PaymentState::Success);
        assert_eq!(
            response.transaction_reference.as_deref(),
            Some("SF_1700000000000_a1b2c3d4")
        );
        assert_eq!(
            response.amount.as_ref().map(|m| m.amount.as_str()),
            Some("499.00")
        );
    }
}
