//! Hosted-redirect gateway adapter.
//!
//! Every call is signed with an `X-VERIFY` header: the SHA-256 of the base64
//! request body, the endpoint path, and the salt key, suffixed with the salt
//! index. Callbacks arrive as a base64 JSON document signed the same way
//! (with an empty path), so the adapter can authenticate a push without any
//! transport-level secret.

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::signature::XVerifySigner;
use crate::payments::types::{
    CheckoutConfirmation, Money, PaymentMethod, PaymentRequest, PaymentResponse, PaymentState,
    ProviderName, StatusRequest, StatusResponse, WebhookEvent, WebhookVerificationResult,
};
use crate::payments::utils::PaymentHttpClient;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

const SANDBOX_BASE_URL: &str = "https://api-preprod.phonepe.com/apis/pg-sandbox";
const PRODUCTION_BASE_URL: &str = "https://api.phonepe.com/apis/hermes";
const PAY_PATH: &str = "/pg/v1/pay";
/// Hosted page sessions expire after this many seconds.
const EXPIRE_AFTER_SECS: u64 = 1800;

#[derive(Debug, Clone)]
pub struct PhonePeConfig {
    pub merchant_id: String,
    pub salt_key: String,
    pub salt_index: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for PhonePeConfig {
    fn default() -> Self {
        Self {
            merchant_id: String::new(),
            salt_key: String::new(),
            salt_index: "1".to_string(),
            base_url: SANDBOX_BASE_URL.to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl PhonePeConfig {
    /// Read credentials from the environment. Missing credentials are a
    /// deploy-time mistake and fail loudly rather than at the first payment.
    pub fn from_env() -> PaymentResult<Self> {
        let merchant_id = require_env("PHONEPE_MERCHANT_ID")?;
        let salt_key = require_env("PHONEPE_SALT_KEY")?;
        let salt_index = require_env("PHONEPE_SALT_INDEX")?;

        let environment =
            std::env::var("PHONEPE_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string());
        let base_url = Self::base_url_for(&environment)?.to_string();

        Ok(Self {
            merchant_id,
            salt_key,
            salt_index,
            base_url,
            timeout_secs: std::env::var("PHONEPE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            max_retries: std::env::var("PHONEPE_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
        })
    }

    fn base_url_for(environment: &str) -> PaymentResult<&'static str> {
        match environment.to_lowercase().as_str() {
            "production" | "prod" => Ok(PRODUCTION_BASE_URL),
            "sandbox" | "uat" | "preprod" => Ok(SANDBOX_BASE_URL),
            other => Err(PaymentError::ConfigurationError {
                message: format!(
                    "PHONEPE_ENVIRONMENT must be sandbox or production, got: {}",
                    other
                ),
            }),
        }
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

pub struct PhonePeProvider {
    config: PhonePeConfig,
    signer: XVerifySigner,
    http: PaymentHttpClient,
}

impl PhonePeProvider {
    pub fn new(config: PhonePeConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(Some(config.timeout_secs), Some(config.max_retries))?;
        let signer = XVerifySigner::new(config.salt_key.clone(), config.salt_index.clone());
        Ok(Self {
            config,
            signer,
            http,
        })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(PhonePeConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn status_path(&self, transaction_reference: &str) -> String {
        format!(
            "/pg/v1/status/{}/{}",
            self.config.merchant_id, transaction_reference
        )
    }

    fn map_state(code: &str) -> PaymentState {
        match code {
            "PAYMENT_SUCCESS" => PaymentState::Success,
            "PAYMENT_PENDING" | "PAYMENT_INITIATED" => PaymentState::Pending,
            "PAYMENT_ERROR" | "PAYMENT_DECLINED" | "TIMED_OUT" => PaymentState::Failed,
            "PAYMENT_CANCELLED" => PaymentState::Cancelled,
            _ => PaymentState::Unknown,
        }
    }

    fn map_instrument(instrument_type: Option<&str>) -> Option<PaymentMethod> {
        instrument_type.map(|t| match t {
            "UPI" => PaymentMethod::Upi,
            "CARD" | "DEBIT_CARD" | "CREDIT_CARD" => PaymentMethod::Card,
            "NETBANKING" => PaymentMethod::NetBanking,
            "WALLET" => PaymentMethod::Wallet,
            _ => PaymentMethod::Other,
        })
    }

    fn status_from_envelope(
        &self,
        envelope: PhonePeEnvelope<PhonePeStatusData>,
        transaction_reference: &str,
    ) -> StatusResponse {
        let status = Self::map_state(&envelope.code);
        let data = envelope.data;
        StatusResponse {
            status,
            transaction_reference: Some(transaction_reference.to_string()),
            provider_reference: data.as_ref().and_then(|d| d.transaction_id.clone()),
            amount: data
                .as_ref()
                .and_then(|d| d.amount)
                .map(|minor| Money::from_minor_units(minor, "INR")),
            payment_method: data.as_ref().and_then(|d| {
                Self::map_instrument(
                    d.payment_instrument
                        .as_ref()
                        .and_then(|i| i.instrument_type.as_deref()),
                )
            }),
            timestamp: None,
            failure_reason: (!envelope.success).then(|| envelope.message.clone()),
            provider_data: Some(serde_json::json!({
                "code": envelope.code,
                "message": envelope.message,
            })),
        }
    }
}

#[async_trait]
impl PaymentProvider for PhonePeProvider {
    fn name(&self) -> ProviderName {
        ProviderName::PhonePe
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["INR"]
    }

    async fn initiate_payment(&self, request: &PaymentRequest) -> PaymentResult<PaymentResponse> {
        request.amount.validate_positive("amount")?;
        let amount_minor = request.amount.to_minor_units()?;

        let redirect_url =
            request
                .redirect_url
                .as_deref()
                .ok_or_else(|| PaymentError::ValidationError {
                    message: "redirect_url is required for hosted checkout".to_string(),
                    field: Some("redirect_url".to_string()),
                })?;
        let callback_url = request.callback_url.as_deref().unwrap_or(redirect_url);

        let payload = serde_json::json!({
            "merchantId": self.config.merchant_id,
            "merchantTransactionId": request.transaction_reference,
            "merchantUserId": request
                .metadata
                .as_ref()
                .and_then(|m| m.get("user_id"))
                .and_then(|v| v.as_str())
                .unwrap_or("guest"),
            "amount": amount_minor,
            "redirectUrl": redirect_url,
            "redirectMode": "REDIRECT",
            "callbackUrl": callback_url,
            "mobileNumber": request.customer.phone,
            "paymentInstrument": { "type": "PAY_PAGE" },
            "expireAfter": EXPIRE_AFTER_SECS,
        });
        let base64_payload = BASE64.encode(payload.to_string());
        let x_verify = self.signer.sign(&base64_payload, PAY_PATH);

        let body = serde_json::json!({ "request": base64_payload });
        let raw_body: JsonValue = self
            .http
            .request_json(
                "phonepe",
                reqwest::Method::POST,
                &self.endpoint(PAY_PATH),
                &[
                    ("Content-Type", "application/json"),
                    ("X-VERIFY", &x_verify),
                ],
                None,
                Some(&body),
            )
            .await?;
        let raw: PhonePeEnvelope<PhonePePayData> = serde_json::from_value(raw_body.clone())
            .map_err(|e| PaymentError::GatewayUnavailable {
                provider: "phonepe".to_string(),
                message: format!("malformed pay response ({}): {}", e, raw_body),
                retryable: false,
            })?;

        // A 2xx envelope that declines the request, or one without a
        // redirect URL, is a semantic rejection; preserve what came back.
        let redirect = raw
            .data
            .as_ref()
            .and_then(|d| d.instrument_response.as_ref())
            .and_then(|r| r.redirect_info.as_ref())
            .map(|info| info.url.clone());
        let (provider_reference, redirect) = match (raw.success, redirect) {
            (true, Some(url)) => (
                raw.data.as_ref().and_then(|d| d.transaction_id.clone()),
                url,
            ),
            _ => {
                return Err(PaymentError::GatewayRejected {
                    provider: "phonepe".to_string(),
                    message: format!("{}: {}", raw.code, raw.message),
                    raw_response: Some(raw_body.to_string()),
                });
            }
        };

        info!(
            transaction_reference = %request.transaction_reference,
            "hosted payment page created"
        );

        Ok(PaymentResponse {
            status: PaymentState::Pending,
            transaction_reference: request.transaction_reference.clone(),
            provider_order_id: None,
            provider_reference,
            payment_url: Some(redirect),
            amount: Some(request.amount.clone()),
            provider_data: Some(serde_json::json!({
                "code": raw.code,
                "expires_in_secs": EXPIRE_AFTER_SECS,
            })),
        })
    }

    async fn get_payment_status(&self, request: &StatusRequest) -> PaymentResult<StatusResponse> {
        let reference = request
            .transaction_reference
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| PaymentError::ValidationError {
                message: "transaction_reference is required for a status check".to_string(),
                field: Some("transaction_reference".to_string()),
            })?;

        // Status requests carry no body; the signature covers the path alone.
        let path = self.status_path(reference);
        let x_verify = self.signer.sign("", &path);

        let raw: PhonePeEnvelope<PhonePeStatusData> = self
            .http
            .request_json(
                "phonepe",
                reqwest::Method::GET,
                &self.endpoint(&path),
                &[
                    ("Content-Type", "application/json"),
                    ("X-VERIFY", &x_verify),
                    ("X-MERCHANT-ID", &self.config.merchant_id),
                ],
                None,
                None,
            )
            .await?;

        Ok(self.status_from_envelope(raw, reference))
    }

    async fn fetch_payment_details(
        &self,
        provider_payment_id: &str,
    ) -> PaymentResult<StatusResponse> {
        // The status API is keyed by merchant transaction id, not the
        // gateway's own id; there is no per-payment lookup to offer here.
        Err(PaymentError::ValidationError {
            message: format!(
                "phonepe has no payment lookup by provider id ({}); use a status check",
                provider_payment_id
            ),
            field: Some("provider_payment_id".to_string()),
        })
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> WebhookVerificationResult {
        let base64_payload = String::from_utf8_lossy(payload);
        let valid = self.signer.verify(base64_payload.trim(), "", signature);
        WebhookVerificationResult {
            valid,
            reason: (!valid).then(|| "X-VERIFY signature mismatch".to_string()),
        }
    }

    fn verify_checkout_confirmation(
        &self,
        _confirmation: &CheckoutConfirmation,
    ) -> PaymentResult<bool> {
        Err(PaymentError::ValidationError {
            message: "phonepe does not use checkout confirmations".to_string(),
            field: Some("provider".to_string()),
        })
    }

    /// Decode a callback body. The payload here is the base64 string the
    /// gateway posted (already signature-checked by `verify_webhook`).
    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let base64_payload = String::from_utf8_lossy(payload);
        let decoded = BASE64
            .decode(base64_payload.trim().as_bytes())
            .map_err(|e| PaymentError::ValidationError {
                message: format!("callback payload is not valid base64: {}", e),
                field: Some("response".to_string()),
            })?;
        let parsed: JsonValue =
            serde_json::from_slice(&decoded).map_err(|e| PaymentError::ValidationError {
                message: format!("callback payload is not valid JSON: {}", e),
                field: Some("response".to_string()),
            })?;

        let code = parsed.get("code").and_then(|v| v.as_str()).unwrap_or("");
        let data = parsed.get("data");
        let transaction_reference = data
            .and_then(|d| d.get("merchantTransactionId"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let provider_reference = data
            .and_then(|d| d.get("transactionId"))
            .and_then(|v| v.as_str())
            .map(String::from);

        if transaction_reference.is_none() {
            warn!(code = %code, "callback payload carries no merchant transaction id");
        }

        Ok(WebhookEvent {
            provider: ProviderName::PhonePe,
            event_type: code.to_string(),
            transaction_reference,
            provider_reference,
            status: Some(Self::map_state(code)),
            payload: parsed,
            received_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PhonePeEnvelope<T> {
    success: bool,
    code: String,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePePayData {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    instrument_response: Option<PhonePeInstrumentResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePeInstrumentResponse {
    #[serde(default)]
    redirect_info: Option<PhonePeRedirectInfo>,
}

#[derive(Debug, Deserialize)]
struct PhonePeRedirectInfo {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePeStatusData {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    payment_instrument: Option<PhonePeInstrument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePeInstrument {
    #[serde(rename = "type")]
    #[serde(default)]
    instrument_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> PhonePeProvider {
        PhonePeProvider::new(PhonePeConfig {
            merchant_id: "MERCHANTUAT".to_string(),
            salt_key: "test-salt-key".to_string(),
            salt_index: "1".to_string(),
            base_url: SANDBOX_BASE_URL.to_string(),
            timeout_secs: 5,
            max_retries: 1,
        })
        .expect("provider init should succeed")
    }

    fn callback_body(code: &str) -> (String, String) {
        let payload = serde_json::json!({
            "success": code == "PAYMENT_SUCCESS",
            "code": code,
            "message": "test",
            "data": {
                "merchantId": "MERCHANTUAT",
                "merchantTransactionId": "SF_1700000000000_a1b2c3d4",
                "transactionId": "T2401151324",
                "amount": 49900
            }
        });
        let encoded = BASE64.encode(payload.to_string());
        let signer = XVerifySigner::new("test-salt-key", "1");
        let signature = signer.sign(&encoded, "");
        (encoded, signature)
    }

    #[test]
    fn status_codes_map_to_payment_states() {
        assert_eq!(
            PhonePeProvider::map_state("PAYMENT_SUCCESS"),
            PaymentState::Success
        );
        assert_eq!(
            PhonePeProvider::map_state("PAYMENT_PENDING"),
            PaymentState::Pending
        );
        assert_eq!(
            PhonePeProvider::map_state("PAYMENT_ERROR"),
            PaymentState::Failed
        );
        assert_eq!(
            PhonePeProvider::map_state("PAYMENT_DECLINED"),
            PaymentState::Failed
        );
        assert_eq!(PhonePeProvider::map_state("TIMED_OUT"), PaymentState::Failed);
        assert_eq!(
            PhonePeProvider::map_state("PAYMENT_CANCELLED"),
            PaymentState::Cancelled
        );
        assert_eq!(
            PhonePeProvider::map_state("SOMETHING_NEW"),
            PaymentState::Unknown
        );
    }

    #[test]
    fn callback_verification_accepts_signed_payload() {
        let provider = provider();
        let (encoded, signature) = callback_body("PAYMENT_SUCCESS");
        let result = provider.verify_webhook(encoded.as_bytes(), &signature);
        assert!(result.valid);
    }

    #[test]
    fn callback_verification_rejects_forged_signature() {
        let provider = provider();
        let (encoded, _) = callback_body("PAYMENT_SUCCESS");
        let result = provider.verify_webhook(encoded.as_bytes(), "invalid_signature###1");
        assert!(!result.valid);
        assert!(result.reason.is_some());
    }

    #[test]
    fn callback_parsing_extracts_transaction_ids() {
        let provider = provider();
        let (encoded, _) = callback_body("PAYMENT_SUCCESS");
        let event = provider
            .parse_webhook_event(encoded.as_bytes())
            .expect("parse should succeed");
        assert_eq!(
            event.transaction_reference.as_deref(),
            Some("SF_1700000000000_a1b2c3d4")
        );
        assert_eq!(event.provider_reference.as_deref(), Some("T2401151324"));
        assert_eq!(event.status, Some(PaymentState::Success));
        assert_eq!(event.event_type, "PAYMENT_SUCCESS");
    }

    #[test]
    fn callback_parsing_rejects_garbage() {
        let provider = provider();
        assert!(provider.parse_webhook_event(b"not base64 at all!").is_err());
        let not_json = BASE64.encode("plain text");
        assert!(provider.parse_webhook_event(not_json.as_bytes()).is_err());
    }

    #[test]
    fn checkout_confirmation_is_not_supported() {
        let provider = provider();
        let confirmation = CheckoutConfirmation {
            provider_order_id: "order_x".to_string(),
            provider_payment_id: "pay_x".to_string(),
            signature: "sig".to_string(),
        };
        assert!(provider.verify_checkout_confirmation(&confirmation).is_err());
    }

    #[test]
    fn envelope_tolerates_missing_message_and_data() {
        let rejected: PhonePeEnvelope<PhonePePayData> = serde_json::from_str(
            r#"{"success": false, "code": "BAD_REQUEST"}"#,
        )
        .expect("envelope without data should decode");
        assert!(!rejected.success);
        assert!(rejected.data.is_none());

        let status: PhonePeEnvelope<PhonePeStatusData> = serde_json::from_str(
            r#"{"success": true, "code": "PAYMENT_SUCCESS", "message": "ok",
                "data": {"transactionId": "T1", "amount": 49900}}"#,
        )
        .expect("envelope with data should decode");
        let data = status.data.expect("data should be present");
        assert_eq!(data.transaction_id.as_deref(), Some("T1"));
        assert_eq!(data.amount, Some(49900));
    }

    #[test]
    fn status_path_includes_merchant_and_transaction() {
        let provider = provider();
        assert_eq!(
            provider.status_path("SF_1_abc"),
            "/pg/v1/status/MERCHANTUAT/SF_1_abc"
        );
    }

    #[test]
    fn config_rejects_unknown_environment() {
        assert!(PhonePeConfig::base_url_for("staging").is_err());
        assert_eq!(
            PhonePeConfig::base_url_for("production").unwrap(),
            PRODUCTION_BASE_URL
        );
        assert_eq!(
            PhonePeConfig::base_url_for("Sandbox").unwrap(),
            SANDBOX_BASE_URL
        );
    }
}
