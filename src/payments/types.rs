use crate::payments::error::PaymentError;
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderName {
    #[serde(rename = "phonepe")]
    PhonePe,
    #[serde(rename = "razorpay")]
    Razorpay,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::PhonePe => "phonepe",
            ProviderName::Razorpay => "razorpay",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "phonepe" | "phone-pe" => Ok(ProviderName::PhonePe),
            "razorpay" => Ok(ProviderName::Razorpay),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

/// A decimal monetary amount with its currency, kept as a string until the
/// last moment so no binary floating point ever touches it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    pub amount: String,
    pub currency: String,
}

impl Money {
    pub fn new(amount: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            amount: amount.into(),
            currency: currency.into(),
        }
    }

    pub fn validate_positive(&self, field: &str) -> Result<(), PaymentError> {
        let parsed =
            BigDecimal::from_str(&self.amount).map_err(|_| PaymentError::ValidationError {
                message: format!("invalid decimal amount: {}", self.amount),
                field: Some(field.to_string()),
            })?;
        if parsed <= BigDecimal::from(0) {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        if self.currency.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "currency is required".to_string(),
                field: Some("currency".to_string()),
            });
        }
        Ok(())
    }

    /// Convert to the gateway's integer minor units (paise for INR).
    ///
    /// The amount is scaled by 100 and rounded to the nearest minor unit.
    /// Non-positive amounts are rejected before any request is built.
    pub fn to_minor_units(&self) -> Result<i64, PaymentError> {
        let parsed =
            BigDecimal::from_str(&self.amount).map_err(|_| PaymentError::InvalidAmount {
                amount: self.amount.clone(),
                reason: "not a valid decimal number".to_string(),
            })?;
        if parsed <= BigDecimal::from(0) {
            return Err(PaymentError::InvalidAmount {
                amount: self.amount.clone(),
                reason: "amount must be greater than zero".to_string(),
            });
        }

        let scaled = (parsed * BigDecimal::from(100)).with_scale_round(0, RoundingMode::HalfUp);
        scaled.to_i64().ok_or_else(|| PaymentError::InvalidAmount {
            amount: self.amount.clone(),
            reason: "amount out of representable range".to_string(),
        })
    }

    /// Build a `Money` back from gateway minor units, normalized to two
    /// decimal places.
    pub fn from_minor_units(minor_units: i64, currency: impl Into<String>) -> Self {
        let decimal = (BigDecimal::from(minor_units) / BigDecimal::from(100)).with_scale(2);
        Self {
            amount: decimal.to_string(),
            currency: currency.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Upi,
    Card,
    NetBanking,
    Wallet,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
    Refunded,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerContact {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Money,
    pub customer: CustomerContact,
    /// Store-side order this attempt pays for (used as the receipt label).
    pub order_id: String,
    /// Merchant transaction id; the gateways key idempotency off this value.
    pub transaction_reference: String,
    /// Browser return URL after the hosted payment page.
    pub redirect_url: Option<String>,
    /// Server-to-server notification URL.
    pub callback_url: Option<String>,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    pub transaction_reference: Option<String>,
    pub provider_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub status: PaymentState,
    pub transaction_reference: String,
    /// Gateway-side order id (embedded checkout flows).
    pub provider_order_id: Option<String>,
    /// Gateway-side transaction/payment id, when already known.
    pub provider_reference: Option<String>,
    /// Hosted payment page URL (redirect flows).
    pub payment_url: Option<String>,
    pub amount: Option<Money>,
    pub provider_data: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: PaymentState,
    pub transaction_reference: Option<String>,
    pub provider_reference: Option<String>,
    pub amount: Option<Money>,
    pub payment_method: Option<PaymentMethod>,
    pub timestamp: Option<String>,
    pub failure_reason: Option<String>,
    pub provider_data: Option<JsonValue>,
}

/// What the browser hands back after an embedded checkout completes:
/// the gateway order id, the payment id, and the signature over both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutConfirmation {
    pub provider_order_id: String,
    pub provider_payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub provider: ProviderName,
    pub event_type: String,
    /// Merchant transaction id extracted from the payload, when present.
    pub transaction_reference: Option<String>,
    /// Gateway-side payment id extracted from the payload, when present.
    pub provider_reference: Option<String>,
    pub status: Option<PaymentState>,
    pub payload: JsonValue,
    pub received_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_unit_conversion_scales_by_hundred() {
        let money = Money::new("499.00", "INR");
        assert_eq!(money.to_minor_units().unwrap(), 49900);

        let money = Money::new("10", "INR");
        assert_eq!(money.to_minor_units().unwrap(), 1000);

        let money = Money::new("0.01", "INR");
        assert_eq!(money.to_minor_units().unwrap(), 1);
    }

    #[test]
    fn minor_unit_conversion_rounds_to_nearest() {
        assert_eq!(Money::new("1.005", "INR").to_minor_units().unwrap(), 101);
        assert_eq!(Money::new("1.004", "INR").to_minor_units().unwrap(), 100);
        assert_eq!(Money::new("2.999", "INR").to_minor_units().unwrap(), 300);
    }

    #[test]
    fn minor_unit_conversion_rejects_non_positive_amounts() {
        assert!(Money::new("0", "INR").to_minor_units().is_err());
        assert!(Money::new("0.00", "INR").to_minor_units().is_err());
        assert!(Money::new("-499.00", "INR").to_minor_units().is_err());
        assert!(Money::new("not-a-number", "INR").to_minor_units().is_err());
    }

    #[test]
    fn minor_units_round_trip_to_two_decimal_places() {
        let money = Money::from_minor_units(49900, "INR");
        assert_eq!(money.amount, "499.00");
        assert_eq!(money.to_minor_units().unwrap(), 49900);

        let money = Money::from_minor_units(1, "INR");
        assert_eq!(money.amount, "0.01");
    }

    #[test]
    fn provider_name_round_trips_through_serde() {
        let json = serde_json::to_string(&ProviderName::PhonePe).unwrap();
        assert_eq!(json, "\"phonepe\"");
        let parsed: ProviderName = serde_json::from_str("\"razorpay\"").unwrap();
        assert_eq!(parsed, ProviderName::Razorpay);
    }

    #[test]
    fn payment_request_serializes_to_json() {
        let request = PaymentRequest {
            amount: Money::new("499.00", "INR"),
            customer: CustomerContact {
                email: Some("buyer@example.com".to_string()),
                phone: Some("+919812345678".to_string()),
            },
            order_id: "ord_1".to_string(),
            transaction_reference: "SF_1700000000000_a1b2c3d4".to_string(),
            redirect_url: Some("https://shop.example.com/payments/callback".to_string()),
            callback_url: Some("https://shop.example.com/payments/callback".to_string()),
            metadata: Some(serde_json::json!({"user_id":"u1"})),
        };
        let json = serde_json::to_value(&request).expect("serialization should succeed");
        assert_eq!(json["amount"]["currency"], "INR");
        assert_eq!(json["transaction_reference"], "SF_1700000000000_a1b2c3d4");
    }

    #[test]
    fn status_response_deserializes_from_json() {
        let payload = serde_json::json!({
            "status": "success",
            "transaction_reference": "SF_1700000000000_a1b2c3d4",
            "provider_reference": "pay_MkWvR2aBCDEfgh",
            "amount": {"amount":"499.00","currency":"INR"},
            "payment_method": "upi",
            "timestamp": "2026-02-12T00:00:00Z",
            "failure_reason": null,
            "provider_data": {"key":"value"}
        });
        let parsed: StatusResponse =
            serde_json::from_value(payload).expect("deserialization should succeed");
        assert_eq!(parsed.status, PaymentState::Success);
        assert_eq!(
            parsed.provider_reference.as_deref(),
            Some("pay_MkWvR2aBCDEfgh")
        );
    }
}
