use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CheckoutConfirmation, PaymentRequest, PaymentResponse, ProviderName, StatusRequest,
    StatusResponse, WebhookEvent, WebhookVerificationResult,
};
use async_trait::async_trait;

/// The seam between the orchestration layer and a concrete payment gateway.
///
/// Every adapter owns its wire formats and signing; callers only ever see
/// the shared request/response types. Status lookups must be idempotent and
/// side-effect free so reconciliation can call them repeatedly.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    fn supported_currencies(&self) -> &'static [&'static str];

    /// Start a payment attempt. Depending on the gateway this yields either
    /// a hosted page URL or a provider order id for embedded checkout.
    async fn initiate_payment(&self, request: &PaymentRequest) -> PaymentResult<PaymentResponse>;

    /// Query the current state of a payment attempt.
    async fn get_payment_status(&self, request: &StatusRequest) -> PaymentResult<StatusResponse>;

    /// Fetch a single payment by the gateway's own payment id. Used for
    /// capture confirmation after signature checks pass.
    async fn fetch_payment_details(&self, provider_payment_id: &str)
        -> PaymentResult<StatusResponse>;

    /// Check the signature on a raw push notification body.
    fn verify_webhook(&self, payload: &[u8], signature: &str) -> WebhookVerificationResult;

    /// Check the signature a browser hands back after embedded checkout.
    fn verify_checkout_confirmation(
        &self,
        confirmation: &CheckoutConfirmation,
    ) -> PaymentResult<bool>;

    /// Decode a verified push notification into a normalized event.
    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent>;
}
