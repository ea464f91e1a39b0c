//! Payment gateway integrations: shared types, signing, the provider trait,
//! and the concrete gateway adapters.

pub mod error;
pub mod factory;
pub mod provider;
pub mod providers;
pub mod signature;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use factory::{PaymentFactoryConfig, PaymentProviderFactory};
pub use provider::PaymentProvider;
pub use types::{
    CheckoutConfirmation, CustomerContact, Money, PaymentMethod, PaymentRequest, PaymentResponse,
    PaymentState, ProviderName, StatusRequest, StatusResponse, WebhookEvent,
    WebhookVerificationResult,
};
