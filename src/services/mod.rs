//! Services module for business logic and integrations

pub mod payment_orchestrator;
pub mod webhook_processor;

// Re-export orchestrator types
pub use crate::services::payment_orchestrator::{
    ApplyOutcome, CheckoutVerification, InitiationOutcome, OrchestratorConfig, OrchestratorError,
    OrchestratorResult, OrderStatus, OutcomeSource, PaymentOrchestrator, PaymentOutcome,
    PaymentStatus, PollOutcome,
};

// Re-export webhook processor types
pub use crate::services::webhook_processor::{WebhookProcessor, WebhookProcessorError};
