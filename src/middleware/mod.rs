//! HTTP middleware layers
//!
//! Request-id propagation, request logging, and standardized error
//! response formatting shared by every route in the service.

pub mod error;
pub mod logging;
