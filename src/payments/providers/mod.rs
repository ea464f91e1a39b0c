//! Concrete gateway adapters

pub mod phonepe;
pub mod razorpay;

pub use phonepe::{PhonePeConfig, PhonePeProvider};
pub use razorpay::{RazorpayConfig, RazorpayProvider};
