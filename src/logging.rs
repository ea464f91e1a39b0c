//! Tracing initialization
//!
//! Sets up the global `tracing` subscriber. Filtering comes from
//! `RUST_LOG` when set, falling back to `LOG_LEVEL` (default `info`).
//! `LOG_FORMAT=json` switches to newline-delimited JSON output for
//! log aggregation; anything else keeps the human-readable format.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Safe to call once at startup; later calls are ignored so tests that
/// initialize logging do not panic.
pub fn init_tracing() {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase()));

    let json_output = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json_output {
        let _ = fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .with_target(true)
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    }
}
