//! Logging setup for the bridge.
//!
//! Structured logging via `tracing`, with noisy library modules filtered
//! down to `warn` so business logs stay readable at `debug`.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Library modules that produce high-volume logs with little business
/// context (connection pools, HTTP/2 frames, TLS handshakes).
pub const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls", "tower_http"];

fn build_filter(log_level: &str) -> EnvFilter {
    // RUST_LOG wins when set
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{module}=warn"));
    }

    EnvFilter::new(&directives)
}

/// Initialize logging.
///
/// `log_format` is either "json" for structured output or anything else
/// for human-readable output.
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = build_filter(log_level);
    let subscriber = tracing_subscriber::registry().with(filter);

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true);
        let _ = subscriber.with(fmt_layer).try_init();
    }

    tracing::info!(
        log_level = %log_level,
        log_format = %log_format,
        "Logging initialized"
    );
}

/// Generate a trace ID for tying an inbound event's logs together.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
