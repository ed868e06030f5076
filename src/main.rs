//! lark-bridge - Main entry point.

use anyhow::Result;
use lark_bridge::config::Config;
use lark_bridge::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("lark-bridge v{}", env!("CARGO_PKG_VERSION"));

    config.validate()?;

    // Start the webhook server and bridge processor
    lark_bridge::start_server(&config).await
}
