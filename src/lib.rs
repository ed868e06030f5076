//! lark-bridge - Feishu/Lark relay bot.
//!
//! Receives chat events from the Feishu Open Platform via webhook event
//! subscriptions, forwards message text to a conversational-AI service,
//! and posts the reply back to the originating chat.
//!
//! ```text
//! Feishu → webhook → bridge → inference service
//!    ↑                  │
//!    └──── reply ───────┘
//! ```
//!
//! Duplicate event deliveries are dropped by a bounded, expiring dedup
//! cache; per-user conversation tokens are kept in a second cache so
//! multi-turn context survives between messages. While an inference call
//! is in flight for more than a few seconds, the user gets an interim
//! "working" notice.

#![warn(clippy::all)]

pub mod bridge;
pub mod cache;
pub mod config;
pub mod inference;
pub mod lark;
pub mod logging;
pub mod message;
pub mod routes;

// Re-export commonly used types
pub use bridge::{InferenceBridge, PARSE_FAILURE_REPLY, SERVICE_FAILURE_PREFIX, WORKING_NOTICE};
pub use cache::{ConversationCache, DedupCache, ExpiringCache};
pub use config::Config;
pub use inference::{Completion, CompletionReply, InferenceClient, InferenceError, DEFAULT_ANSWER};
pub use lark::{Egress, EventOutcome, LarkClient, LarkError};
pub use message::{ChatKind, InboundMessage, MsgType};
pub use routes::{build_router, create_state, AppState};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Interval of the background sweep that clears expired cache entries.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Start the webhook server and the bridge processor; blocks for the
/// process lifetime.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let lark = Arc::new(LarkClient::new(&config.lark));
    let inference = Arc::new(InferenceClient::with_timeout(
        config.inference.endpoint.clone(),
        config.inference.api_key.clone(),
        Duration::from_secs(config.inference.timeout_secs),
    ));

    let bridge = Arc::new(InferenceBridge::new(
        &config.bridge,
        inference,
        lark.clone(),
    ));

    let (state, rx) = create_state(lark);
    let router = build_router(state);

    let processor_handle = InferenceBridge::spawn_processor(bridge.clone(), rx);

    // Periodic sweep so idle caches do not sit on expired entries
    let sweep_bridge = bridge.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let (dedup, conversations) = sweep_bridge.sweep_expired();
            if dedup + conversations > 0 {
                tracing::debug!(dedup, conversations, "Swept expired cache entries");
            }
        }
    });

    tracing::info!("Starting lark-bridge on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    // Clean up on shutdown
    sweep_handle.abort();
    processor_handle.abort();

    Ok(())
}
