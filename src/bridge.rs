//! The message bridge.
//!
//! Handles the complete flow for one inbound event:
//! 1. Drop duplicate deliveries via the dedup cache
//! 2. Reject non-text content with a usage hint (no inference call)
//! 3. Race the inference call against a delayed "working" notice
//! 4. Keep per-user conversation continuity through the affinity cache
//! 5. Dispatch exactly one final reply, addressed by chat kind
//!
//! Each event is processed in its own task; handling one message never
//! blocks another.

use crate::cache::{ConversationCache, DedupCache};
use crate::config::BridgeConfig;
use crate::inference::Completion;
use crate::lark::Egress;
use crate::message::{text_content, ChatKind, InboundMessage, MsgType};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Interim notice sent when the inference call outlasts the delay.
pub const WORKING_NOTICE: &str = "Still working on it, please wait a moment...";

/// Reply for inbound content we cannot parse (images, stickers, ...).
pub const PARSE_FAILURE_REPLY: &str =
    "Could not parse the message, please send a text message.";

/// Prefix of the user-visible reply when the inference call fails.
pub const SERVICE_FAILURE_PREFIX: &str = "Assistant service call failed: ";

/// Orchestrates dedup, inference and reply dispatch.
pub struct InferenceBridge {
    dedup: DedupCache,
    conversations: ConversationCache,
    inference: Arc<dyn Completion>,
    egress: Arc<dyn Egress>,
    notice_delay: Duration,
}

impl InferenceBridge {
    pub fn new(
        config: &BridgeConfig,
        inference: Arc<dyn Completion>,
        egress: Arc<dyn Egress>,
    ) -> Self {
        Self {
            dedup: DedupCache::new(
                config.dedup_capacity,
                Duration::from_secs(config.dedup_ttl_secs),
            ),
            conversations: ConversationCache::new(
                config.conversation_capacity,
                Duration::from_secs(config.conversation_ttl_secs),
            ),
            inference,
            egress,
            notice_delay: Duration::from_secs(config.notice_delay_secs),
        }
    }

    /// Process one inbound event end to end.
    ///
    /// An egress dispatch failure is the terminal fault for this message's
    /// processing path; it propagates to the caller and is not retried.
    pub async fn process(&self, msg: InboundMessage) -> Result<()> {
        if self.dedup.seen_or_mark(&msg.message_id) {
            tracing::debug!(message_id = %msg.message_id, "Duplicate delivery, skipping");
            return Ok(());
        }

        let reply_text = match msg.text() {
            Some(text) => self.answer(&msg, &text).await,
            None => {
                tracing::debug!(
                    message_id = %msg.message_id,
                    message_type = %msg.message_type,
                    "Non-text message, replying with usage hint"
                );
                PARSE_FAILURE_REPLY.to_string()
            }
        };

        self.dispatch(&msg, &reply_text).await
    }

    /// Run the inference call, racing it against the delayed notice.
    ///
    /// Never fails: inference errors become the user-visible reply text.
    async fn answer(&self, msg: &InboundMessage, text: &str) -> String {
        let notice = self.spawn_working_notice(msg);
        let token = self.conversations.get(&msg.user_id);

        let result = self.inference.complete(text, &msg.user_id, &token).await;

        // While the notice task is still parked in its sleep, abort keeps
        // the send from ever starting. If it already woke, both the notice
        // and the reply may go out; that narrow race is tolerated.
        notice.abort();

        match result {
            Ok(reply) => {
                if let Some(ref conversation_id) = reply.conversation_id {
                    self.conversations.set(&msg.user_id, conversation_id);
                }
                reply.answer
            }
            Err(e) => {
                tracing::error!(
                    message_id = %msg.message_id,
                    error = %e,
                    "Inference call failed"
                );
                format!("{SERVICE_FAILURE_PREFIX}{e}")
            }
        }
    }

    /// Spawn the one-shot delayed "working" notice for this interaction.
    fn spawn_working_notice(&self, msg: &InboundMessage) -> JoinHandle<()> {
        let egress = self.egress.clone();
        let delay = self.notice_delay;
        let chat_kind = msg.chat_kind;
        let chat_id = msg.chat_id.clone();
        let message_id = msg.message_id.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let content = text_content(WORKING_NOTICE);
            let result = match chat_kind {
                ChatKind::P2p => egress.create_message(&chat_id, MsgType::Text, &content).await,
                ChatKind::Group => {
                    egress.reply_message(&message_id, MsgType::Text, &content).await
                }
            };

            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to send working notice");
            }
        })
    }

    /// Dispatch the final reply through the egress path matching the chat.
    async fn dispatch(&self, msg: &InboundMessage, reply_text: &str) -> Result<()> {
        let content = text_content(reply_text);
        match msg.chat_kind {
            ChatKind::P2p => self
                .egress
                .create_message(&msg.chat_id, MsgType::Text, &content)
                .await
                .with_context(|| format!("create_message failed for chat {}", msg.chat_id))?,
            ChatKind::Group => self
                .egress
                .reply_message(&msg.message_id, MsgType::Text, &content)
                .await
                .with_context(|| format!("reply_message failed for message {}", msg.message_id))?,
        }
        Ok(())
    }

    /// Sweep expired entries from both caches.
    ///
    /// Returns (dedup removed, conversations removed).
    pub fn sweep_expired(&self) -> (usize, usize) {
        (
            self.dedup.cleanup_expired(),
            self.conversations.cleanup_expired(),
        )
    }

    /// Start the background processor draining the ingress channel.
    ///
    /// Every message gets its own task.
    pub fn spawn_processor(
        bridge: Arc<Self>,
        mut rx: mpsc::Receiver<InboundMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Bridge processor started");

            while let Some(msg) = rx.recv().await {
                let bridge = bridge.clone();

                tokio::spawn(async move {
                    let message_id = msg.message_id.clone();
                    if let Err(e) = bridge.process(msg).await {
                        tracing::error!(
                            message_id = %message_id,
                            error = %e,
                            "Failed to process message"
                        );
                    }
                });
            }

            tracing::info!("Bridge processor stopped");
        })
    }
}
