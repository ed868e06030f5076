//! Inbound event and reply payload types.

use serde::{Deserialize, Serialize};

/// How the originating chat is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// One-to-one chat; replies are created in the chat by chat_id
    P2p,
    /// Group or any other chat type; replies thread onto the message
    Group,
}

impl ChatKind {
    /// Map the platform's `chat_type` string. Anything that is not "p2p"
    /// is treated as a group chat.
    pub fn from_chat_type(chat_type: &str) -> Self {
        if chat_type == "p2p" {
            Self::P2p
        } else {
            Self::Group
        }
    }
}

/// A structured "message received" event, as delivered by the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform message id (dedup key)
    pub message_id: String,
    /// Chat the message arrived in
    pub chat_id: String,
    /// Addressing mode of the chat
    pub chat_kind: ChatKind,
    /// Sender open_id
    pub user_id: String,
    /// Platform message type ("text", "image", "post", ...)
    pub message_type: String,
    /// Raw JSON-encoded content; text messages carry `{"text": ...}`
    pub content: String,
}

impl InboundMessage {
    /// Extract the text body if this is a text message.
    pub fn text(&self) -> Option<String> {
        if self.message_type != "text" {
            return None;
        }
        let json: serde_json::Value = serde_json::from_str(&self.content).ok()?;
        json.get("text").and_then(|t| t.as_str()).map(String::from)
    }
}

/// Message type tag accepted by both egress operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Text,
    /// Rich-text "post" block
    Post,
}

impl MsgType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Post => "post",
        }
    }
}

/// Build the JSON-encoded content body for a plain text reply.
pub fn text_content(text: &str) -> String {
    serde_json::json!({ "text": text }).to_string()
}

/// Build the JSON-encoded content body for a single rich-text "post" block.
pub fn post_content(title: &str, text: &str) -> String {
    serde_json::json!({
        "zh_cn": {
            "title": title,
            "content": [[{ "tag": "text", "text": text }]]
        }
    })
    .to_string()
}
