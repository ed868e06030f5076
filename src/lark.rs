//! Feishu/Lark platform adapter.
//!
//! Uses the Feishu Open Platform Bot API for outbound messages and parses
//! event-subscription callbacks for inbound ones. Supports both Feishu
//! (China) and Lark (International) hosts, and AES-256-CBC decryption for
//! encrypted event payloads.

use crate::config::LarkConfig;
use crate::message::{ChatKind, InboundMessage, MsgType};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// ============================================================================
// Constants
// ============================================================================

const FEISHU_API_BASE: &str = "https://open.feishu.cn/open-apis";
const LARK_API_BASE: &str = "https://open.larksuite.com/open-apis";
const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;

/// Header carrying the platform request trace id.
const LOG_ID_HEADER: &str = "x-tt-logid";

// ============================================================================
// Errors
// ============================================================================

/// Platform adapter error.
#[derive(Debug, thiserror::Error)]
pub enum LarkError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API call failed, code: {code}, msg: {msg}, log_id: {}", .log_id.as_deref().unwrap_or("-"))]
    Api {
        code: i32,
        msg: String,
        log_id: Option<String>,
    },

    #[error("Invalid event payload: {0}")]
    InvalidEvent(String),
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TenantAccessTokenResponse {
    code: i32,
    msg: String,
    tenant_access_token: Option<String>,
    expire: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    code: i32,
    msg: String,
}

// ============================================================================
// Event Callback Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EventCallback {
    pub schema: Option<String>,
    pub header: Option<EventHeader>,
    pub event: Option<serde_json::Value>,
    pub challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventHeader {
    pub event_id: String,
    pub event_type: String,
    pub create_time: String,
    pub token: Option<String>,
    pub app_id: String,
    pub tenant_key: String,
}

#[derive(Debug, Deserialize)]
struct MessageReceiveEvent {
    sender: MessageSender,
    message: EventMessage,
}

#[derive(Debug, Deserialize)]
struct MessageSender {
    sender_id: SenderIds,
}

#[derive(Debug, Deserialize)]
struct SenderIds {
    open_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    message_id: String,
    chat_id: String,
    chat_type: String,
    message_type: String,
    content: String,
}

/// What a webhook payload turned out to be.
#[derive(Debug)]
pub enum EventOutcome {
    /// URL verification; echo the challenge back
    Challenge(String),
    /// A message to process
    Message(InboundMessage),
    /// Something we don't handle (other event types, unauthorized senders)
    Ignored,
}

// ============================================================================
// Egress
// ============================================================================

/// Outbound reply operations, behind a seam so the bridge can be tested
/// against a recording mock.
#[async_trait]
pub trait Egress: Send + Sync {
    /// Create a message in a chat, addressed by chat id (one-to-one chats).
    async fn create_message(
        &self,
        chat_id: &str,
        msg_type: MsgType,
        content: &str,
    ) -> Result<(), LarkError>;

    /// Reply in thread to a message, addressed by message id.
    async fn reply_message(
        &self,
        message_id: &str,
        msg_type: MsgType,
        content: &str,
    ) -> Result<(), LarkError>;
}

// ============================================================================
// Token Cache
// ============================================================================

struct TokenCache {
    token: String,
    expires_at: Instant,
}

// ============================================================================
// LarkClient
// ============================================================================

/// Feishu/Lark API client.
pub struct LarkClient {
    app_id: String,
    app_secret: String,
    encrypt_key: Option<String>,
    verification_token: Option<String>,
    allowed_users: Vec<String>,
    client: reqwest::Client,
    token_cache: Arc<RwLock<Option<TokenCache>>>,
    use_lark: bool,
}

impl LarkClient {
    pub fn new(config: &LarkConfig) -> Self {
        Self {
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            encrypt_key: config.encrypt_key.clone(),
            verification_token: config.verification_token.clone(),
            allowed_users: config.allowed_users.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            token_cache: Arc::new(RwLock::new(None)),
            use_lark: config.use_lark,
        }
    }

    fn api_base(&self) -> &str {
        if self.use_lark {
            LARK_API_BASE
        } else {
            FEISHU_API_BASE
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base(), path)
    }

    fn is_user_allowed(&self, open_id: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == open_id)
    }

    /// Get or refresh the tenant access token.
    async fn get_access_token(&self) -> Result<String, LarkError> {
        // Check cache first
        {
            let cache = self.token_cache.read().await;
            if let Some(ref cached) = *cache {
                let now = Instant::now();
                if cached.expires_at > now + Duration::from_secs(TOKEN_REFRESH_MARGIN_SECS) {
                    return Ok(cached.token.clone());
                }
            }
        }

        // Refresh token
        let url = self.api_url("/auth/v3/tenant_access_token/internal");
        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret
        });

        let resp = self.client.post(&url).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(LarkError::Auth(format!(
                "tenant_access_token request failed ({status}): {text}"
            )));
        }

        let data: TenantAccessTokenResponse = resp
            .json()
            .await
            .map_err(|e| LarkError::Auth(format!("malformed token response: {e}")))?;

        if data.code != 0 {
            return Err(LarkError::Auth(format!(
                "tenant_access_token error ({}): {}",
                data.code, data.msg
            )));
        }

        let token = data
            .tenant_access_token
            .ok_or_else(|| LarkError::Auth("missing tenant_access_token in response".into()))?;
        let expire = data.expire.unwrap_or(7200);

        // Update cache
        {
            let mut cache = self.token_cache.write().await;
            *cache = Some(TokenCache {
                token: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(expire),
            });
        }

        tracing::debug!("Lark access token refreshed, expires in {} seconds", expire);
        Ok(token)
    }

    /// POST an authorized message-send call and check the platform result.
    async fn post_message_api(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<(), LarkError> {
        let token = self.get_access_token().await?;

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {token}"))
            .json(&body)
            .send()
            .await?;

        let log_id = resp
            .headers()
            .get(LOG_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LarkError::Api {
                code: status.as_u16() as i32,
                msg: text,
                log_id,
            });
        }

        let data: SendMessageResponse = resp.json().await.map_err(|e| LarkError::Api {
            code: -1,
            msg: format!("malformed send response: {e}"),
            log_id: log_id.clone(),
        })?;

        if data.code != 0 {
            return Err(LarkError::Api {
                code: data.code,
                msg: data.msg,
                log_id,
            });
        }

        Ok(())
    }

    /// Parse a webhook payload, decrypting it when necessary.
    pub fn parse_event(&self, payload: &str) -> Result<EventCallback, LarkError> {
        let json_value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| LarkError::InvalidEvent(format!("payload is not JSON: {e}")))?;

        let decrypted_payload =
            if let Some(encrypt) = json_value.get("encrypt").and_then(|e| e.as_str()) {
                match &self.encrypt_key {
                    Some(key) => {
                        let decrypted = Self::decrypt_aes_cbc(key, encrypt)?;
                        tracing::debug!("Lark event decrypted");
                        decrypted
                    }
                    None => {
                        return Err(LarkError::InvalidEvent(
                            "received encrypted event but no encrypt_key configured".into(),
                        ));
                    }
                }
            } else {
                payload.to_string()
            };

        serde_json::from_str(&decrypted_payload)
            .map_err(|e| LarkError::InvalidEvent(format!("unexpected event shape: {e}")))
    }

    /// Decrypt an encrypted event using AES-256-CBC.
    ///
    /// Key is the SHA-256 of the configured encrypt key; IV is its first
    /// 16 bytes.
    fn decrypt_aes_cbc(encrypt_key: &str, ciphertext_b64: &str) -> Result<String, LarkError> {
        let mut hasher = Sha256::new();
        hasher.update(encrypt_key.as_bytes());
        let key_hash = hasher.finalize();

        let key: [u8; 32] = key_hash.into();
        let iv: [u8; 16] = key_hash[..16]
            .try_into()
            .map_err(|_| LarkError::InvalidEvent("bad AES IV length".into()))?;

        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| LarkError::InvalidEvent(format!("bad base64 ciphertext: {e}")))?;

        let decryptor = Aes256CbcDec::new(&key.into(), &iv.into());
        let mut buffer = ciphertext.clone();
        let decrypted = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| LarkError::InvalidEvent(format!("AES decryption failed: {e}")))?;

        String::from_utf8(decrypted.to_vec())
            .map_err(|e| LarkError::InvalidEvent(format!("decrypted content is not UTF-8: {e}")))
    }

    /// Process a webhook payload into a challenge echo, an inbound message,
    /// or nothing.
    pub fn process_event(&self, payload: &str) -> Result<EventOutcome, LarkError> {
        let event = self.parse_event(payload)?;

        // URL verification challenge
        if let Some(challenge) = event.challenge {
            tracing::info!("Lark URL verification challenge received");
            return Ok(EventOutcome::Challenge(challenge));
        }

        let (Some(header), Some(event_data)) = (event.header, event.event) else {
            return Ok(EventOutcome::Ignored);
        };

        if let Some(ref expected) = self.verification_token {
            if header.token.as_deref() != Some(expected.as_str()) {
                return Err(LarkError::Auth("event verification token mismatch".into()));
            }
        }

        if header.event_type != "im.message.receive_v1" {
            tracing::debug!(event_type = %header.event_type, "Ignoring event");
            return Ok(EventOutcome::Ignored);
        }

        let msg_event: MessageReceiveEvent = serde_json::from_value(event_data)
            .map_err(|e| LarkError::InvalidEvent(format!("bad message event: {e}")))?;

        let sender_id = msg_event
            .sender
            .sender_id
            .open_id
            .or(msg_event.sender.sender_id.user_id)
            .unwrap_or_else(|| "unknown".to_string());

        if !self.is_user_allowed(&sender_id) {
            tracing::warn!(user_id = %sender_id, "Ignoring message from unauthorized user");
            return Ok(EventOutcome::Ignored);
        }

        Ok(EventOutcome::Message(InboundMessage {
            message_id: msg_event.message.message_id,
            chat_id: msg_event.message.chat_id,
            chat_kind: ChatKind::from_chat_type(&msg_event.message.chat_type),
            user_id: sender_id,
            message_type: msg_event.message.message_type,
            content: msg_event.message.content,
        }))
    }
}

#[async_trait]
impl Egress for LarkClient {
    async fn create_message(
        &self,
        chat_id: &str,
        msg_type: MsgType,
        content: &str,
    ) -> Result<(), LarkError> {
        let url = format!(
            "{}?receive_id_type=chat_id",
            self.api_url("/im/v1/messages")
        );
        let body = serde_json::json!({
            "receive_id": chat_id,
            "msg_type": msg_type.as_str(),
            "content": content,
        });

        self.post_message_api(&url, body).await?;
        tracing::info!(chat_id = %chat_id, "Lark message created");
        Ok(())
    }

    async fn reply_message(
        &self,
        message_id: &str,
        msg_type: MsgType,
        content: &str,
    ) -> Result<(), LarkError> {
        let url = self.api_url(&format!("/im/v1/messages/{message_id}/reply"));
        let body = serde_json::json!({
            "msg_type": msg_type.as_str(),
            "content": content,
        });

        self.post_message_api(&url, body).await?;
        tracing::info!(message_id = %message_id, "Lark reply sent");
        Ok(())
    }
}
