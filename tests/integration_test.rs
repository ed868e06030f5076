//! Integration tests for lark-bridge.
//!
//! Exercises the webhook endpoints and the full event → bridge → egress
//! flow with a mock inference upstream.

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use lark_bridge::config::{BridgeConfig, LarkConfig};
use lark_bridge::{
    build_router, create_state, ChatKind, Egress, InboundMessage, InferenceBridge,
    InferenceClient, LarkClient, LarkError, MsgType,
};

/// Test helper to create a router backed by a wildcard-allowed client.
fn create_test_app() -> (axum::Router, tokio::sync::mpsc::Receiver<InboundMessage>) {
    let lark = Arc::new(LarkClient::new(&LarkConfig {
        app_id: "cli_test".into(),
        app_secret: "secret".into(),
        encrypt_key: None,
        verification_token: None,
        allowed_users: vec!["*".into()],
        use_lark: false,
    }));
    let (state, rx) = create_state(lark);
    (build_router(state), rx)
}

/// Helper to make a JSON request.
async fn request_json(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = if let Some(b) = body {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&b).unwrap()))
            .unwrap()
    } else {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    (status, json)
}

fn message_event(message_id: &str, chat_type: &str, content: Value) -> Value {
    json!({
        "schema": "2.0",
        "header": {
            "event_id": format!("evt_{message_id}"),
            "event_type": "im.message.receive_v1",
            "create_time": "1700000000000",
            "app_id": "cli_test",
            "tenant_key": "tenant_1"
        },
        "event": {
            "sender": {
                "sender_id": { "open_id": "ou_alice" },
                "sender_type": "user"
            },
            "message": {
                "message_id": message_id,
                "chat_id": "oc_test",
                "chat_type": chat_type,
                "message_type": "text",
                "content": content.to_string(),
                "create_time": "1700000000000"
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Health Check Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check() {
    let (app, _rx) = create_test_app();

    let (status, json) = request_json(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "lark-bridge");
}

#[tokio::test]
async fn test_ready_check() {
    let (app, _rx) = create_test_app();

    let (status, json) = request_json(&app, Method::GET, "/ready", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ready");
}

#[tokio::test]
async fn test_ready_check_closed_channel() {
    let (app, rx) = create_test_app();

    // Drop the receiver to close the ingress channel
    drop(rx);

    let (status, json) = request_json(&app, Method::GET, "/ready", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "not_ready");
}

// ─────────────────────────────────────────────────────────────────────────────
// Webhook Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_url_verification_challenge() {
    let (app, _rx) = create_test_app();

    let payload = json!({
        "challenge": "ajls384kdjx98XX",
        "token": "xxxxxx",
        "type": "url_verification"
    });

    let (status, json) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["challenge"], "ajls384kdjx98XX");
}

#[tokio::test]
async fn test_message_event_is_forwarded() {
    let (app, mut rx) = create_test_app();

    let payload = message_event("om_int_1", "p2p", json!({"text": "hello bridge"}));
    let (status, json) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let msg = rx.try_recv().unwrap();
    assert_eq!(msg.message_id, "om_int_1");
    assert_eq!(msg.chat_id, "oc_test");
    assert_eq!(msg.chat_kind, ChatKind::P2p);
    assert_eq!(msg.user_id, "ou_alice");
    assert_eq!(msg.text(), Some("hello bridge".to_string()));
}

#[tokio::test]
async fn test_group_message_event_addressing() {
    let (app, mut rx) = create_test_app();

    let payload = message_event("om_int_2", "group", json!({"text": "hi all"}));
    let (status, _) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(rx.try_recv().unwrap().chat_kind, ChatKind::Group);
}

#[tokio::test]
async fn test_invalid_payload_is_bad_request() {
    let (app, _rx) = create_test_app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhook/lark")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("not valid json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_other_event_types_are_accepted_and_dropped() {
    let (app, mut rx) = create_test_app();

    let payload = json!({
        "schema": "2.0",
        "header": {
            "event_id": "evt_other",
            "event_type": "im.chat.member.user.added_v1",
            "create_time": "1700000000000",
            "app_id": "cli_test",
            "tenant_key": "tenant_1"
        },
        "event": {}
    });

    let (status, json) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unauthorized_sender_is_dropped() {
    let lark = Arc::new(LarkClient::new(&LarkConfig {
        app_id: "cli_test".into(),
        app_secret: "secret".into(),
        encrypt_key: None,
        verification_token: None,
        allowed_users: vec!["ou_bob".into()],
        use_lark: false,
    }));
    let (state, mut rx) = create_state(lark);
    let app = build_router(state);

    let payload = message_event("om_int_3", "p2p", json!({"text": "hi"}));
    let (status, json) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_verification_token_mismatch_is_unauthorized() {
    let lark = Arc::new(LarkClient::new(&LarkConfig {
        app_id: "cli_test".into(),
        app_secret: "secret".into(),
        encrypt_key: None,
        verification_token: Some("expected-token".into()),
        allowed_users: vec!["*".into()],
        use_lark: false,
    }));
    let (state, _rx) = create_state(lark);
    let app = build_router(state);

    let payload = message_event("om_int_4", "p2p", json!({"text": "hi"}));
    let (status, json) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["success"], false);
}

// ─────────────────────────────────────────────────────────────────────────────
// End-to-end Bridge Tests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SentReply {
    op: &'static str,
    target: String,
    content: String,
}

#[derive(Default)]
struct RecordingEgress {
    sent: Mutex<Vec<SentReply>>,
}

impl RecordingEgress {
    fn sent(&self) -> Vec<SentReply> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Egress for RecordingEgress {
    async fn create_message(
        &self,
        chat_id: &str,
        _msg_type: MsgType,
        content: &str,
    ) -> Result<(), LarkError> {
        self.sent.lock().unwrap().push(SentReply {
            op: "create",
            target: chat_id.into(),
            content: content.into(),
        });
        Ok(())
    }

    async fn reply_message(
        &self,
        message_id: &str,
        _msg_type: MsgType,
        content: &str,
    ) -> Result<(), LarkError> {
        self.sent.lock().unwrap().push(SentReply {
            op: "reply",
            target: message_id.into(),
            content: content.into(),
        });
        Ok(())
    }
}

async fn wait_for_sends(egress: &RecordingEgress, count: usize) -> Vec<SentReply> {
    for _ in 0..200 {
        if egress.sent().len() >= count {
            return egress.sent();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    egress.sent()
}

/// Webhook → ingress channel → bridge processor → inference → egress.
#[tokio::test]
async fn test_end_to_end_message_flow() {
    use wiremock::matchers::{method as wm_method, path as wm_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(wm_method("POST"))
        .and(wm_path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "answer": "42, obviously",
            "conversation_id": "conv-e2e"
        })))
        .mount(&server)
        .await;

    let (app, rx) = create_test_app();

    let inference = Arc::new(InferenceClient::new(
        format!("{}/v1/chat-messages", server.uri()),
        "app-key",
    ));
    let egress = Arc::new(RecordingEgress::default());
    let bridge = Arc::new(InferenceBridge::new(
        &BridgeConfig::default(),
        inference,
        egress.clone(),
    ));
    let _processor = InferenceBridge::spawn_processor(bridge, rx);

    // Same event delivered twice: the duplicate must be dropped
    let payload = message_event("om_e2e_1", "p2p", json!({"text": "what is the answer?"}));
    let (status, _) =
        request_json(&app, Method::POST, "/webhook/lark", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);

    let sent = wait_for_sends(&egress, 1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].op, "create");
    assert_eq!(sent[0].target, "oc_test");
    assert!(sent[0].content.contains("42, obviously"));

    // A group message from the same user continues the conversation and
    // goes out through the reply-in-thread path
    let payload = message_event("om_e2e_2", "group", json!({"text": "and why?"}));
    let (status, _) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);

    let sent = wait_for_sends(&egress, 2).await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].op, "reply");
    assert_eq!(sent[1].target, "om_e2e_2");

    // The second inference call carried the stored conversation token
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(second["conversation_id"], "conv-e2e");
}

/// Inference failure surfaces to the user instead of being dropped.
#[tokio::test]
async fn test_end_to_end_inference_failure() {
    use wiremock::matchers::method as wm_method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(wm_method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let (app, rx) = create_test_app();

    let inference = Arc::new(InferenceClient::new(server.uri(), "app-key"));
    let egress = Arc::new(RecordingEgress::default());
    let bridge = Arc::new(InferenceBridge::new(
        &BridgeConfig::default(),
        inference,
        egress.clone(),
    ));
    let _processor = InferenceBridge::spawn_processor(bridge, rx);

    let payload = message_event("om_e2e_3", "p2p", json!({"text": "hi"}));
    let (status, _) = request_json(&app, Method::POST, "/webhook/lark", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);

    let sent = wait_for_sends(&egress, 1).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].content.contains(lark_bridge::SERVICE_FAILURE_PREFIX));
    assert!(sent[0].content.contains("overloaded"));
}
