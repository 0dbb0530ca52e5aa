use super::*;
use axum::{body, body::Body, http::Request};
use fanout::FanoutConfig;
use storage::MemoryStore;
use tower::ServiceExt;

fn test_app() -> (Router, FanoutCore) {
    let config = FanoutConfig {
        instance_id: "test".into(),
        ..FanoutConfig::default()
    };
    let core = FanoutCore::new(Arc::new(MemoryStore::new()), config).expect("core");
    let app = build_router(Arc::new(AppState {
        core: core.clone(),
        max_body_bytes: 4 * 1024,
    }));
    (app, core)
}

fn publish_request(conversation_id: ConversationId, body: serde_json::Value) -> Request<Body> {
    Request::post(format!("/conversations/{conversation_id}/messages"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn healthz_reports_ok_when_store_is_ready() {
    let (app, _core) = test_app();
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn published_messages_are_listed_in_order() {
    let (app, _core) = test_app();
    let conversation_id = ConversationId::new_v4();
    let sender_id = UserId::new_v4();

    let mut ids = Vec::new();
    for text in ["first", "second", "third"] {
        let response = app
            .clone()
            .oneshot(publish_request(
                conversation_id,
                serde_json::json!({
                    "sender_id": sender_id,
                    "ciphertext_b64": STANDARD.encode(text),
                    "nonce_b64": STANDARD.encode([7u8; 12]),
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let published: PublishResponse = json_body(response).await;
        ids.push(published.entry_id);
    }

    let request = Request::get(format!(
        "/conversations/{conversation_id}/messages?since={}",
        ids[0]
    ))
    .body(Body::empty())
    .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let messages: Vec<MessagePayload> = json_body(response).await;
    assert_eq!(
        messages.iter().map(|m| m.entry_id).collect::<Vec<_>>(),
        ids[1..].to_vec()
    );
    assert_eq!(messages[0].ciphertext_b64, STANDARD.encode("second"));
    assert!(messages.iter().all(|m| m.sender_id == sender_id));
}

#[tokio::test]
async fn list_limit_is_clamped_to_at_least_one() {
    let (app, core) = test_app();
    let conversation_id = ConversationId::new_v4();
    for body in [b"a", b"b"] {
        core.publish(conversation_id, UserId::new_v4(), body.to_vec(), vec![0; 12])
            .await
            .expect("publish");
    }

    let request = Request::get(format!("/conversations/{conversation_id}/messages?limit=0"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    let messages: Vec<MessagePayload> = json_body(response).await;
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn bad_payloads_are_rejected_with_validation_errors() {
    let (app, _core) = test_app();
    let conversation_id = ConversationId::new_v4();

    for (ciphertext, nonce) in [("%%%", "AAAA"), ("", "AAAA"), ("aGk=", "not base64!")] {
        let response = app
            .clone()
            .oneshot(publish_request(
                conversation_id,
                serde_json::json!({
                    "sender_id": UserId::new_v4(),
                    "ciphertext_b64": ciphertext,
                    "nonce_b64": nonce,
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ApiError = json_body(response).await;
        assert_eq!(error.code, ErrorCode::Validation);
    }
}

#[tokio::test]
async fn oversized_bodies_are_refused() {
    let (app, _core) = test_app();
    let response = app
        .oneshot(publish_request(
            ConversationId::new_v4(),
            serde_json::json!({
                "sender_id": UserId::new_v4(),
                "ciphertext_b64": STANDARD.encode(vec![1u8; 8 * 1024]),
                "nonce_b64": "",
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn offline_recipients_are_counted_on_publish() {
    let (app, core) = test_app();
    let conversation_id = ConversationId::new_v4();
    let absent = UserId::new_v4();

    let response = app
        .oneshot(publish_request(
            conversation_id,
            serde_json::json!({
                "sender_id": UserId::new_v4(),
                "ciphertext_b64": STANDARD.encode("hello"),
                "nonce_b64": "",
                "offline_recipients": [absent],
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        core.sync()
            .offline_count(absent, conversation_id)
            .await
            .expect("count"),
        1
    );
}

#[tokio::test]
async fn metrics_report_the_instance_group() {
    let (app, core) = test_app();
    core.publish(ConversationId::new_v4(), UserId::new_v4(), b"x".to_vec(), Vec::new())
        .await
        .expect("publish");

    let request = Request::get("/metrics")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot: serde_json::Value = json_body(response).await;
    assert_eq!(snapshot["instance_id"], "test");
    assert_eq!(snapshot["group"], "fanout-test");
    assert_eq!(snapshot["pending"], 0);
    assert_eq!(snapshot["counters"]["published"], 1);
}
