//! API backend against a local mock of the Messages endpoint

use axum::{
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use code_relay::backend::{ApiBackend, Backend, BackendError, BackendKind};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

/// Serve `router` on an ephemeral port, return the endpoint url
async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/v1/messages", addr)
}

fn backend(url: &str) -> ApiBackend {
    ApiBackend::new("test-key", url, "claude-test", Duration::from_secs(5))
}

#[tokio::test]
async fn test_returns_first_text_block() {
    let router = Router::new().route(
        "/v1/messages",
        post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("test-key") {
                return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
            }
            let system = body["system"].as_str().unwrap_or_default().to_string();
            let prompt = body["messages"][0]["content"].as_str().unwrap_or_default().to_string();
            (
                StatusCode::OK,
                Json(json!({
                    "content": [
                        {"type": "tool_use", "id": "t1"},
                        {"type": "text", "text": format!("echo: {} | {}", prompt, system.contains("/srv/app"))},
                        {"type": "text", "text": "ignored"}
                    ],
                    "usage": {"input_tokens": 10, "output_tokens": 5}
                })),
            )
        }),
    );
    let url = serve(router).await;

    let api = backend(&url);
    assert_eq!(api.kind(), BackendKind::Api);

    let text = api.invoke("fix the bug", Path::new("/srv/app")).await.unwrap();
    assert_eq!(text, "echo: fix the bug | true");
}

#[tokio::test]
async fn test_non_success_status_is_api_error() {
    let router = Router::new().route(
        "/v1/messages",
        post(|| async { (StatusCode::TOO_MANY_REQUESTS, "overloaded") }),
    );
    let url = serve(router).await;

    let err = backend(&url).invoke("hi", Path::new("/tmp")).await.unwrap_err();
    match err {
        BackendError::Api { status, body } => {
            assert_eq!(status, 429);
            assert_eq!(body, "overloaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_no_text_block_is_empty_response() {
    let router = Router::new().route(
        "/v1/messages",
        post(|| async { Json(json!({"content": [{"type": "tool_use", "id": "t1"}]})) }),
    );
    let url = serve(router).await;

    let err = backend(&url).invoke("hi", Path::new("/tmp")).await.unwrap_err();
    assert!(matches!(err, BackendError::EmptyResponse));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = backend(&format!("http://{}/v1/messages", addr))
        .invoke("hi", Path::new("/tmp"))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Transport(_)));
}
