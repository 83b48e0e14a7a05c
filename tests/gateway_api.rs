//! End-to-end tests driving the HTTP router in stub mode

use assert_json_diff::assert_json_include;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

use stream_gateway::{Gateway, GatewayConfig};

fn stub_config() -> GatewayConfig {
    GatewayConfig {
        stub_word_delay_ms: 0,
        ..Default::default()
    }
}

fn app(config: GatewayConfig) -> Router {
    Gateway::from_config(config).unwrap().router()
}

fn post_json(uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// (event name, JSON data) for every frame in an SSE body
fn parse_frames(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter(|frame| frame.lines().any(|line| line.starts_with("data: ")))
        .map(|frame| {
            let mut event = String::new();
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(name) = line.strip_prefix("event: ") {
                    event = name.to_string();
                } else if let Some(payload) = line.strip_prefix("data: ") {
                    data.push_str(payload);
                }
            }
            (event, serde_json::from_str(&data).unwrap())
        })
        .collect()
}

#[tokio::test]
async fn test_stream_hello_in_stub_mode() {
    let response = app(stub_config())
        .oneshot(post_json("/generate/stream", Some("alice"), json!({"prompt": "hello"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let body = body_text(response).await;
    let frames = parse_frames(&body);
    assert!(frames.len() >= 2);

    let (last_event, last_data) = frames.last().unwrap();
    assert_eq!(last_event, "complete");
    assert_eq!(last_data["is_complete"], true);

    let chunks = &frames[..frames.len() - 1];
    assert!(chunks.iter().all(|(event, _)| event == "chunk"));
    let content: String = chunks
        .iter()
        .map(|(_, data)| data["content"].as_str().unwrap().to_string())
        .collect();
    assert!(!content.is_empty());
    assert!(body.lines().any(|line| line.starts_with("id: ")));
}

#[tokio::test]
async fn test_stream_ends_with_error_when_backend_unavailable() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/completions")
        .with_status(503)
        .with_body("overloaded")
        .expect(2)
        .create_async()
        .await;

    let config = GatewayConfig {
        llm_base_url: Some(server.url()),
        max_retries: 1,
        retry_delay_ms: 1,
        ..stub_config()
    };
    let response = app(config)
        .oneshot(post_json("/generate/stream", Some("frank"), json!({"prompt": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_text(response).await;
    let frames = parse_frames(&body);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, "error");
    assert_eq!(frames[0].1["code"], "upstream_unavailable");
    assert!(body.contains("event: error\n"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_health_reports_llm_healthy() {
    let response = app(stub_config()).oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_json_include!(
        actual: body,
        expected: json!({
            "status": "ok",
            "services": {
                "llm": {"status": "healthy", "kind": "stub"},
                "redis": {"status": "healthy", "kind": "memory"}
            }
        })
    );
}

#[tokio::test]
async fn test_health_degraded_when_backend_down() {
    let config = GatewayConfig {
        llm_base_url: Some("http://127.0.0.1:9".to_string()),
        health_timeout_ms: 500,
        ..stub_config()
    };
    let response = app(config).oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["services"]["llm"]["status"], "unhealthy");
    assert!(body["services"]["llm"]["error"].is_string());
}

#[tokio::test]
async fn test_empty_prompt_is_rejected_before_streaming() {
    let response = app(stub_config())
        .oneshot(post_json("/generate/stream", Some("alice"), json!({"prompt": ""})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "validation_error");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_missing_identity_is_rejected() {
    let response = app(stub_config())
        .oneshot(post_json("/generate", None, json!({"prompt": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_body_is_json_error() {
    let request = Request::builder()
        .method("POST")
        .uri("/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", "alice")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app(stub_config()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let router = app(GatewayConfig {
        rate_limit_burst: 2,
        ..stub_config()
    });

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_json("/generate", Some("bob"), json!({"prompt": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router
        .oneshot(post_json("/generate", Some("bob"), json!({"prompt": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "rate_limit_exceeded");
}

#[tokio::test]
async fn test_client_limit_spares_health() {
    let router = app(GatewayConfig {
        client_rate_limit_burst: 1,
        ..stub_config()
    });

    let response = router.clone().oneshot(get("/models", Some("gina"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let response = router.clone().oneshot(get("/models", Some("gina"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    for _ in 0..3 {
        let response = router.clone().oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_quota_exhaustion_returns_429() {
    let router = app(GatewayConfig {
        daily_token_limit: 1,
        ..stub_config()
    });

    let response = router
        .clone()
        .oneshot(post_json("/generate", Some("carol"), json!({"prompt": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get("/quota", Some("carol")))
        .await
        .unwrap();
    let quota: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(quota["remaining"], 0);

    let response = router
        .oneshot(post_json("/generate", Some("carol"), json!({"prompt": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "quota_exceeded");
}

#[tokio::test]
async fn test_generate_returns_full_response() {
    let response = app(stub_config())
        .oneshot(post_json(
            "/generate",
            Some("dave"),
            json!({"prompt": "hello", "model": "m1", "max_tokens": 32}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["model"], "m1");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_models_lists_stub_catalog() {
    let response = app(stub_config()).oneshot(get("/models", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_json_include!(
        actual: body,
        expected: json!({"models": [{"id": "default", "provider": "stub", "max_tokens": 4096}]})
    );
}

#[tokio::test]
async fn test_events_stream_receives_published_generation() {
    let router = app(stub_config());

    let response = router
        .clone()
        .oneshot(get("/events", Some("erin")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();

    let response = router
        .oneshot(post_json("/generate", Some("erin"), json!({"prompt": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    use futures::StreamExt;
    let frame = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    let frames = parse_frames(&text);
    assert_eq!(frames[0].0, "generation");
    assert_eq!(frames[0].1["user_id"], "erin");
    assert!(frames[0].1["response"]["total_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_events_require_identity() {
    let response = app(stub_config()).oneshot(get("/events", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
