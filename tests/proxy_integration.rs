//! End-to-end tests for the streaming proxy, driven through the axum
//! router against wiremock backends.

use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use baton::api::{chat, create_router, AppState};
use baton::config::ServerListConfig;
use baton::health::{HealthSample, ProbeReading};
use baton::registry::ServerRegistry;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PEER: [u8; 4] = [127, 0, 0, 1];

/// State wired to one mock backend named `a`, routing `llama.*` to it.
async fn single_backend_state(upstream: &MockServer) -> Arc<AppState> {
    let (addr, model_port) = split_uri(&upstream.uri());
    let json = format!(
        r#"{{
            "servers": {{
                "a": {{"addr": "{addr}", "health-port": 1, "model-port": {model_port}}}
            }},
            "models": {{"llama.*": ["a"]}},
            "fallback_server": "a"
        }}"#
    );
    let registry = Arc::new(ServerRegistry::from_config(
        &ServerListConfig::from_json(&json).unwrap(),
    ));
    Arc::new(AppState::new(registry))
}

fn split_uri(uri: &str) -> (String, u16) {
    let (addr, port) = uri.rsplit_once(':').unwrap();
    (addr.to_string(), port.parse().unwrap())
}

fn mark_idle(state: &AppState) {
    for base in state.registry.health_bases() {
        state.monitor.record(
            &base,
            ProbeReading {
                sample: HealthSample::Idle,
                gpu_util_max5s: None,
            },
            &base,
        );
    }
}

async fn mount_models(server: &MockServer, models: &[&str]) {
    let data: Vec<Value> = models.iter().map(|m| json!({"id": m})).collect();
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"object": "list", "data": data})),
        )
        .mount(server)
        .await;
}

fn chat_request(body: Value) -> Request<Body> {
    raw_chat_request(body.to_string())
}

fn raw_chat_request(body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .extension(ConnectInfo(SocketAddr::from((PEER, 40000))))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_simple_route_accounting_and_sticky() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["llama3"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "llama3"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = single_backend_state(&upstream).await;
    mark_idle(&state);
    let app = create_router(Arc::clone(&state));

    let response = app
        .oneshot(chat_request(json!({"model": "llama3", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Headers are back but the body is not consumed yet: the request is
    // still accounted in-flight.
    let backend = state.registry.server("a").unwrap().model_base();
    assert_eq!(state.inflight.get(&backend, "llama3"), 1);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!({"ok": true}));

    // Fully relayed: the slot is released and the sticky binding exists.
    assert_eq!(state.inflight.total(&backend), 0);
    assert_eq!(
        state.sticky.get("127.0.0.1", "llama3").as_deref(),
        Some("a")
    );

    let stats = state.access_log.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.ip_counts["127.0.0.1"], 1);
    assert_eq!(stats.model_counts["llama3"], 1);
}

#[tokio::test]
async fn test_client_disconnect_releases_accounting() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["llama3"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("streamed tokens"))
        .mount(&upstream)
        .await;

    let state = single_backend_state(&upstream).await;
    mark_idle(&state);
    let app = create_router(Arc::clone(&state));

    let response = app
        .oneshot(chat_request(json!({"model": "llama3", "messages": []})))
        .await
        .unwrap();
    let backend = state.registry.server("a").unwrap().model_base();
    assert_eq!(state.inflight.get(&backend, "llama3"), 1);

    // Drop the response without reading the body, like a client that
    // disconnected mid-stream. The release hook must still fire.
    drop(response);

    assert_eq!(state.inflight.total(&backend), 0);
    // The termination path also refreshed the sticky binding.
    assert!(state.sticky.get("127.0.0.1", "llama3").is_some());
}

#[tokio::test]
async fn test_busy_backend_rewrites_to_idle_instance() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["llama3", "llama3-2", "llama3-3"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "llama3-2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = single_backend_state(&upstream).await;
    let backend = state.registry.server("a").unwrap().model_base();
    for base in state.registry.health_bases() {
        state.monitor.record(
            &base,
            ProbeReading {
                sample: HealthSample::Busy,
                gpu_util_max5s: None,
            },
            &base,
        );
    }
    state.inflight.inc(&backend, "llama3");
    state.inflight.inc(&backend, "llama3-3");

    let app = create_router(Arc::clone(&state));
    let response = app
        .oneshot(chat_request(json!({"model": "llama3", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The rewritten instance is what gets accounted.
    assert_eq!(state.inflight.get(&backend, "llama3-2"), 1);
    to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(state.inflight.get(&backend, "llama3-2"), 0);

    // The access log keeps the requested name, not the instance.
    assert_eq!(state.access_log.stats().model_counts["llama3"], 1);
}

#[tokio::test]
async fn test_grammar_injection_for_agent_preamble() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["llama3"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "reasoning_format": "auto",
            "grammar": chat::CLINE_GBNF
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = single_backend_state(&upstream).await;
    mark_idle(&state);
    let app = create_router(Arc::clone(&state));

    let response = app
        .oneshot(chat_request(json!({
            "model": "llama3",
            "messages": [{"role": "system", "content": "You are Cline, an agent"}]
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_username_becomes_ident_for_sticky() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["llama3"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&upstream)
        .await;

    let state = single_backend_state(&upstream).await;
    mark_idle(&state);
    let app = create_router(Arc::clone(&state));

    let response = app
        .oneshot(chat_request(json!({
            "model": "llama3",
            "messages": [{"role": "system", "content": "ユーザーの名前は「ada」です"}]
        })))
        .await
        .unwrap();
    to_bytes(response.into_body(), usize::MAX).await.unwrap();

    // Sticky is keyed by the extracted username, the log by the client IP.
    assert_eq!(state.sticky.get("ada", "llama3").as_deref(), Some("a"));
    assert_eq!(state.sticky.get("127.0.0.1", "llama3"), None);
    let stats = state.access_log.stats();
    assert_eq!(stats.username_counts["ada"], 1);
    assert_eq!(stats.ip_counts["127.0.0.1"], 1);
}

#[tokio::test]
async fn test_unparseable_chat_body_proxied_without_logging() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("not json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = single_backend_state(&upstream).await;
    let app = create_router(Arc::clone(&state));

    let response = app
        .oneshot(raw_chat_request("this is not json {".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // No model was known, so nothing was logged or accounted.
    assert_eq!(state.access_log.stats().total_requests, 0);
    let backend = state.registry.server("a").unwrap().model_base();
    assert_eq!(state.inflight.total(&backend), 0);
}

#[tokio::test]
async fn test_plain_request_proxied_to_fallback() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/embeddings/info"))
        .respond_with(
            ResponseTemplate::new(418)
                .insert_header("x-backend-tag", "a")
                .set_body_string("teapot"),
        )
        .mount(&upstream)
        .await;

    let state = single_backend_state(&upstream).await;
    let app = create_router(Arc::clone(&state));

    let request = Request::builder()
        .method("GET")
        .uri("/v1/embeddings/info?verbose=1")
        .extension(ConnectInfo(SocketAddr::from((PEER, 40000))))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    // Non-2xx statuses and custom headers pass through untouched.
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.headers().get("x-backend-tag").unwrap(), "a");
    assert!(response.headers().get("content-length").is_none());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"teapot");
}

#[tokio::test]
async fn test_forwarded_for_wins_over_peer() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["llama3"]).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&upstream)
        .await;

    let state = single_backend_state(&upstream).await;
    mark_idle(&state);
    let app = create_router(Arc::clone(&state));

    let mut request = chat_request(json!({"model": "llama3", "messages": []}));
    request
        .headers_mut()
        .insert("x-forwarded-for", "10.9.8.7, 172.16.0.1".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    to_bytes(response.into_body(), usize::MAX).await.unwrap();

    assert_eq!(state.access_log.stats().ip_counts["10.9.8.7"], 1);
}

#[tokio::test]
async fn test_upstream_dispatch_failure_yields_502_and_releases() {
    // Nothing listens on port 9; connections are refused immediately.
    let json = r#"{
        "servers": {"a": {"addr": "http://127.0.0.1", "health-port": 1, "model-port": 9}},
        "models": {"llama.*": ["a"]},
        "fallback_server": "a"
    }"#;
    let registry = Arc::new(ServerRegistry::from_config(
        &ServerListConfig::from_json(json).unwrap(),
    ));
    let state = Arc::new(AppState::new(registry));
    mark_idle(&state);
    let app = create_router(Arc::clone(&state));

    let response = app
        .oneshot(chat_request(json!({"model": "llama3", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"], "Upstream request failed");
    assert!(value["details"].as_str().is_some());

    assert_eq!(state.inflight.total("http://127.0.0.1:9"), 0);
    // No sticky binding is created for a dispatch that never happened.
    assert_eq!(state.sticky.get("127.0.0.1", "llama3"), None);
}

#[tokio::test]
async fn test_no_backend_yields_503() {
    let registry = Arc::new(ServerRegistry::from_config(
        &ServerListConfig::from_json("{}").unwrap(),
    ));
    let state = Arc::new(AppState::new(registry));
    let app = create_router(state);

    let response = app
        .oneshot(chat_request(json!({"model": "anything", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!({"error": "No backend configured"}));
}

#[tokio::test]
async fn test_aggregated_models_excludes_numbered_replicas() {
    let upstream = MockServer::start().await;
    mount_models(&upstream, &["llama3", "llama3-2", "llama3-3", "qwen-coder"]).await;

    let state = single_backend_state(&upstream).await;
    let app = create_router(state);

    let request = Request::builder()
        .uri("/v1/models")
        .extension(ConnectInfo(SocketAddr::from((PEER, 40000))))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["object"], "list");
    let ids: Vec<&str> = value["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["llama3", "qwen-coder"]);
}

#[tokio::test]
async fn test_self_health_report() {
    let registry = Arc::new(ServerRegistry::from_config(
        &ServerListConfig::from_json("{}").unwrap(),
    ));
    let state = Arc::new(AppState::new(registry));
    state.gauge.record(72.0);
    let app = create_router(state);

    let request = Request::builder()
        .uri("/llmhealth")
        .extension(ConnectInfo(SocketAddr::from((PEER, 40000))))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"], "busy");
    assert_eq!(value["gpu_util_max5s"], 72.0);
    assert_eq!(value["window_seconds"], 5);
}

#[tokio::test]
async fn test_snapshot_endpoint_shape() {
    let upstream = MockServer::start().await;
    let state = single_backend_state(&upstream).await;
    mark_idle(&state);
    state.sticky.update("ada", "a", "llama3");
    let app = create_router(Arc::clone(&state));

    let request = Request::builder()
        .uri("/llmhealth-snapshot")
        .extension(ConnectInfo(SocketAddr::from((PEER, 40000))))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(value["local"]["status"], "idle");
    let backends = value["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0]["status"], "idle");
    assert_eq!(backends[0]["total_inflight"], 0);
    assert!(value["servers"].get("a").is_some());
    assert_eq!(value["models"]["llama.*"], json!(["a"]));
    assert_eq!(value["sticky_count"], 1);
    assert_eq!(value["sticky"][0]["ident"], "ada");
    // ISO-8601 UTC with Z suffix.
    assert!(value["now"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_favicon_is_not_proxied() {
    let registry = Arc::new(ServerRegistry::from_config(
        &ServerListConfig::from_json("{}").unwrap(),
    ));
    let app = create_router(Arc::new(AppState::new(registry)));

    let request = Request::builder()
        .uri("/favicon.ico")
        .extension(ConnectInfo(SocketAddr::from((PEER, 40000))))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_monitor_page_served_as_html() {
    let registry = Arc::new(ServerRegistry::from_config(
        &ServerListConfig::from_json("{}").unwrap(),
    ));
    let app = create_router(Arc::new(AppState::new(registry)));

    let request = Request::builder()
        .uri("/llmhealth-monitor")
        .extension(ConnectInfo(SocketAddr::from((PEER, 40000))))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/html; charset=utf-8"
    );
}
