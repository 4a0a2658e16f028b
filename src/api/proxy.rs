//! The streaming proxy handler.
//!
//! Every path not claimed by a reserved route lands here. Chat/completions
//! bodies are peeked for the model name and client identity and run through
//! the selector; everything else is forwarded verbatim to the fallback
//! backend. The upstream body is relayed chunk by chunk, and the in-flight
//! accounting is released by a drop guard owned by the relay stream, so it
//! fires exactly once whether the stream completes, errors out, or the
//! client walks away mid-response.

use crate::api::{chat, headers, AppState};
use crate::metrics::sanitize_label;
use crate::routing::Selection;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Releases one in-flight slot when dropped, and refreshes the sticky
/// binding once the slot was actually used for a dispatched request.
struct ReleaseGuard {
    state: Arc<AppState>,
    backend: String,
    model: String,
    server: Option<String>,
    ident: String,
    started: Instant,
    refresh_sticky: bool,
}

impl ReleaseGuard {
    fn new(state: Arc<AppState>, selection: &Selection, ident: &str, started: Instant) -> Self {
        Self {
            state,
            backend: selection.backend.clone(),
            model: selection.model.clone(),
            server: selection.server.clone(),
            ident: ident.to_string(),
            started,
            refresh_sticky: false,
        }
    }

    /// Called after a successful dispatch of a chat request; from then on
    /// the drop also refreshes the sticky last-used stamp.
    fn arm_sticky_refresh(&mut self) {
        self.refresh_sticky = true;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.state.inflight.dec(&self.backend, &self.model);
        metrics::histogram!("baton_request_duration_seconds",
            "model" => sanitize_label(&self.model),
            "backend" => sanitize_label(&self.backend)
        )
        .record(self.started.elapsed().as_secs_f64());

        if self.refresh_sticky {
            if let Some(server) = &self.server {
                self.state.sticky.update(&self.ident, server, &self.model);
            }
        }
    }
}

/// Catch-all proxy handler for every non-reserved route.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4();
    let (parts, body) = request.into_parts();

    let client_ip = client_ip(&parts.headers, peer);
    let mut ident = client_ip.clone();

    let body_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "Failed to read request body"}),
            );
        }
    };

    let is_completions = parts.method == Method::POST
        && parts.uri.path().trim_end_matches('/') == "/v1/chat/completions";

    let mut selection: Option<Selection> = None;
    let mut peeked: Option<Value> = None;
    let mut mutated = false;

    if is_completions {
        // Best effort: a body that is not JSON is proxied untouched.
        if let Ok(mut value) = serde_json::from_slice::<Value>(&body_bytes) {
            let username = chat::extract_username(&value);
            if let Some(name) = &username {
                ident = name.clone();
            }

            let requested = chat::extract_model(&value).map(str::to_string);
            if let Some(model) = &requested {
                selection = state.selector.select(&ident, model).await;
                if let Some(sel) = &selection {
                    if sel.rewritten {
                        value["model"] = Value::String(sel.model.clone());
                        mutated = true;
                        info!(
                            request_id = %request_id,
                            backend = %sel.backend,
                            instance = %sel.model,
                            requested = %model,
                            "rewrote model to idle instance"
                        );
                    }
                }
            }

            if chat::apply_grammar_hook(&mut value) {
                mutated = true;
            }

            if let Some(model) = &requested {
                state
                    .access_log
                    .record(&client_ip, model, username.as_deref());
            }

            peeked = Some(value);
        }
    }

    let backend = match selection
        .as_ref()
        .map(|sel| sel.backend.clone())
        .or_else(|| state.registry.fallback_backend().map(str::to_string))
    {
        Some(backend) => backend,
        None => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "No backend configured"}),
            );
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target_url = format!("{}{}", backend.trim_end_matches('/'), path_and_query);

    let upstream_headers = headers::filter_request_headers(&parts.headers);

    let upstream_body: Option<Vec<u8>> = if mutated {
        peeked.as_ref().map(|value| {
            serde_json::to_vec(value).expect("peeked body must re-serialize")
        })
    } else if matches!(parts.method, Method::POST | Method::PUT | Method::PATCH) {
        Some(body_bytes.to_vec())
    } else {
        None
    };

    // The slot is taken before dispatch so the cap check upstream of us
    // sees this request.
    let mut accounting = selection.as_ref().map(|sel| {
        state.inflight.inc(&sel.backend, &sel.model);
        ReleaseGuard::new(Arc::clone(&state), sel, &ident, started)
    });

    let mut upstream_request = state
        .upstream
        .request(parts.method.clone(), &target_url)
        .headers(upstream_headers);
    if let Some(bytes) = upstream_body {
        upstream_request = upstream_request.body(bytes);
    }

    let upstream_response = match upstream_request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(request_id = %request_id, backend = %backend, error = %e, "upstream dispatch failed");
            metrics::counter!("baton_upstream_errors_total",
                "backend" => sanitize_label(&backend)
            )
            .increment(1);
            // Dropping the guard releases the slot; sticky is untouched
            // because the dispatch never happened.
            drop(accounting);
            return error_response(
                StatusCode::BAD_GATEWAY,
                json!({"error": "Upstream request failed", "details": e.to_string()}),
            );
        }
    };

    if is_completions {
        if let (Some(guard), Some(sel)) = (accounting.as_mut(), selection.as_ref()) {
            if let Some(server) = &sel.server {
                state.sticky.update(&ident, server, &sel.model);
            }
            guard.arm_sticky_refresh();
        }
    }

    if let Some(sel) = &selection {
        metrics::counter!("baton_requests_total",
            "model" => sanitize_label(&sel.model),
            "backend" => sanitize_label(&sel.backend)
        )
        .increment(1);
    }

    let status = upstream_response.status();
    let response_headers = headers::filter_response_headers(upstream_response.headers());
    let mut upstream_stream = upstream_response.bytes_stream();

    let relay = async_stream::stream! {
        // The guard lives exactly as long as the relay: normal completion,
        // stream error, and client disconnect all drop it once.
        let _accounting = accounting.take();
        while let Some(chunk) = upstream_stream.next().await {
            match chunk {
                Ok(bytes) => yield Ok::<_, std::io::Error>(bytes),
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "upstream stream error");
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }
    };

    let mut response = Response::new(Body::from_stream(relay));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// First token of `X-Forwarded-For`, else the connection peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn error_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}
