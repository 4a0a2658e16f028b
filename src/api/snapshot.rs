//! Read-only service endpoints: the proxy's own health report, the
//! dashboard snapshot, and access-log statistics.

use crate::accesslog::AccessStats;
use crate::api::AppState;
use crate::gauge::BUSY_THRESHOLD;
use crate::health::{BackendMetrics, ConservativeStatus, WINDOW_SECONDS};
use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Self-report served on `/llmhealth`, mirroring the backend contract so
/// proxies can be stacked.
#[derive(Debug, Serialize)]
pub struct SelfHealth {
    pub status: &'static str,
    pub gpu_util_max5s: f64,
    pub window_seconds: usize,
}

#[derive(Debug, Serialize)]
pub struct BackendSnapshot {
    pub base: String,
    pub status: ConservativeStatus,
    pub last: Option<BackendMetrics>,
    pub total_inflight: u32,
    pub model_inflight: HashMap<String, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_max: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ServerView {
    pub health_base: String,
    pub model_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_max: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct StickyRow {
    pub ident: String,
    pub model: String,
    pub server: String,
    /// Model-base URL of the bound server, when it is still in the catalog.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub local: SelfHealth,
    pub backends: Vec<BackendSnapshot>,
    pub servers: serde_json::Map<String, serde_json::Value>,
    pub models: serde_json::Map<String, serde_json::Value>,
    pub sticky_count: usize,
    pub sticky: Vec<StickyRow>,
    pub now: DateTime<Utc>,
}

fn local_health(state: &AppState) -> SelfHealth {
    let gpu_util_max5s = state.gauge.max();
    SelfHealth {
        status: if gpu_util_max5s >= BUSY_THRESHOLD {
            "busy"
        } else {
            "idle"
        },
        gpu_util_max5s,
        window_seconds: WINDOW_SECONDS,
    }
}

/// GET /llmhealth - the proxy's own busy/idle report.
pub async fn llmhealth(State(state): State<Arc<AppState>>) -> Json<SelfHealth> {
    Json(local_health(&state))
}

/// GET /llmhealth-snapshot - structured JSON for the monitor page.
pub async fn snapshot(State(state): State<Arc<AppState>>) -> Json<SnapshotResponse> {
    let health_bases = state.registry.health_bases();
    let metrics_snapshot = state.monitor.snapshot_metrics(&health_bases);

    let mut backends = Vec::with_capacity(health_bases.len());
    for base in &health_bases {
        let server = state.registry.server_by_health_base(base);
        let model_inflight = server
            .map(|s| state.inflight.models_for(&s.model_base()))
            .unwrap_or_default();
        let total_inflight = model_inflight.values().sum();

        backends.push(BackendSnapshot {
            base: base.clone(),
            status: state.monitor.conservative_status(base),
            last: metrics_snapshot.get(base).cloned().flatten(),
            total_inflight,
            model_inflight,
            request_max: server.and_then(|s| s.request_max),
        });
    }

    let mut servers = serde_json::Map::new();
    for server in state.registry.servers() {
        let view = ServerView {
            health_base: server.health_base(),
            model_base: server.model_base(),
            request_max: server.request_max,
        };
        servers.insert(
            server.name.clone(),
            serde_json::to_value(view).expect("server view must serialize"),
        );
    }

    let mut models = serde_json::Map::new();
    for rule in state.registry.rules() {
        models.insert(
            rule.pattern.clone(),
            serde_json::Value::from(rule.servers.clone()),
        );
    }

    state.sticky.cleanup();
    let sticky: Vec<StickyRow> = state
        .sticky
        .snapshot()
        .into_iter()
        .map(|row| StickyRow {
            backend: state
                .registry
                .server(&row.server)
                .map(|s| s.model_base()),
            ident: row.ident,
            model: row.model,
            server: row.server,
            updated_at: row.updated_at,
        })
        .collect();

    Json(SnapshotResponse {
        local: local_health(&state),
        backends,
        servers,
        models,
        sticky_count: sticky.len(),
        sticky,
        now: Utc::now(),
    })
}

/// GET /access-log-stats - aggregated recent access counts.
pub async fn access_log_stats(State(state): State<Arc<AppState>>) -> Json<AccessStats> {
    Json(state.access_log.stats())
}
