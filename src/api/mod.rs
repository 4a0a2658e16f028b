//! HTTP surface of the proxy.
//!
//! A handful of reserved routes serve the proxy's own endpoints; every
//! other method and path falls through to the streaming proxy handler.
//!
//! ## Reserved routes
//!
//! - `GET /llmhealth` - the proxy's own busy/idle self-report
//! - `GET /llmhealth-snapshot` - dashboard JSON
//! - `GET /llmhealth-monitor` - dashboard HTML
//! - `GET /access-log-stats` - access statistics
//! - `GET /v1/models` - aggregated model list
//! - `GET /metrics` - Prometheus exposition
//! - `GET /favicon.ico` - 204
//!
//! Everything else is proxied to the selected backend.

pub mod chat;
pub mod headers;
pub mod models;
pub mod monitor;
pub mod proxy;
pub mod snapshot;

use crate::accesslog::AccessLog;
use crate::catalog::ModelCatalog;
use crate::gauge::{NullSampler, UtilizationGauge, UtilizationSampler};
use crate::health::HealthMonitor;
use crate::inflight::InFlightTracker;
use crate::registry::ServerRegistry;
use crate::routing::Selector;
use crate::sticky::StickyTable;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

/// Upstream connect timeout. There is deliberately no read timeout: token
/// streams are expected to stay open for minutes.
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared application state: one owned value composing the whole routing
/// kernel, handed to workers and handlers as `Arc` shares.
pub struct AppState {
    pub registry: Arc<ServerRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub inflight: Arc<InFlightTracker>,
    pub catalog: Arc<ModelCatalog>,
    pub sticky: Arc<StickyTable>,
    pub access_log: Arc<AccessLog>,
    pub gauge: Arc<UtilizationGauge>,
    pub selector: Selector,
    pub upstream: reqwest::Client,
    pub start_time: Instant,
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self::with_sampler(registry, Arc::new(NullSampler))
    }

    /// Construct with a host-specific GPU utilization sampler.
    pub fn with_sampler(
        registry: Arc<ServerRegistry>,
        sampler: Arc<dyn UtilizationSampler>,
    ) -> Self {
        let upstream = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build upstream HTTP client");

        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&registry)));
        let inflight = Arc::new(InFlightTracker::new());
        let catalog = Arc::new(ModelCatalog::new());
        let sticky = Arc::new(StickyTable::new());

        let selector = Selector::new(
            Arc::clone(&registry),
            Arc::clone(&monitor),
            Arc::clone(&inflight),
            Arc::clone(&catalog),
            Arc::clone(&sticky),
        );

        Self {
            registry,
            monitor,
            inflight,
            catalog,
            sticky,
            access_log: Arc::new(AccessLog::new()),
            gauge: Arc::new(UtilizationGauge::new(sampler)),
            selector,
            upstream,
            start_time: Instant::now(),
            metrics_handle: crate::metrics::recorder_handle(),
        }
    }
}

/// Build the router: reserved routes first, the proxy as the fallback.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/llmhealth", get(snapshot::llmhealth))
        .route("/llmhealth-snapshot", get(snapshot::snapshot))
        .route("/llmhealth-monitor", get(monitor::page))
        .route("/access-log-stats", get(snapshot::access_log_stats))
        .route("/favicon.ico", get(monitor::favicon))
        .route("/v1/models", get(models::handle))
        .route("/metrics", get(crate::metrics::handler))
        .fallback(proxy::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
