//! Backend health monitoring.
//!
//! A single background task polls every backend's `/llmhealth` endpoint on
//! a fixed one-second cadence and folds the observations into a per-backend
//! rolling window. Consumers read the conservative ternary collapse of that
//! window; a backend is never reported idle on stale or partial evidence.

mod probe;
mod state;

pub use probe::{interpret_status_text, probe, ProbeReading};
pub use state::{BackendMetrics, ConservativeStatus, HealthSample, HealthWindow, WINDOW_SECONDS};

use crate::registry::ServerRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Seconds between poll sweeps.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Probe connect timeout.
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe read timeout.
pub const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct MonitorState {
    windows: HashMap<String, HealthWindow>,
    last_metrics: HashMap<String, BackendMetrics>,
}

/// Background poller holding the per-backend health windows.
pub struct HealthMonitor {
    registry: Arc<ServerRegistry>,
    client: reqwest::Client,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(PROBE_CONNECT_TIMEOUT)
            .read_timeout(PROBE_READ_TIMEOUT)
            .build()
            .expect("failed to build probe HTTP client");
        Self::with_client(registry, client)
    }

    /// Construct with a custom probe client (for testing).
    pub fn with_client(registry: Arc<ServerRegistry>, client: reqwest::Client) -> Self {
        Self {
            registry,
            client,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Conservative status for one health base. Unknown backends and empty
    /// windows read as busy.
    pub fn conservative_status(&self, health_base: &str) -> ConservativeStatus {
        let state = self.state.lock().expect("health monitor lock poisoned");
        state
            .windows
            .get(health_base)
            .map(HealthWindow::conservative)
            .unwrap_or(ConservativeStatus::Busy)
    }

    /// Last observation per requested base, missing entries as `None`.
    pub fn snapshot_metrics(&self, bases: &[String]) -> HashMap<String, Option<BackendMetrics>> {
        let state = self.state.lock().expect("health monitor lock poisoned");
        bases
            .iter()
            .map(|b| (b.clone(), state.last_metrics.get(b).cloned()))
            .collect()
    }

    /// Record one probe reading: window append and last-metrics overwrite
    /// in a single critical section.
    pub fn record(&self, health_base: &str, reading: ProbeReading, url: &str) {
        let mut state = self.state.lock().expect("health monitor lock poisoned");
        state
            .windows
            .entry(health_base.to_string())
            .or_default()
            .push(reading.sample);
        state.last_metrics.insert(
            health_base.to_string(),
            BackendMetrics {
                status: reading.sample.into(),
                gpu_util_max5s: reading.gpu_util_max5s,
                updated_at: chrono::Utc::now(),
                url: url.to_string(),
            },
        );
    }

    /// Probe every configured backend once.
    pub async fn sweep(&self) {
        for health_base in self.registry.health_bases() {
            let url = format!("{}/llmhealth", health_base.trim_end_matches('/'));
            let reading = probe::probe(&self.client, &health_base).await;
            debug!(base = %health_base, sample = ?reading.sample, "health probe");
            self.record(&health_base, reading, &url);
        }
    }

    /// Start the poll loop. Each tick begins one interval after the
    /// previous tick's start; a sweep that overruns delays the next tick
    /// instead of bursting.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval_secs = SAMPLE_INTERVAL.as_secs(),
                window = WINDOW_SECONDS,
                "health monitor started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("health monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}
