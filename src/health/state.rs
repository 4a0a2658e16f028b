//! Per-backend health window and last-observation metrics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Length of the rolling sample window, in samples (one per second).
pub const WINDOW_SECONDS: usize = 5;

/// A single health probe observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSample {
    Idle,
    Busy,
    /// Probe failed: timeout, connection refused, unparseable body.
    Invalid,
}

/// Ternary collapse of the recent window, biased toward the safe side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConservativeStatus {
    Idle,
    Busy,
    Invalid,
}

impl ConservativeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConservativeStatus::Idle => "idle",
            ConservativeStatus::Busy => "busy",
            ConservativeStatus::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for ConservativeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<HealthSample> for ConservativeStatus {
    fn from(sample: HealthSample) -> Self {
        match sample {
            HealthSample::Idle => ConservativeStatus::Idle,
            HealthSample::Busy => ConservativeStatus::Busy,
            HealthSample::Invalid => ConservativeStatus::Invalid,
        }
    }
}

/// Bounded FIFO of the last `WINDOW_SECONDS` samples for one backend.
#[derive(Debug, Default)]
pub struct HealthWindow {
    samples: VecDeque<HealthSample>,
}

impl HealthWindow {
    pub fn push(&mut self, sample: HealthSample) {
        if self.samples.len() == WINDOW_SECONDS {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Collapse the window. Any invalid sample wins, then any busy sample;
    /// an empty window reads as busy.
    pub fn conservative(&self) -> ConservativeStatus {
        if self.samples.is_empty() {
            return ConservativeStatus::Busy;
        }
        if self.samples.contains(&HealthSample::Invalid) {
            return ConservativeStatus::Invalid;
        }
        if self.samples.contains(&HealthSample::Busy) {
            return ConservativeStatus::Busy;
        }
        ConservativeStatus::Idle
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Last probe observation for one backend, as shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct BackendMetrics {
    pub status: ConservativeStatus,
    pub gpu_util_max5s: Option<f64>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
}
