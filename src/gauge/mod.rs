//! Local GPU utilization gauge.
//!
//! The proxy self-reports busy/idle on its own `/llmhealth` endpoint based
//! on the maximum GPU utilization seen over the last few seconds. Where
//! that number comes from is host-specific, so the sampler is a trait; the
//! default implementation reports nothing and the gauge reads 0.0.

use crate::health::WINDOW_SECONDS;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Utilization above which the proxy reports itself busy.
pub const BUSY_THRESHOLD: f64 = 50.0;

/// Source of instantaneous GPU utilization, as a percentage in [0, 100].
#[async_trait]
pub trait UtilizationSampler: Send + Sync {
    /// One sample; `None` when the host exposes no usable counter.
    async fn sample(&self) -> Option<f64>;
}

/// Sampler for hosts without GPU counters; the gauge stays at zero.
pub struct NullSampler;

#[async_trait]
impl UtilizationSampler for NullSampler {
    async fn sample(&self) -> Option<f64> {
        None
    }
}

/// Rolling window over sampled utilization; readers get the window max.
pub struct UtilizationGauge {
    sampler: Arc<dyn UtilizationSampler>,
    window: Mutex<VecDeque<f64>>,
}

impl UtilizationGauge {
    pub fn new(sampler: Arc<dyn UtilizationSampler>) -> Self {
        Self {
            sampler,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Maximum over the current window; 0.0 before the first sample.
    pub fn max(&self) -> f64 {
        let window = self.window.lock().expect("gauge lock poisoned");
        window.iter().copied().fold(0.0, f64::max)
    }

    /// Push one sample, keeping the window bounded.
    pub fn record(&self, value: f64) {
        let mut window = self.window.lock().expect("gauge lock poisoned");
        if window.len() == WINDOW_SECONDS {
            window.pop_front();
        }
        window.push_back(value);
    }

    /// Start the sampling loop, one sample per second.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(window = WINDOW_SECONDS, "utilization gauge started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let value = self.sampler.sample().await.unwrap_or(0.0);
                        self.record(value);
                    }
                }
            }
        })
    }
}
