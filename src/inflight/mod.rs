//! In-flight request accounting.
//!
//! Tracks concurrent proxied requests per (backend, model instance). The
//! counter is incremented just before upstream dispatch and decremented
//! exactly once when the response stream terminates, on every path.

use std::collections::HashMap;
use std::sync::Mutex;

/// Concurrent request counts, keyed by backend model-base then model.
///
/// Zero entries are elided: a decrement from one removes the key, and
/// lookups of absent keys read zero.
#[derive(Default)]
pub struct InFlightTracker {
    counts: Mutex<HashMap<String, HashMap<String, u32>>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count for one (backend, model) pair; 0 when absent.
    pub fn get(&self, backend: &str, model: &str) -> u32 {
        if backend.is_empty() || model.is_empty() {
            return 0;
        }
        let counts = self.counts.lock().expect("in-flight lock poisoned");
        counts
            .get(backend)
            .and_then(|models| models.get(model))
            .copied()
            .unwrap_or(0)
    }

    /// Sum over all models at one backend.
    pub fn total(&self, backend: &str) -> u32 {
        if backend.is_empty() {
            return 0;
        }
        let counts = self.counts.lock().expect("in-flight lock poisoned");
        counts
            .get(backend)
            .map(|models| models.values().sum())
            .unwrap_or(0)
    }

    /// Whether the backend may take another request under its cap.
    ///
    /// The cap applies to the backend's total, not per model. This read is
    /// advisory: it is not atomic with a subsequent `inc`, so concurrent
    /// selectors can overshoot by at most one each.
    pub fn can_accept(&self, backend: &str, model: &str, request_max: Option<u32>) -> bool {
        if backend.is_empty() || model.is_empty() {
            return false;
        }
        let Some(max) = request_max else {
            return true;
        };
        self.total(backend) < max
    }

    pub fn inc(&self, backend: &str, model: &str) {
        if backend.is_empty() || model.is_empty() {
            return;
        }
        let mut counts = self.counts.lock().expect("in-flight lock poisoned");
        *counts
            .entry(backend.to_string())
            .or_default()
            .entry(model.to_string())
            .or_insert(0) += 1;
    }

    pub fn dec(&self, backend: &str, model: &str) {
        if backend.is_empty() || model.is_empty() {
            return;
        }
        let mut counts = self.counts.lock().expect("in-flight lock poisoned");
        if let Some(models) = counts.get_mut(backend) {
            match models.get_mut(model) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    models.remove(model);
                }
                None => {}
            }
            if models.is_empty() {
                counts.remove(backend);
            }
        }
    }

    /// Per-model counts at one backend, for the dashboard snapshot.
    pub fn models_for(&self, backend: &str) -> HashMap<String, u32> {
        let counts = self.counts.lock().expect("in-flight lock poisoned");
        counts.get(backend).cloned().unwrap_or_default()
    }
}
