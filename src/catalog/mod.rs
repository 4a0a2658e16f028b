//! Model-instance catalog.
//!
//! Each backend advertises its loaded models on `/v1/models`; replicas of a
//! model appear as `name`, `name-2`, `name-3`, and so on. The catalog keeps
//! a short-lived per-backend cache of that set and derives instance counts
//! and idle-instance lists from it.
//!
//! Fetch failures are cached as empty sets for a full TTL, which caps the
//! request rate against a misbehaving backend. Concurrent refreshes race
//! benignly: the sets are near-idempotent over the 10 second window, so the
//! last writer wins.

use crate::inflight::InFlightTracker;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache lifetime of one backend's model set.
pub const MODELS_CACHE_TTL: Duration = Duration::from_secs(10);

struct CacheSlot {
    models: HashSet<String>,
    expires_at: Instant,
}

/// TTL cache of the model IDs advertised by each backend.
pub struct ModelCatalog {
    client: reqwest::Client,
    ttl: Duration,
    cache: DashMap<String, CacheSlot>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCatalog {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(crate::health::PROBE_CONNECT_TIMEOUT)
            .read_timeout(crate::health::PROBE_READ_TIMEOUT)
            .build()
            .expect("failed to build catalog HTTP client");
        Self::with_client(client)
    }

    /// Construct with a custom HTTP client (for testing).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            ttl: MODELS_CACHE_TTL,
            cache: DashMap::new(),
        }
    }

    /// The set of model IDs currently advertised by `backend`.
    ///
    /// Served from cache within the TTL; otherwise refetched. The network
    /// fetch happens outside the cache lock.
    pub async fn available_models(&self, backend: &str) -> HashSet<String> {
        let cached = self.cache.get(backend).and_then(|slot| {
            (slot.expires_at > Instant::now()).then(|| slot.models.clone())
        });
        if let Some(models) = cached {
            return models;
        }

        let models = self.fetch(backend).await;
        self.cache.insert(
            backend.to_string(),
            CacheSlot {
                models: models.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        models
    }

    /// Number of instances of `model` at `backend`: the base name plus the
    /// contiguous `model-2`, `model-3`, … run.
    pub async fn count_instances(&self, backend: &str, model: &str) -> usize {
        let models = self.available_models(backend).await;
        replica_run(&models, model).len()
    }

    /// In-flight totals across the instances of `model` at `backend`.
    ///
    /// Returns the summed in-flight count and the instances currently at
    /// zero, in numeric order with the base name first.
    pub async fn instances_inflight_status(
        &self,
        backend: &str,
        model: &str,
        inflight: &InFlightTracker,
    ) -> (u32, Vec<String>) {
        let models = self.available_models(backend).await;
        let mut total = 0;
        let mut idle = Vec::new();
        for instance in replica_run(&models, model) {
            let count = inflight.get(backend, &instance);
            total += count;
            if count == 0 {
                idle.push(instance);
            }
        }
        (total, idle)
    }

    /// Seed the cache directly, bypassing the network (test hook).
    #[cfg(test)]
    pub(crate) fn seed<I>(&self, backend: &str, models: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.cache.insert(
            backend.to_string(),
            CacheSlot {
                models: models.into_iter().collect(),
                expires_at: Instant::now() + Duration::from_secs(3600),
            },
        );
    }

    async fn fetch(&self, backend: &str) -> HashSet<String> {
        let url = format!("{}/v1/models", backend.trim_end_matches('/'));
        match self.try_fetch(&url).await {
            Ok(models) => models,
            Err(e) => {
                debug!(backend = %backend, error = %e, "model list fetch failed");
                HashSet::new()
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<HashSet<String>, reqwest::Error> {
        let response = self.client.get(url).send().await?;

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Ok(HashSet::new());
        }

        let value: Value = response.json().await?;
        Ok(parse_model_ids(&value))
    }
}

/// Pull model IDs out of either `{"data": [...]}` or a bare top-level list;
/// items may be strings or objects carrying `id` or `name`.
fn parse_model_ids(value: &Value) -> HashSet<String> {
    let items = match value {
        Value::Object(map) => map.get("data").and_then(Value::as_array),
        Value::Array(items) => Some(items),
        _ => None,
    };

    let mut ids = HashSet::new();
    for item in items.into_iter().flatten() {
        match item {
            Value::String(id) => {
                ids.insert(id.clone());
            }
            Value::Object(map) => {
                if let Some(id) = map
                    .get("id")
                    .and_then(Value::as_str)
                    .or_else(|| map.get("name").and_then(Value::as_str))
                {
                    ids.insert(id.to_string());
                }
            }
            _ => {}
        }
    }
    ids
}

/// The contiguous replica run of `model` in `models`: base name, then
/// `model-2`, `model-3`, … stopping at the first gap.
fn replica_run(models: &HashSet<String>, model: &str) -> Vec<String> {
    let mut run = Vec::new();
    if models.contains(model) {
        run.push(model.to_string());
    } else {
        return run;
    }
    let mut i = 2;
    loop {
        let candidate = format!("{model}-{i}");
        if !models.contains(&candidate) {
            break;
        }
        run.push(candidate);
        i += 1;
    }
    run
}
