//! Backend selection.
//!
//! The selector combines the routing rules, health windows, in-flight
//! counts, model catalog, and sticky table into one decision: which backend
//! gets this request, and under which model-instance name.

use crate::catalog::ModelCatalog;
use crate::health::{ConservativeStatus, HealthMonitor};
use crate::inflight::InFlightTracker;
use crate::registry::{ServerConfig, ServerRegistry};
use crate::sticky::StickyTable;
use std::sync::Arc;
use tracing::debug;

/// Ranking suffixes callers append to hint quality. Stripped for capacity
/// and instance discovery, probed in exactly this order, at most one
/// removed.
const RANKING_SUFFIXES: [&str; 3] = ["-low", "-medium", "-high"];

/// Remove a single trailing ranking suffix, if any.
pub fn strip_ranking_suffix(model: &str) -> &str {
    for suffix in RANKING_SUFFIXES {
        if let Some(stripped) = model.strip_suffix(suffix) {
            return stripped;
        }
    }
    model
}

/// The outcome of a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Model-base URL of the chosen backend.
    pub backend: String,
    /// Server name, when the backend is in the catalog.
    pub server: Option<String>,
    /// Model name to send upstream; may be a specific replica instance.
    pub model: String,
    /// Whether `model` differs from what the client asked for.
    pub rewritten: bool,
}

/// Picks one (backend, model instance) per request.
pub struct Selector {
    registry: Arc<ServerRegistry>,
    monitor: Arc<HealthMonitor>,
    inflight: Arc<InFlightTracker>,
    catalog: Arc<ModelCatalog>,
    sticky: Arc<StickyTable>,
}

impl Selector {
    pub fn new(
        registry: Arc<ServerRegistry>,
        monitor: Arc<HealthMonitor>,
        inflight: Arc<InFlightTracker>,
        catalog: Arc<ModelCatalog>,
        sticky: Arc<StickyTable>,
    ) -> Self {
        Self {
            registry,
            monitor,
            inflight,
            catalog,
            sticky,
        }
    }

    /// Select a backend for `model` on behalf of `ident`.
    ///
    /// Returns `None` only when nothing matches and no fallback is
    /// configured at all.
    pub async fn select(&self, ident: &str, model: &str) -> Option<Selection> {
        let server_names = self.registry.servers_for_model(model);
        if server_names.is_empty() {
            return self.fallback(model);
        }

        let candidates: Vec<&ServerConfig> = server_names
            .iter()
            .filter_map(|name| self.registry.server(name))
            .collect();
        if candidates.is_empty() {
            return self.fallback(model);
        }

        // Sticky affinity wins while the bound backend stays usable.
        if let Some(selection) = self.sticky_selection(ident, model, &candidates) {
            return Some(selection);
        }

        let base_model = strip_ranking_suffix(model);

        for server in &candidates {
            let status = self.monitor.conservative_status(&server.health_base());
            if status == ConservativeStatus::Invalid {
                continue;
            }

            let backend = server.model_base();
            if !self
                .inflight
                .can_accept(&backend, base_model, server.request_max)
            {
                debug!(server = %server.name, model = %base_model, "skipping backend at request cap");
                continue;
            }

            if self.catalog.count_instances(&backend, base_model).await == 0 {
                continue;
            }

            let (total_inflight, idle_instances) = self
                .catalog
                .instances_inflight_status(&backend, base_model, &self.inflight)
                .await;

            // Tier 1: nothing in flight on a reported-idle backend.
            if total_inflight == 0 && status == ConservativeStatus::Idle {
                return Some(selection(server, model, false));
            }

            // Tier 2: a specific replica instance is free.
            if let Some(instance) = idle_instances.first() {
                let rewritten = instance != model;
                return Some(selection(server, instance, rewritten));
            }

            // Tier 3: backend reports idle even with requests in flight.
            if status == ConservativeStatus::Idle {
                return Some(selection(server, model, false));
            }
        }

        // Everyone was skipped or busy: hand the request to the first
        // matched backend anyway rather than failing it.
        Some(selection(candidates[0], model, false))
    }

    fn sticky_selection(
        &self,
        ident: &str,
        model: &str,
        candidates: &[&ServerConfig],
    ) -> Option<Selection> {
        let bound = self.sticky.get(ident, model)?;
        let server = candidates.iter().find(|s| s.name == bound)?;

        let status = self.monitor.conservative_status(&server.health_base());
        if status == ConservativeStatus::Invalid {
            return None;
        }
        if !self
            .inflight
            .can_accept(&server.model_base(), model, server.request_max)
        {
            return None;
        }

        debug!(ident = %ident, server = %server.name, model = %model, "sticky backend reused");
        Some(selection(server, model, false))
    }

    fn fallback(&self, model: &str) -> Option<Selection> {
        let backend = self.registry.fallback_backend()?.to_string();
        let server = self
            .registry
            .server_by_model_base(&backend)
            .map(|s| s.name.clone());
        Some(Selection {
            backend,
            server,
            model: model.to_string(),
            rewritten: false,
        })
    }
}

fn selection(server: &ServerConfig, model: &str, rewritten: bool) -> Selection {
    Selection {
        backend: server.model_base(),
        server: Some(server.name.clone()),
        model: model.to_string(),
        rewritten,
    }
}
