//! Aggregated model listing across the fleet.

use crate::api::AppState;
use axum::{extract::State, Json};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;

/// Models list response in OpenAI format.
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
}

fn replica_id() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Replica instances advertise as `name-2`, `name-3`, …; clients only
    // ever ask for the base name.
    PATTERN.get_or_init(|| Regex::new(r"^.+-\d+$").expect("replica pattern must compile"))
}

/// GET /v1/models - Union of the fleet's models, minus numbered replicas.
pub async fn handle(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let fetches = state.registry.model_bases().into_iter().map(|model_base| {
        let catalog = Arc::clone(&state.catalog);
        async move { catalog.available_models(&model_base).await }
    });

    let mut all_models: HashSet<String> = HashSet::new();
    for models in futures::future::join_all(fetches).await {
        all_models.extend(models);
    }

    let mut data: Vec<ModelObject> = all_models
        .into_iter()
        .filter(|model| !replica_id().is_match(model))
        .map(|id| ModelObject {
            id,
            object: "model".to_string(),
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_pattern() {
        assert!(replica_id().is_match("llama3-2"));
        assert!(replica_id().is_match("llama3-10"));
        assert!(!replica_id().is_match("llama3"));
        assert!(!replica_id().is_match("gpt-4o"));
        assert!(replica_id().is_match("gpt-4"));
        assert!(!replica_id().is_match("-2"));
    }
}
