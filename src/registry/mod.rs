//! Server registry: the immutable runtime catalog built from the
//! server-list document.
//!
//! The registry owns the server configs, the compiled model-routing rules,
//! and the resolved fallback backend. It is built once at startup and only
//! ever read afterwards, so it is shared as a plain `Arc` with no interior
//! locking.

use crate::config::ServerListConfig;
use regex::Regex;
use tracing::warn;

/// A single backend server from the catalog.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    /// Origin prefix without a trailing slash.
    pub addr: String,
    pub health_port: u16,
    pub model_port: u16,
    /// Cap on total concurrent requests at this backend.
    pub request_max: Option<u32>,
}

impl ServerConfig {
    /// Base URL of the health endpoint (`addr:health_port`).
    pub fn health_base(&self) -> String {
        format!("{}:{}", self.addr, self.health_port)
    }

    /// Base URL requests are proxied to (`addr:model_port`).
    pub fn model_base(&self) -> String {
        format!("{}:{}", self.addr, self.model_port)
    }
}

/// One compiled routing rule. The regex must match the full model name.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    regex: Regex,
    /// Target server names in declared order.
    pub servers: Vec<String>,
    /// The pattern string as written in the config file.
    pub pattern: String,
}

impl RoutingRule {
    pub fn matches(&self, model: &str) -> bool {
        self.regex.is_match(model)
    }
}

/// Immutable catalog of servers, routing rules, and the fallback backend.
pub struct ServerRegistry {
    servers: Vec<ServerConfig>,
    rules: Vec<RoutingRule>,
    /// Resolved fallback, in model-base form.
    fallback: Option<String>,
}

impl ServerRegistry {
    /// Build the registry from a parsed server-list document.
    ///
    /// Invalid regexes and rules whose targets name no known server are
    /// dropped with a warning. When the document carries no server catalog
    /// at all (legacy shape), rules are kept verbatim so every request
    /// resolves to the fallback.
    pub fn from_config(config: &ServerListConfig) -> Self {
        let servers: Vec<ServerConfig> = config
            .servers
            .iter()
            .map(|entry| ServerConfig {
                name: entry.name.clone(),
                addr: entry.addr.clone(),
                health_port: entry.health_port,
                model_port: entry.model_port,
                request_max: entry.request_max,
            })
            .collect();

        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            // Full-string match, like the rest of the OpenAI model routing world.
            let regex = match Regex::new(&format!("^(?:{})$", rule.pattern)) {
                Ok(regex) => regex,
                Err(e) => {
                    warn!(pattern = %rule.pattern, error = %e, "skipping invalid routing regex");
                    continue;
                }
            };

            let targets: Vec<String> = if servers.is_empty() {
                rule.servers.clone()
            } else {
                rule.servers
                    .iter()
                    .filter(|name| servers.iter().any(|s| &s.name == *name))
                    .cloned()
                    .collect()
            };
            if targets.is_empty() {
                warn!(pattern = %rule.pattern, "skipping routing rule with no known servers");
                continue;
            }

            rules.push(RoutingRule {
                regex,
                servers: targets,
                pattern: rule.pattern.clone(),
            });
        }

        let fallback = resolve_fallback(config, &servers);

        Self {
            servers,
            rules,
            fallback,
        }
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn health_bases(&self) -> Vec<String> {
        self.servers.iter().map(ServerConfig::health_base).collect()
    }

    pub fn model_bases(&self) -> Vec<String> {
        self.servers.iter().map(ServerConfig::model_base).collect()
    }

    /// Target server names of the first rule matching the full model name.
    pub fn servers_for_model(&self, model: &str) -> &[String] {
        self.rules
            .iter()
            .find(|rule| rule.matches(model))
            .map(|rule| rule.servers.as_slice())
            .unwrap_or(&[])
    }

    /// The fallback backend in model-base form.
    pub fn fallback_backend(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn server_by_model_base(&self, base: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.model_base() == base)
    }

    pub fn server_by_health_base(&self, base: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.health_base() == base)
    }
}

fn resolve_fallback(config: &ServerListConfig, servers: &[ServerConfig]) -> Option<String> {
    if let Some(name) = &config.fallback_server {
        if let Some(server) = servers.iter().find(|s| &s.name == name) {
            return Some(server.model_base());
        }
        if servers.is_empty() {
            // Legacy documents name the fallback by URL rather than by server.
            return Some(name.trim_end_matches('/').to_string());
        }
    }
    servers.first().map(ServerConfig::model_base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerListConfig;

    fn registry_from(json: &str) -> ServerRegistry {
        ServerRegistry::from_config(&ServerListConfig::from_json(json).unwrap())
    }

    #[test]
    fn test_base_urls() {
        let registry = registry_from(
            r#"{"servers": {"a": {"addr": "http://h", "health-port": 9000, "model-port": 9001}}}"#,
        );
        let server = registry.server("a").unwrap();
        assert_eq!(server.health_base(), "http://h:9000");
        assert_eq!(server.model_base(), "http://h:9001");
    }

    #[test]
    fn test_first_match_wins() {
        let registry = registry_from(
            r#"{
                "servers": {
                    "a": {"addr": "http://a", "health-port": 1, "model-port": 2},
                    "b": {"addr": "http://b", "health-port": 1, "model-port": 2}
                },
                "models": {"llama.*": ["a"], ".*": ["b"]}
            }"#,
        );
        assert_eq!(registry.servers_for_model("llama3"), ["a"]);
        assert_eq!(registry.servers_for_model("qwen"), ["b"]);
    }

    #[test]
    fn test_regex_matches_full_model_name() {
        let registry = registry_from(
            r#"{
                "servers": {"a": {"addr": "http://a", "health-port": 1, "model-port": 2}},
                "models": {"llama": ["a"]}
            }"#,
        );
        assert_eq!(registry.servers_for_model("llama"), ["a"]);
        assert!(registry.servers_for_model("llama3").is_empty());
        assert!(registry.servers_for_model("xllama").is_empty());
    }

    #[test]
    fn test_invalid_regex_skipped() {
        let registry = registry_from(
            r#"{
                "servers": {"a": {"addr": "http://a", "health-port": 1, "model-port": 2}},
                "models": {"[unclosed": ["a"], "ok.*": ["a"]}
            }"#,
        );
        assert_eq!(registry.rules().len(), 1);
        assert_eq!(registry.rules()[0].pattern, "ok.*");
    }

    #[test]
    fn test_unknown_server_reference_dropped() {
        let registry = registry_from(
            r#"{
                "servers": {"a": {"addr": "http://a", "health-port": 1, "model-port": 2}},
                "models": {"x.*": ["ghost", "a"], "y.*": ["ghost"]}
            }"#,
        );
        assert_eq!(registry.rules().len(), 1);
        assert_eq!(registry.servers_for_model("x1"), ["a"]);
    }

    #[test]
    fn test_fallback_by_name() {
        let registry = registry_from(
            r#"{
                "servers": {
                    "a": {"addr": "http://a", "health-port": 1, "model-port": 2},
                    "b": {"addr": "http://b", "health-port": 3, "model-port": 4}
                },
                "fallback_server": "b"
            }"#,
        );
        assert_eq!(registry.fallback_backend(), Some("http://b:4"));
    }

    #[test]
    fn test_fallback_defaults_to_first_server() {
        let registry = registry_from(
            r#"{
                "servers": {
                    "a": {"addr": "http://a", "health-port": 1, "model-port": 2},
                    "b": {"addr": "http://b", "health-port": 3, "model-port": 4}
                },
                "fallback_server": "ghost"
            }"#,
        );
        assert_eq!(registry.fallback_backend(), Some("http://a:2"));
    }

    #[test]
    fn test_empty_catalog_has_no_fallback() {
        let registry = registry_from("{}");
        assert_eq!(registry.fallback_backend(), None);
        assert!(registry.servers().is_empty());
    }

    #[test]
    fn test_legacy_document_keeps_rules_and_url_fallback() {
        let registry = registry_from(
            r#"{
                "models": {"llama.*": ["http://h:9001"]},
                "fallback_server": "http://h:9001/"
            }"#,
        );
        assert!(registry.servers().is_empty());
        assert_eq!(registry.rules().len(), 1);
        assert_eq!(registry.fallback_backend(), Some("http://h:9001"));
    }

    #[test]
    fn test_lookup_by_base() {
        let registry = registry_from(
            r#"{"servers": {"a": {"addr": "http://h", "health-port": 9000, "model-port": 9001}}}"#,
        );
        assert_eq!(
            registry.server_by_model_base("http://h:9001").map(|s| s.name.as_str()),
            Some("a")
        );
        assert_eq!(
            registry.server_by_health_base("http://h:9000").map(|s| s.name.as_str()),
            Some("a")
        );
        assert!(registry.server_by_model_base("http://h:9000").is_none());
    }
}
