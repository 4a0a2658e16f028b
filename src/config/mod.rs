//! Configuration module for Baton.
//!
//! Loads the server-list document: the server catalog, the ordered
//! model-to-server routing rules, and the fallback server. The file is
//! JSON; its path comes from the `SERVER_LIST_JSON` environment variable
//! and defaults to `server-list.json`.
//!
//! Loading is deliberately lenient. A malformed server block, a rule with
//! no usable targets, or a bad port is dropped with a warning and the rest
//! of the document is kept, so a single typo never takes the proxy down.

mod error;

pub use error::ConfigError;

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable naming the config file.
pub const SERVER_LIST_ENV: &str = "SERVER_LIST_JSON";

/// Default config file path when the environment variable is unset.
pub const DEFAULT_SERVER_LIST: &str = "server-list.json";

/// One server block from the `servers` table, order preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    /// Origin prefix without a trailing slash.
    pub addr: String,
    pub health_port: u16,
    pub model_port: u16,
    /// Cap on total concurrent requests at the backend; absent = unbounded.
    pub request_max: Option<u32>,
}

/// One routing rule from the `models` table, order preserved.
///
/// Server names are kept verbatim here; validation against the catalog
/// happens when the registry is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub pattern: String,
    pub servers: Vec<String>,
}

/// The parsed server-list document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerListConfig {
    pub servers: Vec<ServerEntry>,
    pub rules: Vec<RuleEntry>,
    pub fallback_server: Option<String>,
}

impl ServerListConfig {
    /// Resolve the config file path from the environment.
    pub fn path_from_env() -> PathBuf {
        std::env::var(SERVER_LIST_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SERVER_LIST))
    }

    /// Load and parse the config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a server-list document from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let root: Value =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let root = root.as_object().ok_or(ConfigError::NotAnObject)?;

        let mut config = ServerListConfig::default();

        if let Some(servers) = root.get("servers").and_then(Value::as_object) {
            for (name, block) in servers {
                match parse_server_entry(name, block) {
                    Some(entry) => config.servers.push(entry),
                    None => warn!(server = %name, "skipping malformed server entry"),
                }
            }
        }

        if let Some(models) = root.get("models").and_then(Value::as_object) {
            for (pattern, targets) in models {
                match parse_rule_entry(pattern, targets) {
                    Some(rule) => config.rules.push(rule),
                    None => warn!(pattern = %pattern, "skipping routing rule with no server list"),
                }
            }
        }

        config.fallback_server = root
            .get("fallback_server")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(config)
    }
}

fn parse_server_entry(name: &str, block: &Value) -> Option<ServerEntry> {
    let block = block.as_object()?;
    let addr = block.get("addr")?.as_str()?;
    let health_port = parse_port(block.get("health-port")?)?;
    let model_port = parse_port(block.get("model-port")?)?;
    let request_max = block
        .get("request-max")
        .and_then(Value::as_u64)
        .filter(|&n| n > 0)
        .and_then(|n| u32::try_from(n).ok());

    Some(ServerEntry {
        name: name.to_string(),
        addr: addr.trim_end_matches('/').to_string(),
        health_port,
        model_port,
        request_max,
    })
}

fn parse_port(value: &Value) -> Option<u16> {
    value.as_u64().and_then(|n| u16::try_from(n).ok())
}

fn parse_rule_entry(pattern: &str, targets: &Value) -> Option<RuleEntry> {
    let targets = targets.as_array()?;
    let servers: Vec<String> = targets
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    if servers.is_empty() {
        return None;
    }
    Some(RuleEntry {
        pattern: pattern.to_string(),
        servers,
    })
}
