//! Sticky sessions: short-lived affinity from (ident, model) to a server.
//!
//! A client that just talked to a backend keeps landing on it for a few
//! minutes, which keeps its KV cache warm. Entries bind a structured
//! (ident, model) key to a server name; binding by name rather than by URL
//! keeps the health and capacity lookups on the registry instead of string
//! surgery on base URLs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Affinity lifetime since last use.
pub const STICKY_TTL: Duration = Duration::from_secs(180);

/// Structured table key. Never a joined string, so idents containing the
/// old `|` separator cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StickyKey {
    pub ident: String,
    pub model: String,
}

#[derive(Debug, Clone)]
struct StickyEntry {
    server: String,
    last_update: Instant,
    updated_at: DateTime<Utc>,
}

/// One table row as exposed on the dashboard snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StickyView {
    pub ident: String,
    pub model: String,
    pub server: String,
    pub updated_at: DateTime<Utc>,
}

/// TTL table of (ident, model) → server bindings.
pub struct StickyTable {
    ttl: Duration,
    entries: Mutex<HashMap<StickyKey, StickyEntry>>,
}

impl Default for StickyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StickyTable {
    pub fn new() -> Self {
        Self::with_ttl(STICKY_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The bound server for (ident, model), if fresh. Expired entries are
    /// removed on read.
    pub fn get(&self, ident: &str, model: &str) -> Option<String> {
        let key = StickyKey {
            ident: ident.to_string(),
            model: model.to_string(),
        };
        let mut entries = self.entries.lock().expect("sticky lock poisoned");
        match entries.get(&key) {
            Some(entry) if entry.last_update.elapsed() <= self.ttl => Some(entry.server.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Bind (ident, model) to `server`, evicting any other ident bound to
    /// the same (model, server) pair first. One critical section, so each
    /// (model, server) has at most one current ident.
    pub fn update(&self, ident: &str, server: &str, model: &str) {
        let key = StickyKey {
            ident: ident.to_string(),
            model: model.to_string(),
        };
        let mut entries = self.entries.lock().expect("sticky lock poisoned");
        entries.retain(|k, v| !(k.model == model && v.server == server && k.ident != ident));
        entries.insert(
            key,
            StickyEntry {
                server: server.to_string(),
                last_update: Instant::now(),
                updated_at: Utc::now(),
            },
        );
    }

    /// Sweep all expired entries.
    pub fn cleanup(&self) {
        let mut entries = self.entries.lock().expect("sticky lock poisoned");
        entries.retain(|_, entry| entry.last_update.elapsed() <= self.ttl);
    }

    /// Current rows, for the dashboard.
    pub fn snapshot(&self) -> Vec<StickyView> {
        let entries = self.entries.lock().expect("sticky lock poisoned");
        let mut rows: Vec<StickyView> = entries
            .iter()
            .map(|(key, entry)| StickyView {
                ident: key.ident.clone(),
                model: key.model.clone(),
                server: entry.server.clone(),
                updated_at: entry.updated_at,
            })
            .collect();
        rows.sort_by(|a, b| a.ident.cmp(&b.ident).then_with(|| a.model.cmp(&b.model)));
        rows
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("sticky lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_unknown_is_none() {
        let table = StickyTable::new();
        assert_eq!(table.get("u", "m"), None);
    }

    #[test]
    fn test_update_then_get() {
        let table = StickyTable::new();
        table.update("u", "srv-a", "m");
        assert_eq!(table.get("u", "m").as_deref(), Some("srv-a"));
        assert_eq!(table.get("u", "other"), None);
    }

    #[test]
    fn test_expired_entry_removed_on_read() {
        let table = StickyTable::with_ttl(Duration::from_millis(10));
        table.update("u", "srv-a", "m");
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(table.get("u", "m"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_exclusivity_per_model_and_server() {
        let table = StickyTable::new();
        table.update("u1", "srv-a", "m");
        table.update("u2", "srv-a", "m");
        table.update("u3", "srv-a", "m");

        // Only the latest ident keeps the (m, srv-a) binding.
        assert_eq!(table.get("u1", "m"), None);
        assert_eq!(table.get("u2", "m"), None);
        assert_eq!(table.get("u3", "m").as_deref(), Some("srv-a"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_model_different_servers_coexist() {
        let table = StickyTable::new();
        table.update("u1", "srv-a", "m");
        table.update("u2", "srv-b", "m");
        assert_eq!(table.get("u1", "m").as_deref(), Some("srv-a"));
        assert_eq!(table.get("u2", "m").as_deref(), Some("srv-b"));
    }

    #[test]
    fn test_update_is_idempotent_and_refreshes() {
        let table = StickyTable::with_ttl(Duration::from_millis(60));
        table.update("u", "srv-a", "m");
        std::thread::sleep(Duration::from_millis(40));
        table.update("u", "srv-a", "m");
        std::thread::sleep(Duration::from_millis(40));
        // Refreshed at t=40ms, so still alive at t=80ms.
        assert_eq!(table.get("u", "m").as_deref(), Some("srv-a"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cleanup_sweeps_expired() {
        let table = StickyTable::with_ttl(Duration::from_millis(10));
        table.update("u1", "srv-a", "m1");
        table.update("u2", "srv-b", "m2");
        std::thread::sleep(Duration::from_millis(25));
        table.update("u3", "srv-c", "m3");
        table.cleanup();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("u3", "m3").as_deref(), Some("srv-c"));
    }

    #[test]
    fn test_ident_containing_separator_does_not_collide() {
        let table = StickyTable::new();
        table.update("a|b", "srv-a", "m");
        table.update("a", "srv-b", "b|m");
        assert_eq!(table.get("a|b", "m").as_deref(), Some("srv-a"));
        assert_eq!(table.get("a", "b|m").as_deref(), Some("srv-b"));
    }

    #[test]
    fn test_snapshot_rows() {
        let table = StickyTable::new();
        table.update("u2", "srv-b", "m");
        table.update("u1", "srv-a", "m");
        let rows = table.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ident, "u1");
        assert_eq!(rows[0].server, "srv-a");
    }
}
