//! Bounded-age access log for chat/completions requests.
//!
//! A ring of (ip, model, timestamp, username) entries kept for one hour,
//! used only by the dashboard's statistics endpoint. Eviction happens from
//! the front on every insert and on every stats read.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

/// How long entries are retained.
pub const RETENTION_HOURS: i64 = 1;

#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub ip: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub username: Option<String>,
}

/// Aggregated view served on `/access-log-stats`.
#[derive(Debug, Clone, Serialize)]
pub struct AccessStats {
    pub total_requests: usize,
    pub unique_ips: usize,
    pub unique_models: usize,
    pub unique_usernames: usize,
    pub ip_counts: HashMap<String, u64>,
    pub model_counts: HashMap<String, u64>,
    pub username_counts: HashMap<String, u64>,
    /// Requests binned to 1-minute UTC intervals, keyed by interval start.
    pub time_series: BTreeMap<String, u64>,
    pub retention_hours: i64,
    pub oldest_log: Option<DateTime<Utc>>,
    pub newest_log: Option<DateTime<Utc>>,
}

/// Time-ordered ring of recent accesses.
pub struct AccessLog {
    retention: Duration,
    entries: Mutex<VecDeque<AccessLogEntry>>,
}

impl Default for AccessLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessLog {
    pub fn new() -> Self {
        Self::with_retention(Duration::hours(RETENTION_HOURS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append one access and evict everything past retention.
    pub fn record(&self, ip: &str, model: &str, username: Option<&str>) {
        let mut entries = self.entries.lock().expect("access log lock poisoned");
        entries.push_back(AccessLogEntry {
            ip: ip.to_string(),
            model: model.to_string(),
            timestamp: Utc::now(),
            username: username.map(str::to_string),
        });
        Self::evict(&mut entries, self.retention);
    }

    /// Aggregate the retained entries.
    pub fn stats(&self) -> AccessStats {
        let mut entries = self.entries.lock().expect("access log lock poisoned");
        Self::evict(&mut entries, self.retention);

        let mut ip_counts: HashMap<String, u64> = HashMap::new();
        let mut model_counts: HashMap<String, u64> = HashMap::new();
        let mut username_counts: HashMap<String, u64> = HashMap::new();
        let mut time_series: BTreeMap<String, u64> = BTreeMap::new();

        for entry in entries.iter() {
            *ip_counts.entry(entry.ip.clone()).or_default() += 1;
            *model_counts.entry(entry.model.clone()).or_default() += 1;
            if let Some(username) = &entry.username {
                *username_counts.entry(username.clone()).or_default() += 1;
            }
            let minute = entry
                .timestamp
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(entry.timestamp);
            *time_series.entry(minute.to_rfc3339()).or_default() += 1;
        }

        AccessStats {
            total_requests: entries.len(),
            unique_ips: ip_counts.len(),
            unique_models: model_counts.len(),
            unique_usernames: username_counts.len(),
            ip_counts,
            model_counts,
            username_counts,
            time_series,
            retention_hours: RETENTION_HOURS,
            oldest_log: entries.front().map(|e| e.timestamp),
            newest_log: entries.back().map(|e| e.timestamp),
        }
    }

    fn evict(entries: &mut VecDeque<AccessLogEntry>, retention: Duration) {
        let cutoff = Utc::now() - retention;
        while entries.front().is_some_and(|e| e.timestamp < cutoff) {
            entries.pop_front();
        }
    }
}
