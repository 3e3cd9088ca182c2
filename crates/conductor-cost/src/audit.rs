use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One recorded access attempt against the cost query surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Empty when authentication itself failed.
    pub user_id: String,
    pub action: String,
    pub resource: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl AuditEntry {
    pub fn success(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: user_id.into(),
            action: action.into(),
            resource: resource.into(),
            success: true,
            error: None,
            client_ip: None,
            user_agent: None,
        }
    }

    pub fn failure(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(user_id, action, resource)
        }
    }

    pub fn with_client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.client_ip = ip;
        self.user_agent = user_agent;
        self
    }
}

const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded in-memory audit log. Oldest entries are evicted once capacity is
/// reached; queries return entries newest-first.
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn log(&self, entry: AuditEntry) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn collect_rev<F>(&self, limit: usize, pred: F) -> Vec<AuditEntry>
    where
        F: Fn(&AuditEntry) -> bool,
    {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|e| pred(e))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.collect_rev(limit, |_| true)
    }

    pub fn query_by_user(&self, user_id: &str, limit: usize) -> Vec<AuditEntry> {
        self.collect_rev(limit, |e| e.user_id == user_id)
    }

    pub fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<AuditEntry> {
        self.collect_rev(limit, |e| e.timestamp >= start && e.timestamp <= end)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_is_reverse_chronological() {
        let log = AuditLog::new();
        log.log(AuditEntry::success("alice", "costs.view", "/v1/costs"));
        log.log(AuditEntry::success("bob", "costs.view", "/v1/costs"));
        log.log(AuditEntry::failure("", "costs.view", "/v1/costs", "missing authentication"));

        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_id, "");
        assert!(!recent[0].success);
        assert_eq!(recent[2].user_id, "alice");
    }

    #[test]
    fn query_by_user_filters() {
        let log = AuditLog::new();
        log.log(AuditEntry::success("alice", "a", "r"));
        log.log(AuditEntry::success("bob", "b", "r"));
        log.log(AuditEntry::success("alice", "c", "r"));

        let entries = log.query_by_user("alice", 10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "c");
    }

    #[test]
    fn limit_is_honored() {
        let log = AuditLog::new();
        for i in 0..5 {
            log.log(AuditEntry::success("u", format!("a{i}"), "r"));
        }
        assert_eq!(log.recent(2).len(), 2);
        assert_eq!(log.recent(2)[0].action, "a4");
    }

    #[test]
    fn capacity_evicts_oldest() {
        let log = AuditLog::with_capacity(2);
        log.log(AuditEntry::success("u", "a0", "r"));
        log.log(AuditEntry::success("u", "a1", "r"));
        log.log(AuditEntry::success("u", "a2", "r"));
        let all = log.recent(10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].action, "a1");
    }

    #[test]
    fn time_range_query() {
        let log = AuditLog::new();
        log.log(AuditEntry::success("u", "a", "r"));
        let now = Utc::now();
        let hits = log.query_by_time_range(now - chrono::Duration::minutes(1), now, 10);
        assert_eq!(hits.len(), 1);
        let misses =
            log.query_by_time_range(now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(2), 10);
        assert!(misses.is_empty());
    }
}
