use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::proxy::mappers::Protocol;

/// The in-memory trace of one request's passage through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub started_at: i64,
    pub client_protocol: String,
    pub model_requested: String,
    pub model_actual: String,
    pub account_id: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub first_byte_ms: Option<u64>,
    pub error_kind: Option<String>,
    pub bookmarked: bool,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlowStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// Bounded ring of flow records plus aggregate counters. Oldest records are
/// evicted on overflow and by the periodic age sweep; nothing is persisted.
pub struct FlowMonitor {
    flows: parking_lot::RwLock<VecDeque<FlowRecord>>,
    stats: parking_lot::RwLock<FlowStats>,
    capacity: usize,
}

pub struct FlowHandle {
    pub id: String,
    started: std::time::Instant,
    record: FlowRecord,
}

impl FlowHandle {
    pub fn note(&mut self, note: impl Into<String>) {
        self.record.notes.push(note.into());
    }

    pub fn set_model_actual(&mut self, model: &str) {
        self.record.model_actual = model.to_string();
    }

    pub fn set_account(&mut self, account_id: &str) {
        self.record.account_id = Some(account_id.to_string());
    }

    pub fn set_bytes_in(&mut self, bytes: u64) {
        self.record.bytes_in = bytes;
    }

    pub fn add_bytes_out(&mut self, bytes: u64) {
        self.record.bytes_out += bytes;
    }

    pub fn mark_first_byte(&mut self) {
        if self.record.first_byte_ms.is_none() {
            self.record.first_byte_ms = Some(self.started.elapsed().as_millis() as u64);
        }
    }

    pub fn set_error(&mut self, kind: &str) {
        self.record.error_kind = Some(kind.to_string());
    }
}

impl FlowMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            flows: parking_lot::RwLock::new(VecDeque::with_capacity(capacity)),
            stats: parking_lot::RwLock::new(FlowStats::default()),
            capacity,
        }
    }

    pub fn begin(&self, protocol: Protocol, model_requested: &str) -> FlowHandle {
        let id = uuid::Uuid::new_v4().to_string();
        FlowHandle {
            id: id.clone(),
            started: std::time::Instant::now(),
            record: FlowRecord {
                id,
                started_at: chrono::Utc::now().timestamp_millis(),
                client_protocol: protocol.as_str().to_string(),
                model_requested: model_requested.to_string(),
                model_actual: model_requested.to_string(),
                account_id: None,
                status: 0,
                duration_ms: 0,
                bytes_in: 0,
                bytes_out: 0,
                first_byte_ms: None,
                error_kind: None,
                bookmarked: false,
                notes: Vec::new(),
            },
        }
    }

    pub fn finish(&self, mut handle: FlowHandle, status: u16) {
        handle.record.status = status;
        handle.record.duration_ms = handle.started.elapsed().as_millis() as u64;

        {
            let mut stats = self.stats.write();
            stats.total_requests += 1;
            if (200..400).contains(&status) {
                stats.success_count += 1;
            } else {
                stats.error_count += 1;
            }
        }
        let mut flows = self.flows.write();
        if flows.len() >= self.capacity {
            flows.pop_back();
        }
        flows.push_front(handle.record);
    }

    pub fn list(&self, limit: usize) -> Vec<FlowRecord> {
        self.flows.read().iter().take(limit).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<FlowRecord> {
        self.flows.read().iter().find(|f| f.id == id).cloned()
    }

    pub fn set_bookmarked(&self, id: &str, bookmarked: bool) -> bool {
        let mut flows = self.flows.write();
        match flows.iter_mut().find(|f| f.id == id) {
            Some(flow) => {
                flow.bookmarked = bookmarked;
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> FlowStats {
        self.stats.read().clone()
    }

    pub fn clear(&self) {
        self.flows.write().clear();
        *self.stats.write() = FlowStats::default();
    }

    /// Age-based eviction; bookmarked flows are kept.
    pub fn evict_older_than(&self, max_age_secs: i64) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age_secs * 1000;
        let mut flows = self.flows.write();
        let before = flows.len();
        flows.retain(|f| f.bookmarked || f.started_at >= cutoff);
        before - flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_on_overflow() {
        let monitor = FlowMonitor::new(2);
        for i in 0..3 {
            let mut h = monitor.begin(Protocol::OpenAi, &format!("model-{}", i));
            h.mark_first_byte();
            monitor.finish(h, 200);
        }
        let flows = monitor.list(10);
        assert_eq!(flows.len(), 2);
        // Newest first; model-0 fell off the ring.
        assert_eq!(flows[0].model_requested, "model-2");
        assert_eq!(flows[1].model_requested, "model-1");
        assert_eq!(monitor.stats().total_requests, 3);
    }

    #[test]
    fn stats_split_success_and_error() {
        let monitor = FlowMonitor::new(10);
        let h = monitor.begin(Protocol::Anthropic, "m");
        monitor.finish(h, 200);
        let mut h = monitor.begin(Protocol::Anthropic, "m");
        h.set_error("rate_limited_all_accounts");
        monitor.finish(h, 429);

        let stats = monitor.stats();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 1);

        let flows = monitor.list(10);
        assert_eq!(
            flows[0].error_kind.as_deref(),
            Some("rate_limited_all_accounts")
        );
    }

    #[test]
    fn bookmarks_survive_age_eviction() {
        let monitor = FlowMonitor::new(10);
        let h = monitor.begin(Protocol::Gemini, "old-kept");
        monitor.finish(h, 200);
        let h = monitor.begin(Protocol::Gemini, "old-dropped");
        monitor.finish(h, 200);

        let kept_id = monitor.list(10)[1].id.clone();
        assert!(monitor.set_bookmarked(&kept_id, true));

        // Everything is "older than" a negative cutoff in the future.
        let evicted = monitor.evict_older_than(-10);
        assert_eq!(evicted, 1);
        assert_eq!(monitor.list(10)[0].id, kept_id);
    }
}
