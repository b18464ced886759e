//! Metrics Ring
//! Mission: a bounded in-memory ring of per-request records with O(1)
//! append and O(n) derived rollups.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub correlation_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency: std::time::Duration,
    pub caller_user_id: Option<String>,
    pub client_addr: Option<String>,
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Single-writer ring; readers take a snapshot under the same lock so they
/// never observe a torn window.
pub struct MetricsRing {
    capacity: usize,
    records: Mutex<VecDeque<MetricRecord>>,
}

#[derive(Debug, Serialize)]
pub struct TopEndpoint {
    pub method: String,
    pub path: String,
    pub count: usize,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    pub sample_count: usize,
    pub mean_latency_ms: f64,
    pub error_rate: f64,
    pub requests_per_minute: f64,
}

impl MetricsRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// O(1): push, then drop the oldest record once over capacity.
    pub fn append(&self, record: MetricRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn window(&self, timeframe: Duration) -> Vec<MetricRecord> {
        let cutoff = Utc::now() - timeframe;
        self.records
            .lock()
            .iter()
            .filter(|r| r.received_at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn summary(&self, timeframe: Duration) -> MetricsSummary {
        let window = self.window(timeframe);
        if window.is_empty() {
            return MetricsSummary {
                sample_count: 0,
                mean_latency_ms: 0.0,
                error_rate: 0.0,
                requests_per_minute: 0.0,
            };
        }
        let count = window.len();
        let total_latency_ms: f64 = window.iter().map(|r| r.latency.as_secs_f64() * 1000.0).sum();
        let errors = window.iter().filter(|r| r.status >= 400).count();
        let minutes = (timeframe.num_seconds() as f64 / 60.0).max(1.0 / 60.0);

        MetricsSummary {
            sample_count: count,
            mean_latency_ms: total_latency_ms / count as f64,
            error_rate: errors as f64 / count as f64,
            requests_per_minute: count as f64 / minutes,
        }
    }

    /// Top-N endpoints by request count, mean latency as tiebreaker.
    pub fn top_endpoints(&self, limit: usize, timeframe: Duration) -> Vec<TopEndpoint> {
        let window = self.window(timeframe);
        let mut grouped: HashMap<(String, String), (usize, f64)> = HashMap::new();
        for record in &window {
            let key = (record.method.clone(), record.path.clone());
            let entry = grouped.entry(key).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += record.latency.as_secs_f64() * 1000.0;
        }
        let mut endpoints: Vec<TopEndpoint> = grouped
            .into_iter()
            .map(|((method, path), (count, total_latency))| TopEndpoint {
                method,
                path,
                count,
                mean_latency_ms: total_latency / count as f64,
            })
            .collect();
        endpoints.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.mean_latency_ms.partial_cmp(&b.mean_latency_ms).unwrap())
        });
        endpoints.truncate(limit);
        endpoints
    }
}
