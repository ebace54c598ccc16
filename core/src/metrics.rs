use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
struct QueryMetrics {
    total_queries: u64,
    failed_queries: u64,
    latencies: VecDeque<u64>, // microseconds
}

/// In-process query latency collector feeding Info/Health. Not a metrics
/// backend; the bounded history keeps percentiles cheap.
pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    query: QueryMetrics,
    max_history: usize,
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState {
                query: QueryMetrics::default(),
                max_history,
            })),
        }
    }

    pub fn record_query(&self, latency_us: u64, ok: bool) {
        let mut state = self.state.lock().unwrap();
        state.query.total_queries += 1;
        if !ok {
            state.query.failed_queries += 1;
        }
        state.query.latencies.push_back(latency_us);
        if state.query.latencies.len() > state.max_history {
            state.query.latencies.pop_front();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();
        let q = &state.query;

        let mut sorted: Vec<u64> = q.latencies.iter().copied().collect();
        sorted.sort_unstable();

        MetricsSnapshot {
            total_queries: q.total_queries,
            failed_queries: q.failed_queries,
            p50_us: percentile(&sorted, 50.0),
            p95_us: percentile(&sorted, 95.0),
            p99_us: percentile(&sorted, 99.0),
        }
    }
}

// Nearest-rank percentile over an already-sorted history.
fn percentile(sorted: &[u64], p: f32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f32).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub failed_queries: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}
