//! Bounded LRU of query logs backing the explain surface.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use rhizome_core::protocol::{ExplainBody, QueryLogEntry};

pub const MAX_QUERY_LOG_ENTRIES: usize = 10_000;

/// Fixed-capacity LRU keyed by query id. Entries are owned copies on both
/// insert and fetch, so readers never alias pipeline state.
pub struct QueryLogLru {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    entries: HashMap<u64, QueryLogEntry>,
    order: VecDeque<u64>,
}

impl QueryLogLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn insert(&self, entry: QueryLogEntry) {
        let mut inner = self.inner.lock().unwrap();
        let key = entry.query_id;

        if inner.entries.insert(key, entry).is_some() {
            inner.order.retain(|id| *id != key);
        }
        inner.order.push_back(key);

        while inner.entries.len() > inner.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    /// A hit refreshes recency.
    pub fn explain(&self, query_id: u64) -> Option<ExplainBody> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(&query_id)?.clone();

        inner.order.retain(|id| *id != query_id);
        inner.order.push_back(query_id);

        Some(ExplainBody {
            query_id: entry.query_id,
            seeds: entry.seeds,
            traversal: entry.traversal,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhizome_core::protocol::QueryStats;

    fn entry(query_id: u64) -> QueryLogEntry {
        QueryLogEntry {
            query_id,
            seeds: Vec::new(),
            traversal: Vec::new(),
            stats: QueryStats::default(),
        }
    }

    #[test]
    fn capacity_is_enforced_in_lru_order() {
        let log = QueryLogLru::new(2);
        log.insert(entry(1));
        log.insert(entry(2));
        log.insert(entry(3));

        assert_eq!(log.len(), 2);
        assert!(log.explain(1).is_none());
        assert!(log.explain(2).is_some());
        assert!(log.explain(3).is_some());
    }

    #[test]
    fn explain_refreshes_recency() {
        let log = QueryLogLru::new(2);
        log.insert(entry(1));
        log.insert(entry(2));

        // Touch 1 so 2 becomes the eviction candidate.
        log.explain(1).unwrap();
        log.insert(entry(3));

        assert!(log.explain(1).is_some());
        assert!(log.explain(2).is_none());
    }

    #[test]
    fn reinserting_a_query_id_does_not_double_count() {
        let log = QueryLogLru::new(4);
        log.insert(entry(1));
        log.insert(entry(1));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn missing_ids_return_none() {
        let log = QueryLogLru::new(4);
        assert!(log.explain(99).is_none());
    }
}
