use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// 📊 Counter sink. `category` is something like `elasticsearch.{tag}.{cluster}.bulk`,
/// `key` is the thing being counted.
pub trait StatsSink: std::fmt::Debug + Send + Sync {
    fn increment(&self, category: &str, key: &str) {
        self.increment_by(category, key, 1);
    }

    fn increment_by(&self, category: &str, key: &str, value: i64);
}

/// 🧮 Counters in a map. Clone shares the map.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStats {
    counters: Arc<Mutex<BTreeMap<(String, String), i64>>>,
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, category: &str, key: &str) -> i64 {
        self.counters
            .lock()
            .get(&(category.to_owned(), key.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    /// 📸 Every counter, sorted by (category, key).
    pub fn snapshot(&self) -> Vec<(String, String, i64)> {
        self.counters
            .lock()
            .iter()
            .map(|((category, key), value)| (category.clone(), key.clone(), *value))
            .collect()
    }
}

impl StatsSink for InMemoryStats {
    fn increment_by(&self, category: &str, key: &str, value: i64) {
        *self
            .counters
            .lock()
            .entry((category.to_owned(), key.to_owned()))
            .or_insert(0) += value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_counters_add_up() {
        let stats = InMemoryStats::new();
        stats.increment("elasticsearch.t.c.bulk", "http_request_count");
        stats.increment("elasticsearch.t.c.bulk", "http_request_count");
        stats.increment_by("elasticsearch.t.c.bulk", "bulk_items_response.201", 5);

        assert_eq!(stats.get("elasticsearch.t.c.bulk", "http_request_count"), 2);
        assert_eq!(stats.get("elasticsearch.t.c.bulk", "bulk_items_response.201"), 5);
        assert_eq!(stats.get("elasticsearch.t.c.bulk", "missing"), 0);
        assert_eq!(stats.snapshot().len(), 2);
    }
}
