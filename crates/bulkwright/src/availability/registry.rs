use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::{AvailabilityConfig, ClusterConfig, ClusterMetadata, KeyedRateLimiter};

/// 📇 Every cluster we know about, by id. Built once, passed around as `Arc`.
#[derive(Debug)]
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, Arc<ClusterMetadata>>>,
    availability: AvailabilityConfig,
    limiter: Arc<KeyedRateLimiter>,
}

impl ClusterRegistry {
    pub fn new(availability: AvailabilityConfig, limiter: Arc<KeyedRateLimiter>) -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
            availability,
            limiter,
        }
    }

    /// ➕ Register (or replace) a cluster. Replacing starts its health from scratch.
    pub fn register(&self, config: ClusterConfig) -> Arc<ClusterMetadata> {
        let id = config.id.clone();
        let metadata = Arc::new(ClusterMetadata::new(
            config,
            &self.availability,
            Arc::clone(&self.limiter),
        ));
        let previous = self
            .clusters
            .write()
            .insert(id.clone(), Arc::clone(&metadata));
        if previous.is_some() {
            info!("🔁 elasticsearch [{}] re-registered, health state reset", id);
        } else {
            info!(
                "📇 elasticsearch [{}] registered with {} seed hosts",
                id,
                metadata.seed_hosts().len()
            );
        }
        metadata
    }

    /// ➖ Forget a cluster, its nodes, and their rate limiter buckets.
    pub fn remove(&self, id: &str) -> Option<Arc<ClusterMetadata>> {
        let removed = self.clusters.write().remove(id)?;
        self.limiter.forget(id);
        for node in removed.nodes() {
            self.limiter.forget(node.limiter_key());
        }
        info!("🗑️ elasticsearch [{}] removed from the registry", id);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClusterMetadata>> {
        self.clusters.read().get(id).cloned()
    }

    /// 📋 Registered ids, sorted so output is stable.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clusters.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clusters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limiter(&self) -> &Arc<KeyedRateLimiter> {
        &self.limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClusterRegistry {
        ClusterRegistry::new(AvailabilityConfig::default(), Arc::new(KeyedRateLimiter::new()))
    }

    #[test]
    fn the_one_where_clusters_check_in_and_check_out() {
        let registry = registry();
        registry.register(ClusterConfig::new("b", vec!["http://b:9200".into()]));
        registry.register(ClusterConfig::new("a", vec!["http://a:9200".into()]));

        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());

        let removed = registry.remove("a").expect("a was registered");
        assert_eq!(removed.id(), "a");
        assert!(registry.get("a").is_none());
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn the_one_where_removal_cleans_the_ballot_box() {
        let registry = registry();
        let cluster = registry.register(ClusterConfig::new("a", vec!["http://a:9200".into()]));
        cluster.report_failure(None);
        cluster.node("a:9200").expect("seed").report_failure();
        assert!(!registry.limiter().is_empty());

        registry.remove("a");
        assert!(registry.limiter().is_empty());
    }

    #[test]
    fn the_one_where_re_registering_resets_health() {
        let registry = registry();
        let first = registry.register(ClusterConfig::new("a", vec!["http://a:9200".into()]));
        first.report_failure(Some("master_not_discovered_exception"));
        assert!(!first.is_available());

        let second = registry.register(ClusterConfig::new("a", vec!["http://a:9200".into()]));
        assert!(second.is_available());
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
