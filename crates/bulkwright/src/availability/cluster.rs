use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    AvailabilityConfig, AvailabilityPolicy, CLUSTER_AVAILABLE, CLUSTER_FAILURE, KeyedRateLimiter,
    NO_HOST_LOG, NodeAvailable, is_master_not_discovered,
};

fn default_enabled() -> bool {
    true
}

fn default_major_version() -> u32 {
    7
}

/// 🔒 Username and password. "changeme" is not a password, it is a cry for help.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// 🔧 One `[[clusters]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    pub id: String,
    /// 🏷️ Display name for logs and stats. Falls back to `id`.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 📡 Seed endpoints, e.g. `https://es-1:9200`. A bare `host:port` means http.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    /// 👑 Keep writing even when the cluster reports it lost its master.
    #[serde(default)]
    pub allow_access_when_master_not_found: bool,
    #[serde(default = "default_major_version")]
    pub major_version: u32,
}

impl ClusterConfig {
    pub fn new(id: &str, endpoints: Vec<String>) -> Self {
        Self {
            id: id.to_owned(),
            name: String::new(),
            enabled: default_enabled(),
            endpoints,
            basic_auth: None,
            allow_access_when_master_not_found: false,
            major_version: default_major_version(),
        }
    }
}

fn split_endpoint(endpoint: &str) -> (&str, &str) {
    let trimmed = endpoint.trim().trim_end_matches('/');
    trimmed.split_once("://").unwrap_or(("http", trimmed))
}

/// 🗂️ Everything we know about one cluster: its config, its health, and its nodes.
///
/// The cluster runs the same vote machine as its nodes, with two extra rules. A
/// `master_not_discovered_exception` takes it down immediately (unless the config says to
/// carry on without a master), and it refuses to go down while any node still answers.
#[derive(Debug)]
pub struct ClusterMetadata {
    config: ClusterConfig,
    schema: String,
    seed_hosts: Vec<String>,
    policy: AvailabilityPolicy,
    node_policy: AvailabilityPolicy,
    limiter: Arc<KeyedRateLimiter>,
    epoch: Instant,
    available: AtomicBool,
    last_success_ms: AtomicU64,
    ticket: RwLock<u32>,
    nodes: RwLock<HashMap<String, Arc<NodeAvailable>>>,
    active: RwLock<Option<Arc<NodeAvailable>>>,
}

impl ClusterMetadata {
    pub fn new(
        config: ClusterConfig,
        availability: &AvailabilityConfig,
        limiter: Arc<KeyedRateLimiter>,
    ) -> Self {
        Self::new_at(Instant::now(), config, availability, limiter)
    }

    pub fn new_at(
        now: Instant,
        config: ClusterConfig,
        availability: &AvailabilityConfig,
        limiter: Arc<KeyedRateLimiter>,
    ) -> Self {
        let schema = config
            .endpoints
            .first()
            .map(|endpoint| split_endpoint(endpoint).0.to_owned())
            .unwrap_or_else(|| "http".to_owned());
        let seed_hosts: Vec<String> = config
            .endpoints
            .iter()
            .map(|endpoint| split_endpoint(endpoint).1.to_owned())
            .filter(|host| !host.is_empty())
            .collect();

        let nodes = seed_hosts
            .iter()
            .map(|host| {
                let node = NodeAvailable::new_at(
                    now,
                    &config.id,
                    host,
                    availability.node.clone(),
                    Arc::clone(&limiter),
                );
                (host.clone(), Arc::new(node))
            })
            .collect();

        Self {
            config,
            schema,
            seed_hosts,
            policy: availability.cluster.clone(),
            node_policy: availability.node.clone(),
            limiter,
            epoch: now,
            available: AtomicBool::new(true),
            last_success_ms: AtomicU64::new(0),
            ticket: RwLock::new(0),
            nodes: RwLock::new(nodes),
            active: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        if self.config.name.is_empty() {
            &self.config.id
        } else {
            &self.config.name
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn seed_hosts(&self) -> &[String] {
        &self.seed_hosts
    }

    /// 🌐 `schema://host`, no trailing slash.
    pub fn endpoint_for(&self, host: &str) -> String {
        format!("{}://{}", self.schema, host)
    }

    /// ✅ Enabled and not voted down.
    pub fn is_available(&self) -> bool {
        self.config.enabled && self.available.load(Ordering::Acquire)
    }

    pub fn failure_tickets(&self) -> u32 {
        *self.ticket.read()
    }

    pub fn last_success(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_success_ms.load(Ordering::Acquire))
    }

    /// ➕ Track a node discovered after startup. Returns the existing entry if already known.
    pub fn register_node(&self, host: &str) -> Arc<NodeAvailable> {
        if let Some(node) = self.node(host) {
            return node;
        }
        let mut nodes = self.nodes.write();
        let node = nodes.entry(host.to_owned()).or_insert_with(|| {
            Arc::new(NodeAvailable::new(
                &self.config.id,
                host,
                self.node_policy.clone(),
                Arc::clone(&self.limiter),
            ))
        });
        Arc::clone(node)
    }

    pub fn node(&self, host: &str) -> Option<Arc<NodeAvailable>> {
        self.nodes.read().get(host).cloned()
    }

    pub fn remove_node(&self, host: &str) -> Option<Arc<NodeAvailable>> {
        let removed = self.nodes.write().remove(host);
        if let Some(node) = &removed {
            self.limiter.forget(node.limiter_key());
            let mut active = self.active.write();
            if active.as_ref().is_some_and(|node| node.host() == host) {
                *active = None;
            }
        }
        removed
    }

    pub fn nodes(&self) -> Vec<Arc<NodeAvailable>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn available_node_count(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|node| node.is_available())
            .count()
    }

    pub fn active_host(&self, preferred: Option<&str>) -> Option<Arc<NodeAvailable>> {
        self.active_host_at(Instant::now(), preferred)
    }

    /// 🎯 Pick a node to talk to: the preferred one if healthy, else the cached pick if still
    /// healthy, else the first healthy seed (or any healthy discovered node).
    ///
    /// With nobody healthy, this casts a cluster failure vote and returns `None`.
    pub fn active_host_at(&self, now: Instant, preferred: Option<&str>) -> Option<Arc<NodeAvailable>> {
        if let Some(node) = preferred.and_then(|host| self.node(host)) {
            if node.is_available() {
                return Some(node);
            }
        }

        let cached = self.active.read().clone();
        if let Some(node) = cached {
            if node.is_available() {
                return Some(node);
            }
        }

        let candidate = self
            .seed_hosts
            .iter()
            .filter_map(|host| self.node(host))
            .find(|node| node.is_available())
            .or_else(|| {
                self.nodes
                    .read()
                    .values()
                    .find(|node| node.is_available())
                    .cloned()
            });

        if let Some(node) = candidate {
            debug!(
                "🎯 elasticsearch [{}] switching active host to [{}]",
                self.name(),
                node.host()
            );
            *self.active.write() = Some(Arc::clone(&node));
            return Some(node);
        }

        if self
            .limiter
            .allow_at(now, NO_HOST_LOG, &self.config.id, 1, 1, Duration::from_secs(5))
        {
            warn!("🔌 no available host for elasticsearch [{}]", self.name());
        }
        self.report_failure_at(now, None);
        None
    }

    pub fn report_failure(&self, error: Option<&str>) -> bool {
        self.report_failure_at(Instant::now(), error)
    }

    /// 👎 One cluster failure vote. Returns `true` when the cluster is (now) Unavailable.
    pub fn report_failure_at(&self, now: Instant, error: Option<&str>) -> bool {
        let mut ticket = self.ticket.write();
        if !self.available.load(Ordering::Acquire) {
            return true;
        }

        if error.is_some_and(is_master_not_discovered) && !self.config.allow_access_when_master_not_found {
            self.available.store(false, Ordering::Release);
            *ticket = 0;
            warn!(
                "👑 elasticsearch [{}] has no master, marking it unavailable",
                self.name()
            );
            return true;
        }

        let window = self.policy.vote_window();
        if !self
            .limiter
            .allow_at(now, CLUSTER_FAILURE, &self.config.id, 1, 1, window)
        {
            return false;
        }

        *ticket += 1;
        let since_success = now.saturating_duration_since(self.last_success());
        debug!(
            "👎 elasticsearch [{}] failure ticket {}, {:?} since last success",
            self.name(),
            *ticket,
            since_success
        );
        if !self.policy.should_flip(*ticket, since_success) {
            return false;
        }

        let alive = self.available_node_count();
        if alive > 0 {
            debug!(
                "🫀 elasticsearch [{}] still has {} available nodes, keeping it available",
                self.name(),
                alive
            );
            return false;
        }

        self.available.store(false, Ordering::Release);
        *ticket = 0;
        info!("🌑 elasticsearch [{}] is not available", self.name());
        true
    }

    pub fn report_success(&self) {
        self.report_success_at(Instant::now());
    }

    /// 👍 Record a success, and come back from the dead if the limiter agrees.
    pub fn report_success_at(&self, now: Instant) {
        let stamp = now.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_success_ms.store(stamp, Ordering::Release);
        if self.available.load(Ordering::Acquire) {
            return;
        }

        let mut ticket = self.ticket.write();
        if self.available.load(Ordering::Acquire) {
            return;
        }
        let window = self.policy.vote_window();
        if self
            .limiter
            .allow_at(now, CLUSTER_AVAILABLE, &self.config.id, 1, 1, window)
        {
            self.available.store(true, Ordering::Release);
            *ticket = 0;
            info!("✅ elasticsearch [{}] is available again", self.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_at(t0: Instant, endpoints: &[&str]) -> ClusterMetadata {
        ClusterMetadata::new_at(
            t0,
            ClusterConfig::new("prod", endpoints.iter().map(|e| e.to_string()).collect()),
            &AvailabilityConfig::default(),
            Arc::new(KeyedRateLimiter::new()),
        )
    }

    #[test]
    fn the_one_where_endpoints_become_hosts() {
        let cluster = cluster_at(Instant::now(), &["https://es-1:9200/", "es-2:9200"]);
        assert_eq!(cluster.schema(), "https");
        assert_eq!(cluster.seed_hosts(), &["es-1:9200".to_string(), "es-2:9200".to_string()]);
        assert_eq!(cluster.endpoint_for("es-2:9200"), "https://es-2:9200");
        assert_eq!(cluster.nodes().len(), 2);
        assert_eq!(cluster.name(), "prod");
    }

    #[test]
    fn the_one_where_losing_the_master_is_instant() {
        let t0 = Instant::now();
        let cluster = cluster_at(t0, &["http://es-1:9200"]);
        let body = r#"{"error":{"type":"master_not_discovered_exception"},"status":503}"#;

        assert!(cluster.report_failure_at(t0 + Duration::from_millis(1), Some(body)));
        assert!(!cluster.is_available());
    }

    #[test]
    fn the_one_where_some_clusters_dont_need_a_master() {
        let t0 = Instant::now();
        let mut config = ClusterConfig::new("prod", vec!["http://es-1:9200".into()]);
        config.allow_access_when_master_not_found = true;
        let cluster = ClusterMetadata::new_at(
            t0,
            config,
            &AvailabilityConfig::default(),
            Arc::new(KeyedRateLimiter::new()),
        );
        let body = "master_not_discovered_exception";

        assert!(!cluster.report_failure_at(t0 + Duration::from_millis(1), Some(body)));
        assert!(cluster.is_available());
        assert_eq!(cluster.failure_tickets(), 1);
    }

    #[test]
    fn the_one_where_a_living_node_keeps_the_cluster_up() {
        let t0 = Instant::now();
        let cluster = cluster_at(t0, &["http://es-1:9200"]);

        for second in 1..=11u64 {
            cluster.report_failure_at(t0 + Duration::from_secs(second), None);
        }
        assert!(cluster.is_available());

        let node = cluster.node("es-1:9200").expect("seed node is registered");
        node.report_failure_at(t0 + Duration::from_secs(11));
        assert!(!node.is_available());

        assert!(cluster.report_failure_at(t0 + Duration::from_secs(12), None));
        assert!(!cluster.is_available());
        assert_eq!(cluster.failure_tickets(), 0);

        cluster.report_success_at(t0 + Duration::from_secs(13));
        assert!(cluster.is_available());
    }

    #[test]
    fn the_one_where_the_preferred_host_wins_if_healthy() {
        let t0 = Instant::now();
        let cluster = cluster_at(t0, &["http://es-1:9200", "http://es-2:9200"]);

        let picked = cluster.active_host_at(t0, Some("es-2:9200")).expect("healthy");
        assert_eq!(picked.host(), "es-2:9200");

        let fallback = cluster.active_host_at(t0, Some("nope:9200")).expect("healthy");
        assert_eq!(fallback.host(), "es-1:9200");

        let es1 = cluster.node("es-1:9200").expect("seed node");
        es1.report_failure_at(t0 + Duration::from_secs(11));
        let moved = cluster
            .active_host_at(t0 + Duration::from_secs(11), None)
            .expect("es-2 is still up");
        assert_eq!(moved.host(), "es-2:9200");
    }

    #[test]
    fn the_one_where_nobody_is_home() {
        let t0 = Instant::now();
        let cluster = cluster_at(t0, &["http://es-1:9200"]);
        let node = cluster.node("es-1:9200").expect("seed node");
        node.report_failure_at(t0 + Duration::from_secs(11));

        assert!(cluster.active_host_at(t0 + Duration::from_secs(11), None).is_none());
        // -- no node left alive and ten seconds of silence: the vote cast by active_host sticks
        assert!(!cluster.is_available());
    }

    #[test]
    fn the_one_where_discovered_nodes_can_come_and_go() {
        let cluster = cluster_at(Instant::now(), &["http://es-1:9200"]);
        let discovered = cluster.register_node("es-9:9200");
        let again = cluster.register_node("es-9:9200");
        assert!(Arc::ptr_eq(&discovered, &again));
        assert_eq!(cluster.available_node_count(), 2);

        assert!(cluster.remove_node("es-9:9200").is_some());
        assert!(cluster.node("es-9:9200").is_none());
    }

    #[test]
    fn the_one_where_two_clusters_share_a_host_but_not_a_ballot_box() {
        let t0 = Instant::now();
        let limiter = Arc::new(KeyedRateLimiter::new());
        let cluster = |id: &str| {
            ClusterMetadata::new_at(
                t0,
                ClusterConfig::new(id, vec!["http://shared:9200".into()]),
                &AvailabilityConfig::default(),
                Arc::clone(&limiter),
            )
        };
        let blue = cluster("blue");
        let green = cluster("green");
        let blue_node = blue.node("shared:9200").expect("seed node");
        let green_node = green.node("shared:9200").expect("seed node");
        assert_eq!(green_node.limiter_key(), "green/shared:9200");

        blue_node.report_failure_at(t0);
        green_node.report_failure_at(t0);
        assert_eq!(blue_node.failure_tickets(), 1);
        assert_eq!(green_node.failure_tickets(), 1);

        assert!(blue.remove_node("shared:9200").is_some());
        green_node.report_failure_at(t0 + Duration::from_millis(1));
        assert_eq!(green_node.failure_tickets(), 1);
    }

    #[test]
    fn the_one_where_a_crowd_of_failures_in_one_window_is_one_vote() {
        let t0 = Instant::now();
        let cluster = cluster_at(t0, &["http://es-1:9200"]);
        let now = t0 + Duration::from_millis(1);

        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        cluster.report_failure_at(now, None);
                    }
                });
            }
        });
        assert_eq!(cluster.failure_tickets(), 1);
        assert!(cluster.is_available());
    }
}
