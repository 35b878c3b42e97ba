//! 🔧 App configuration: one TOML file, some env vars, and a struct at the end of the tunnel.
//!
//! 📡 Layout of a config file:
//!
//! ```toml
//! [[clusters]]
//! id = "prod"
//! endpoints = ["https://es-1:9200", "https://es-2:9200"]
//! basic_auth = { username = "elastic", password = "hunter2" }
//!
//! [bulk]
//! batch_size_in_mb = 10
//! invalid_queue = "bulk_invalid"
//!
//! [pool]
//! max_items = 100
//!
//! [availability.cluster]
//! failure_ticket_threshold = 10
//! ```
//!
//! 🦆 Every section is optional. An empty file is a valid config that knows no clusters.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::availability::{AvailabilityConfig, ClusterConfig};
use crate::buffers::PoolConfig;
use crate::processor::BulkProcessorConfig;

const ENV_PREFIX: &str = "BULKWRIGHT_";

/// 📦 Everything the write path needs to know about itself.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub bulk: BulkProcessorConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub availability: AvailabilityConfig,
}

impl AppConfig {
    pub fn cluster(&self, id: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|cluster| cluster.id == id)
    }
}

/// 🚀 Load the config from `BULKWRIGHT_*` env vars, plus a TOML file if one was given.
///
/// Nested keys use `__` in env vars: `BULKWRIGHT_BULK__COMPRESS=true` sets `bulk.compress`.
/// The file wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables ({ENV_PREFIX}*). \
             Check the section names, a typo in [bulk] is still a typo.",
            path.display()
        ),
        None => format!(
            "💀 Failed to parse configuration from environment variables ({ENV_PREFIX}*). \
             No file was provided, so the environment gets all the blame."
        ),
    };

    config.extract().context(context_msg)
}
