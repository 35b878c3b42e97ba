//! 🚚 bulkwright: a bulk write path for Elasticsearch that takes "partial failure" personally.
//!
//! 🧠 Knowledge graph:
//! - `buffers`: pooled `BulkBuffer`s, the NDJSON bytes plus their message ids and statuses.
//! - `walker`: reads bulk bodies operation by operation and rewrites meta lines.
//! - `routing`: which shard a document id lands on, bit-for-bit with the cluster.
//! - `availability`: node and cluster health, voted on with failure tickets.
//! - `processor`: sends a buffer, splits the response, retries what deserves it, and
//!   dead-letters what doesn't make it.
//! - `backends`: the HTTP, queue and stats doors the processor knocks on.
//! - `app_config`: figment-loaded TOML + env config for all of the above.
//!
//! 🦆 The duck handles the 429s. Nobody asked the duck.

pub mod app_config;
pub mod availability;
pub mod backends;
pub mod buffers;
pub mod error;
pub mod processor;
pub mod routing;
pub mod walker;

pub use app_config::{AppConfig, load_config};
pub use availability::{ClusterMetadata, ClusterRegistry, KeyedRateLimiter};
pub use buffers::{BulkBuffer, BulkBufferPool};
pub use error::BulkError;
pub use processor::{BulkFailure, BulkProcessor, BulkProcessorConfig, BulkReport};
