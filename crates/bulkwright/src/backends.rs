//! 🔌 Backends: the three doors the bulk processor knocks on.
//!
//! 📡 `HttpClient` talks to Elasticsearch. `QueueSink` takes the items nobody wants right now
//! (invalid, dead-lettered, result records). `StatsSink` counts things so someone can make a
//! dashboard about them later.
//!
//! 🧠 Knowledge graph: each door is a trait with a real implementation and an in-memory one.
//! The processor only ever sees `Arc<dyn Trait>`, so tests swap in the in-memory variants
//! and the CLI picks what it needs from config.
//!
//! 🦆 The duck is here because every file must have one. This is law.

mod http;
mod queue;
mod stats;

pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use queue::{FileQueue, InMemoryQueue, QueueBackend, QueueSink};
pub use stats::{InMemoryStats, StatsSink};
