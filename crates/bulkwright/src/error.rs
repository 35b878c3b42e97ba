//! 💀 Errors: the part of every bulk request nobody puts in the demo.
//!
//! 🧠 Knowledge graph:
//! - `BulkError` is the typed, caller-visible taxonomy. Callers match on it to decide
//!   whether to resubmit (`is_retryable`) or move on (`is_terminal`).
//! - Glue code (config, CLI, queue backends) keeps using `anyhow` with `.context(...)`.
//!   The two meet at the edges: `anyhow` messages get flattened into `Transport`/`Queue`.
//!
//! 🦆 The duck has been dead-lettered. It will be reprocessed on Monday.

use std::collections::BTreeMap;

use thiserror::Error;

/// 🏷️ Everything that can go sideways between "here is a buffer" and "the cluster said 200".
#[derive(Debug, Error)]
pub enum BulkError {
    /// 📭 Nothing to send. We refuse to POST an empty envelope.
    #[error("💀 invalid bulk request, the buffer is empty")]
    EmptyBuffer,

    /// 🔌 Every known host for the cluster is voted down.
    #[error("💀 no available host for elasticsearch [{cluster}]")]
    NoAvailableHost { cluster: String },

    /// 📡 The request never got an HTTP answer (connect, TLS, timeout, reset...).
    #[error("💀 bulk request to [{host}] failed in transit: {message}")]
    Transport { host: String, message: String },

    /// 🐢 The whole request got a 429. The cluster is busy, come back later.
    #[error("💀 code 429, elasticsearch [{cluster}] is too busy")]
    TooManyRequests { cluster: String },

    /// 🚫 The whole request got a 4xx. Resending the same bytes will not help.
    #[error("💀 invalid bulk request, code: {status}")]
    InvalidRequest { status: u16 },

    /// 🔥 The whole request got a 5xx (or something else unexpected).
    #[error("💀 bulk request failed, code: {status}")]
    ServerError { status: u16 },

    /// ✋ A 5xx matched a `retry_exception` code or keyword, so nobody should retry it.
    #[error("💀 bulk request failed with code {status}, retry skipped by retry_exception rules")]
    RetrySkipped { status: u16 },

    /// 🗑️ Some items were permanently rejected and diverted to the invalid queue.
    #[error("💀 elasticsearch [{cluster}] rejected {count} bulk items as invalid")]
    InvalidItems { cluster: String, count: usize },

    /// 🤷 The response said `"errors":true` yet no item owned up to failing.
    #[error("💀 bulk response contains error, {counts:?}")]
    PartialFailure { counts: BTreeMap<u16, usize> },

    /// ⚰️ Items stayed retryable past `max_reject_retry_times` and were dead-lettered.
    #[error("💀 bulk partial failure, retried {retries} times, quit retry ({items} items dead-lettered)")]
    RetriesExhausted { retries: u32, items: usize },

    /// 🌑 The retry ceiling was hit while the cluster itself is voted down.
    #[error("💀 elasticsearch [{cluster}] is not available")]
    ClusterUnavailable { cluster: String },

    /// 🧩 A 2xx bulk response we could not make sense of.
    #[error("💀 could not decode bulk response: {message}")]
    InvalidResponse { message: String },

    /// 🧨 A meta line with no recognized action key.
    #[error("💀 malformed bulk meta at operation #{offset}: {line}")]
    MalformedBulkMeta { offset: usize, line: String },

    /// 🪪 Message ids must be non-empty.
    #[error("💀 invalid message id, ids must not be empty")]
    InvalidMessageId,

    /// 🧮 Shard math with zero shards divides by zero, and we don't.
    #[error("💀 invalid shard settings: {reason}")]
    InvalidShardSettings { reason: String },

    /// 🫁 Gzip refused to squish the payload.
    #[error("💀 failed to encode bulk body: {message}")]
    Encode { message: String },

    /// 📮 The queue sink refused a push.
    #[error("💀 failed to push to queue [{queue}]: {message}")]
    Queue { queue: String, message: String },
}

impl BulkError {
    /// 🔄 Safe to hand the same buffer back to `submit` later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BulkError::NoAvailableHost { .. }
                | BulkError::Transport { .. }
                | BulkError::TooManyRequests { .. }
                | BulkError::ServerError { .. }
                | BulkError::ClusterUnavailable { .. }
                | BulkError::InvalidResponse { .. }
                | BulkError::PartialFailure { .. }
                | BulkError::Queue { .. }
        )
    }

    /// 🛑 Resubmitting would not change the outcome. Move on.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}
