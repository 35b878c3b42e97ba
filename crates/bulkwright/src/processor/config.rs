use std::time::Duration;

use serde::Deserialize;

use crate::buffers::BulkBuffer;

const DEFAULT_BULK_SIZE_IN_BYTES: usize = 10 * 1024 * 1024;

fn default_batch_size_in_mb() -> usize {
    10
}

fn default_batch_size_in_docs() -> usize {
    1000
}

fn default_retry_delay_in_seconds() -> u64 {
    1
}

fn default_reject_retry_delay_in_seconds() -> u64 {
    1
}

fn default_max_reject_retry_times() -> u32 {
    60
}

fn default_max_retry_times() -> u32 {
    3
}

fn default_request_timeout_in_second() -> u64 {
    60
}

fn default_dead_letter_queue() -> String {
    "dead_letter_queue".to_owned()
}

fn default_result_queue() -> String {
    "bulk_result_messages".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_max_error_details_count() -> usize {
    50
}

fn default_max_body_size() -> usize {
    10 * 1024
}

/// 🔧 How the processor batches, retries, and where it puts the leftovers.
///
/// Lives under `[bulk]`. Every field has a default, so an empty section is a valid config.
#[derive(Debug, Deserialize, Clone)]
pub struct BulkProcessorConfig {
    /// 📏 Wins over `batch_size_in_mb` when set.
    #[serde(default)]
    pub batch_size_in_kb: usize,
    #[serde(default = "default_batch_size_in_mb")]
    pub batch_size_in_mb: usize,
    #[serde(default = "default_batch_size_in_docs")]
    pub batch_size_in_docs: usize,
    /// 🫁 Gzip the request body.
    #[serde(default)]
    pub compress: bool,
    /// ⏳ Caller-level backoff between whole-request retries.
    #[serde(default = "default_retry_delay_in_seconds")]
    pub retry_delay_in_seconds: u64,
    /// ⏳ Backoff before resending the retryable leftovers of a partial failure. 0 means
    /// resend immediately.
    #[serde(default = "default_reject_retry_delay_in_seconds")]
    pub reject_retry_delay_in_seconds: u64,
    /// 🔁 Partial-failure resends before the leftovers go to the dead-letter queue.
    #[serde(default = "default_max_reject_retry_times")]
    pub max_reject_retry_times: u32,
    /// 🔁 Whole-request resends done by `submit_with_retry`.
    #[serde(default = "default_max_retry_times")]
    pub max_retry_times: u32,
    #[serde(default = "default_request_timeout_in_second")]
    pub request_timeout_in_second: u64,
    /// 🗑️ Where permanently rejected items go. `None` means they are logged and dropped.
    #[serde(default)]
    pub invalid_queue: Option<String>,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
    #[serde(default)]
    pub response_handling: ResponseHandlingConfig,
}

impl Default for BulkProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size_in_kb: 0,
            batch_size_in_mb: default_batch_size_in_mb(),
            batch_size_in_docs: default_batch_size_in_docs(),
            compress: false,
            retry_delay_in_seconds: default_retry_delay_in_seconds(),
            reject_retry_delay_in_seconds: default_reject_retry_delay_in_seconds(),
            max_reject_retry_times: default_max_reject_retry_times(),
            max_retry_times: default_max_retry_times(),
            request_timeout_in_second: default_request_timeout_in_second(),
            invalid_queue: None,
            dead_letter_queue: default_dead_letter_queue(),
            response_handling: ResponseHandlingConfig::default(),
        }
    }
}

impl BulkProcessorConfig {
    /// 📏 Byte threshold for a batch: kb if set, else mb, else 10 MiB.
    pub fn bulk_size_in_bytes(&self) -> usize {
        if self.batch_size_in_kb > 0 {
            return self.batch_size_in_kb * 1024;
        }
        if self.batch_size_in_mb > 0 {
            return self.batch_size_in_mb * 1024 * 1024;
        }
        DEFAULT_BULK_SIZE_IN_BYTES
    }

    /// 🚽 Time to send? Either threshold is enough.
    pub fn should_flush(&self, buffer: &BulkBuffer) -> bool {
        buffer.message_size() >= self.bulk_size_in_bytes()
            || (self.batch_size_in_docs > 0 && buffer.message_count() >= self.batch_size_in_docs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_in_second)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_in_seconds)
    }

    pub fn reject_retry_delay(&self) -> Duration {
        Duration::from_secs(self.reject_retry_delay_in_seconds)
    }

    pub fn retry_exception(&self) -> &RetryException {
        &self.response_handling.retry_exception
    }
}

/// 📋 What to record about each bulk response, and which failures not to retry.
#[derive(Debug, Deserialize, Clone)]
pub struct ResponseHandlingConfig {
    #[serde(default)]
    pub save_success_results: bool,
    #[serde(default = "default_true")]
    pub save_error_results: bool,
    /// 🐢 Records for 429s are skipped unless this is on. Busy clusters are chatty.
    #[serde(default)]
    pub save_busy_results: bool,
    #[serde(default)]
    pub output_bulk_stats: bool,
    #[serde(default = "default_true")]
    pub include_index_stats: bool,
    #[serde(default = "default_true")]
    pub include_operation_stats: bool,
    #[serde(default = "default_true")]
    pub include_error_details: bool,
    #[serde(default = "default_max_error_details_count")]
    pub max_error_details_count: usize,
    /// ✂️ Request bytes copied into a result record. 0 leaves the body out.
    #[serde(default = "default_max_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_max_body_size")]
    pub max_response_body_size: usize,
    #[serde(default = "default_result_queue")]
    pub result_queue: String,
    #[serde(default)]
    pub retry_exception: RetryException,
}

impl Default for ResponseHandlingConfig {
    fn default() -> Self {
        Self {
            save_success_results: false,
            save_error_results: true,
            save_busy_results: false,
            output_bulk_stats: false,
            include_index_stats: true,
            include_operation_stats: true,
            include_error_details: true,
            max_error_details_count: default_max_error_details_count(),
            max_request_body_size: default_max_body_size(),
            max_response_body_size: default_max_body_size(),
            result_queue: default_result_queue(),
            retry_exception: RetryException::default(),
        }
    }
}

/// ✋ Failures that should never be retried, whatever their status class says.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RetryException {
    /// 🐢 Treat per-item 429s as retryable.
    #[serde(default = "default_true")]
    pub retry_429: bool,
    #[serde(default)]
    pub code: Vec<u16>,
    /// 🔎 Substrings of the error body that mark a failure as permanent.
    #[serde(default)]
    pub keyword: Vec<String>,
}

impl Default for RetryException {
    fn default() -> Self {
        Self {
            retry_429: true,
            code: Vec::new(),
            keyword: Vec::new(),
        }
    }
}

impl RetryException {
    /// 🛑 Does an explicit rule say "don't bother"?
    pub fn skip_retry(&self, status: u16, error_body: &str) -> bool {
        self.code.contains(&status)
            || self
                .keyword
                .iter()
                .any(|keyword| !keyword.is_empty() && error_body.contains(keyword.as_str()))
    }
}
