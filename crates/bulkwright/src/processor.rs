//! 🚚 The bulk processor: takes a buffer of NDJSON operations and gets it into Elasticsearch,
//! one way or another.
//!
//! 📡 The happy path is one POST and a `"errors":false`. The rest of this file is about the
//! other paths:
//!
//! ```text
//!   submit(buffer)
//!     │
//!     ├─ no healthy host ─────────────────────────────► NoAvailableHost
//!     ├─ POST fails in transit ── vote node+cluster ──► Transport
//!     ├─ 429 ─────────────────────────────────────────► TooManyRequests
//!     ├─ 4xx ────── whole body → invalid queue ───────► InvalidRequest
//!     ├─ 5xx ────── skip rule? → invalid queue ───────► RetrySkipped / ServerError
//!     └─ 2xx ── split items ─┬─ success ─ counted
//!                            ├─ non-retryable ─ invalid queue, once it is final
//!                            └─ retryable ─ sleep, resend only these ─┐
//!                                  ▲                                  │
//!                                  └──────────── until the ceiling ───┘
//!                                                  then dead-letter ──► RetriesExhausted
//! ```
//!
//! 🧠 Knowledge graph: every buffer used inside `submit` comes from the `BulkBufferPool` as
//! a guard, so it goes home on every exit path. The caller's buffer is never mutated except
//! for a trailing newline and the per-operation statuses written back into it.
//!
//! 🦆 The duck retried three times and then went to the dead-letter queue. It's fine. It's
//! in a better place now.

mod config;
mod response;
mod result_record;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::{debug, error, warn};

pub use config::{BulkProcessorConfig, ResponseHandlingConfig, RetryException};
pub use response::{
    BulkItemResult, BulkResponse, BulkSplit, ItemClass, ItemOutcome, classify_item,
    split_bulk_response,
};
pub use result_record::BulkResultRecord;

use crate::availability::{ClusterMetadata, KeyedRateLimiter, NodeAvailable, is_master_not_discovered};
use crate::backends::{HttpClient, HttpRequest, HttpResponse, QueueSink, StatsSink};
use crate::buffers::{BulkBuffer, BulkBufferPool};
use crate::error::BulkError;
use crate::walker::bulk_operations;
use result_record::RecordInput;

const BULK_PATH: &str = "/_bulk";
const BULK_ERROR_LOG: &str = "bulk_error_log";
const BULK_ERROR_LOG_WINDOW: Duration = Duration::from_secs(5);
const LOGGED_BODY_PREVIEW: usize = 1024;

/// 📋 What happened during one `submit`, success or not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    /// ➡️ `true` when the caller can move on to its next batch. `false` means "this buffer
    /// still needs to go somewhere, hand it back to me later".
    pub continue_next: bool,
    /// 📊 Per-item statuses across every attempt.
    pub status_counts: BTreeMap<u16, usize>,
    pub success_items: usize,
    /// 🔁 Items that were resent at least once.
    pub retryable_items: usize,
    pub non_retryable_items: usize,
    pub dead_lettered_items: usize,
    pub retries: u32,
}

/// 💀 A failed `submit`: the typed reason plus everything the report knew at the time.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct BulkFailure {
    pub report: BulkReport,
    #[source]
    pub error: BulkError,
}

impl BulkFailure {
    fn new(report: BulkReport, error: BulkError) -> Self {
        Self { report, error }
    }

    pub fn continue_next(&self) -> bool {
        self.report.continue_next
    }
}

/// 🚚 Submits bulk buffers. Cheap to share: wrap it in an `Arc` and hand it to every worker.
#[derive(Debug)]
pub struct BulkProcessor {
    config: BulkProcessorConfig,
    pool: Arc<BulkBufferPool>,
    http: Arc<dyn HttpClient>,
    queue: Arc<dyn QueueSink>,
    stats: Arc<dyn StatsSink>,
    limiter: Arc<KeyedRateLimiter>,
}

impl BulkProcessor {
    pub fn new(
        config: BulkProcessorConfig,
        pool: Arc<BulkBufferPool>,
        http: Arc<dyn HttpClient>,
        queue: Arc<dyn QueueSink>,
        stats: Arc<dyn StatsSink>,
        limiter: Arc<KeyedRateLimiter>,
    ) -> Self {
        Self {
            config,
            pool,
            http,
            queue,
            stats,
            limiter,
        }
    }

    pub fn config(&self) -> &BulkProcessorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BulkBufferPool> {
        &self.pool
    }

    /// 🚀 Send `buffer` to `cluster` and deal with whatever comes back.
    ///
    /// `preferred_host` is tried first when it is a known, healthy node. Partial failures are
    /// retried in here, up to `max_reject_retry_times`, resending only the retryable items.
    /// Whole-request failures are not retried here: see `submit_with_retry`.
    pub async fn submit(
        &self,
        tag: &str,
        cluster: &ClusterMetadata,
        preferred_host: Option<&str>,
        buffer: &mut BulkBuffer,
    ) -> Result<BulkReport, BulkFailure> {
        let category = format!("elasticsearch.{}.{}.bulk", tag, cluster.name());
        let mut report = BulkReport::default();

        if buffer.is_empty() {
            self.stats.increment(&category, "empty_bulk_requests");
            report.continue_next = true;
            return Err(BulkFailure::new(report, BulkError::EmptyBuffer));
        }
        buffer.ensure_trailing_newline();

        let Some(node) = cluster.active_host(preferred_host) else {
            return Err(BulkFailure::new(
                report,
                BulkError::NoAvailableHost {
                    cluster: cluster.name().to_owned(),
                },
            ));
        };
        let url = format!("{}{}", cluster.endpoint_for(node.host()), BULK_PATH);

        let mut rejected = self.pool.acquire();
        let outcome = self
            .drive(tag, cluster, &node, &url, &category, buffer, &mut rejected, report)
            .await;
        self.settle_rejected(cluster, &rejected, outcome).await
    }

    /// 🔁 The attempt loop. Non-retryable items pile up in `rejected` instead of going
    /// anywhere: only the caller knows whether this outcome is final.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        tag: &str,
        cluster: &ClusterMetadata,
        node: &NodeAvailable,
        url: &str,
        category: &str,
        buffer: &mut BulkBuffer,
        rejected: &mut BulkBuffer,
        mut report: BulkReport,
    ) -> Result<BulkReport, BulkFailure> {
        let mut attempt = self.pool.acquire();
        attempt.queue.clone_from(&buffer.queue);
        attempt.write(buffer.as_bytes());
        for id in buffer.message_ids() {
            if let Err(err) = attempt.write_message_id(id) {
                return Err(BulkFailure::new(report, err));
            }
        }
        // -- offset in the current attempt → offset in the caller's buffer
        let mut origins: Option<Vec<usize>> = None;
        let mut retries: u32 = 0;

        loop {
            let body = match self.encode_body(attempt.as_bytes()) {
                Ok(body) => body,
                Err(err) => return Err(BulkFailure::new(report, err)),
            };
            self.stats.increment(category, "http_request_count");
            let response = match self.http.post(self.build_request(cluster, url, body)).await {
                Ok(response) => response,
                Err(err) => {
                    let message = format!("{err:#}");
                    self.stats.increment(category, "transport_errors");
                    node.report_failure();
                    cluster.report_failure(Some(&message));
                    self.log_bulk_error(node, format_args!("bulk request failed in transit: {message}"));
                    report.continue_next = false;
                    return Err(BulkFailure::new(
                        report,
                        BulkError::Transport {
                            host: node.host().to_owned(),
                            message,
                        },
                    ));
                }
            };

            node.report_success();
            let body_text = String::from_utf8_lossy(&response.body);
            if is_master_not_discovered(&body_text) {
                cluster.report_failure(Some(&body_text));
            } else {
                cluster.report_success();
            }

            if !(200..300).contains(&response.status) {
                let error = self
                    .handle_request_failure(tag, cluster, node, category, url, &attempt, &response, &body_text, retries)
                    .await;
                let operations = bulk_operations(BULK_PATH, attempt.as_bytes()).count();
                *report.status_counts.entry(response.status).or_insert(0) += operations;
                report.continue_next = error.is_terminal();
                return Err(BulkFailure::new(report, error));
            }

            let decoded = match BulkResponse::parse(&response.body) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.log_bulk_error(node, format_args!("{err}: {}", preview(&body_text)));
                    report.continue_next = false;
                    return Err(BulkFailure::new(report, err));
                }
            };

            let mut success = self.pool.acquire();
            let mut retryable = self.pool.acquire();
            let mut invalid = self.pool.acquire();
            let split = match split_bulk_response(
                BULK_PATH,
                &attempt,
                &decoded,
                self.config.retry_exception(),
                &mut success,
                &mut retryable,
                &mut invalid,
            ) {
                Ok(split) => split,
                Err(err) => {
                    report.continue_next = true;
                    return Err(BulkFailure::new(report, err));
                }
            };

            let original = |offset: usize| {
                origins
                    .as_ref()
                    .and_then(|origins| origins.get(offset).copied())
                    .unwrap_or(offset)
            };
            for outcome in &split.outcomes {
                if outcome.status != 0 {
                    buffer.set_response_status(original(outcome.offset), outcome.status);
                }
            }
            for (status, count) in &split.status_counts {
                *report.status_counts.entry(*status).or_insert(0) += count;
                self.stats.increment_by(
                    category,
                    &format!("bulk_items_response.{status}"),
                    *count as i64,
                );
            }
            report.success_items += split.success;

            self.save_result(
                tag,
                cluster,
                url,
                &attempt,
                &response,
                Some(&split),
                retries,
            )
            .await;

            if !decoded.errors && !split.has_failures() {
                self.stats.increment(category, "200_bulk_success_requests");
                break;
            }
            self.stats.increment(category, "200_bulk_error_requests");

            if split.non_retryable > 0 {
                rejected.append(&invalid);
                report.non_retryable_items += split.non_retryable;
            }

            if split.retryable == 0 {
                if split.non_retryable == 0 {
                    // -- "errors":true, yet every item claims success. Hand it back untouched.
                    self.log_bulk_error(node, format_args!("bulk response contains error, {:?}", split.status_counts));
                    report.continue_next = false;
                    return Err(BulkFailure::new(
                        report,
                        BulkError::PartialFailure {
                            counts: split.status_counts,
                        },
                    ));
                }
                break;
            }

            if retries >= self.config.max_reject_retry_times {
                return Err(self
                    .give_up(cluster, node, category, &mut retryable, split.retryable, retries, report)
                    .await);
            }

            if retries == 0 {
                report.retryable_items = split.retryable;
            }
            retries += 1;
            report.retries = retries;
            self.stats.increment(category, "200_bulk_error_requests_retry");
            warn!(
                "🔁 bulk partial failure on [{}]: {} retryable, {} invalid, retry #{}",
                cluster.name(),
                split.retryable,
                split.non_retryable,
                retries
            );

            let next_origins = split
                .outcomes
                .iter()
                .filter(|outcome| outcome.class == ItemClass::Retryable)
                .map(|outcome| original(outcome.offset))
                .collect();
            origins = Some(next_origins);
            retryable.queue.clone_from(&attempt.queue);
            std::mem::swap(&mut *attempt, &mut *retryable);
            attempt.ensure_trailing_newline();
            drop((success, retryable, invalid));

            let delay = self.config.reject_retry_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        report.continue_next = true;
        let count = report.non_retryable_items;
        if count > 0 {
            return Err(BulkFailure::new(
                report,
                BulkError::InvalidItems {
                    cluster: cluster.name().to_owned(),
                    count,
                },
            ));
        }
        debug!(
            "✅ bulk to [{}] done: {} items, {} retries",
            cluster.name(),
            report.success_items,
            report.retries
        );
        Ok(report)
    }

    /// 🔁 `submit`, plus caller-level retries of whole-request failures that are worth
    /// retrying, up to `max_retry_times`, `retry_delay_in_seconds` apart.
    pub async fn submit_with_retry(
        &self,
        tag: &str,
        cluster: &ClusterMetadata,
        preferred_host: Option<&str>,
        buffer: &mut BulkBuffer,
    ) -> Result<BulkReport, BulkFailure> {
        let mut attempt: u32 = 0;
        loop {
            match self.submit(tag, cluster, preferred_host, buffer).await {
                Err(failure) if failure.error.is_retryable() && attempt < self.config.max_retry_times => {
                    attempt += 1;
                    debug!(
                        "🔁 whole-request retry #{} for [{}] after: {}",
                        attempt,
                        cluster.name(),
                        failure.error
                    );
                    let delay = self.config.retry_delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                outcome => return outcome,
            }
        }
    }

    fn encode_body(&self, bytes: &[u8]) -> Result<Vec<u8>, BulkError> {
        if !self.config.compress {
            return Ok(bytes.to_vec());
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::fast());
        encoder
            .write_all(bytes)
            .and_then(|_| encoder.finish())
            .map_err(|err| BulkError::Encode {
                message: err.to_string(),
            })
    }

    fn build_request(&self, cluster: &ClusterMetadata, url: &str, body: Vec<u8>) -> HttpRequest {
        let mut headers = vec![("Content-Type".to_owned(), "application/x-ndjson".to_owned())];
        if self.config.compress {
            headers.push(("Content-Encoding".to_owned(), "gzip".to_owned()));
        }
        HttpRequest {
            url: url.to_owned(),
            headers,
            body,
            basic_auth: cluster.config().basic_auth.clone(),
            timeout: self.config.request_timeout(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_request_failure(
        &self,
        tag: &str,
        cluster: &ClusterMetadata,
        node: &NodeAvailable,
        category: &str,
        url: &str,
        attempt: &BulkBuffer,
        response: &HttpResponse,
        body_text: &str,
        retries: u32,
    ) -> BulkError {
        self.save_result(tag, cluster, url, attempt, response, None, retries)
            .await;
        let status = response.status;
        match status {
            429 => {
                self.stats.increment(category, "429_requests");
                BulkError::TooManyRequests {
                    cluster: cluster.name().to_owned(),
                }
            }
            400..=499 => {
                self.stats.increment(category, "400_requests");
                self.log_bulk_error(node, format_args!("invalid bulk request, code {status}: {}", preview(body_text)));
                match self.divert_invalid(cluster, attempt).await {
                    Ok(()) => BulkError::InvalidRequest { status },
                    Err(err) => err,
                }
            }
            _ => {
                self.stats.increment(category, "5xx_requests");
                self.log_bulk_error(node, format_args!("bulk request failed, code {status}: {}", preview(body_text)));
                if self.config.retry_exception().skip_retry(status, body_text) {
                    match self.divert_invalid(cluster, attempt).await {
                        Ok(()) => BulkError::RetrySkipped { status },
                        Err(err) => err,
                    }
                } else {
                    BulkError::ServerError { status }
                }
            }
        }
    }

    /// ⚰️ Out of retries. A dead cluster keeps its items (caller should hold on); a live one
    /// sends them to the dead-letter queue.
    #[allow(clippy::too_many_arguments)]
    async fn give_up(
        &self,
        cluster: &ClusterMetadata,
        node: &NodeAvailable,
        category: &str,
        retryable: &mut BulkBuffer,
        items: usize,
        retries: u32,
        mut report: BulkReport,
    ) -> BulkFailure {
        if !cluster.is_available() {
            report.continue_next = false;
            return BulkFailure::new(
                report,
                BulkError::ClusterUnavailable {
                    cluster: cluster.name().to_owned(),
                },
            );
        }

        retryable.ensure_trailing_newline();
        let queue = &self.config.dead_letter_queue;
        if let Err(err) = self.queue.push(queue, retryable.as_bytes().to_vec()).await {
            report.continue_next = false;
            return BulkFailure::new(
                report,
                BulkError::Queue {
                    queue: queue.clone(),
                    message: format!("{err:#}"),
                },
            );
        }
        self.stats.increment(category, "200_bulk_error_requests_retry_dead");
        self.stats.increment_by(category, "dead_letter_items", items as i64);
        self.log_bulk_error(
            node,
            format_args!("bulk partial failure, retried {retries} times, quit retry, {items} items dead-lettered to [{queue}]"),
        );

        report.dead_lettered_items = items;
        report.continue_next = true;
        BulkFailure::new(report, BulkError::RetriesExhausted { retries, items })
    }

    /// 🗑️ Items rejected along the way go to the invalid queue only when the caller is told
    /// to move on. Anything else and the whole buffer comes back here, rejects included.
    async fn settle_rejected(
        &self,
        cluster: &ClusterMetadata,
        rejected: &BulkBuffer,
        outcome: Result<BulkReport, BulkFailure>,
    ) -> Result<BulkReport, BulkFailure> {
        let continue_next = match &outcome {
            Ok(report) => report.continue_next,
            Err(failure) => failure.continue_next(),
        };
        if !continue_next || rejected.is_empty() {
            return outcome;
        }
        match self.divert_invalid(cluster, rejected).await {
            Ok(()) => outcome,
            Err(err) => {
                let mut report = match outcome {
                    Ok(report) => report,
                    Err(failure) => failure.report,
                };
                report.continue_next = false;
                Err(BulkFailure::new(report, err))
            }
        }
    }

    async fn divert_invalid(&self, cluster: &ClusterMetadata, invalid: &BulkBuffer) -> Result<(), BulkError> {
        let Some(queue) = &self.config.invalid_queue else {
            warn!(
                "🗑️ no invalid_queue configured, dropping {} bytes of rejected bulk items for [{}]",
                invalid.message_size(),
                cluster.name()
            );
            return Ok(());
        };
        let mut payload = invalid.as_bytes().to_vec();
        if payload.last().is_some_and(|byte| *byte != b'\n') {
            payload.push(b'\n');
        }
        self.queue
            .push(queue, payload)
            .await
            .map_err(|err| BulkError::Queue {
                queue: queue.clone(),
                message: format!("{err:#}"),
            })
    }

    #[allow(clippy::too_many_arguments)]
    async fn save_result(
        &self,
        tag: &str,
        cluster: &ClusterMetadata,
        url: &str,
        attempt: &BulkBuffer,
        response: &HttpResponse,
        split: Option<&BulkSplit>,
        retries: u32,
    ) {
        let handling = &self.config.response_handling;
        if !BulkResultRecord::wanted(handling, response.status, split) {
            return;
        }
        let record = BulkResultRecord::build(
            handling,
            RecordInput {
                cluster: cluster.id(),
                tag,
                queue: &attempt.queue,
                retries,
                url,
                request_body: attempt.as_bytes(),
                status: response.status,
                response_body: &response.body,
                split,
            },
        );
        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("🧾 could not serialize bulk result record: {err}");
                return;
            }
        };
        if let Err(err) = self.queue.push(&handling.result_queue, payload).await {
            warn!(
                "🧾 could not push bulk result record to [{}]: {err:#}",
                handling.result_queue
            );
        }
    }

    /// 🔇 Bulk errors are logged at most once per host per five seconds. A failing cluster
    /// should not also take out the log pipeline.
    fn log_bulk_error(&self, node: &NodeAvailable, message: std::fmt::Arguments<'_>) {
        if self
            .limiter
            .allow(BULK_ERROR_LOG, node.limiter_key(), 1, 1, BULK_ERROR_LOG_WINDOW)
        {
            error!("💀 [{}] {}", node.host(), message);
        }
    }
}

fn preview(text: &str) -> &str {
    if text.len() <= LOGGED_BODY_PREVIEW {
        return text;
    }
    let mut cut = LOGGED_BODY_PREVIEW;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
