use std::collections::BTreeMap;

use serde::Serialize;

use super::config::ResponseHandlingConfig;
use super::response::{BulkSplit, ItemClass};

/// 🧾 A structured "here is what happened" record, pushed to the result queue as JSON.
#[derive(Debug, Serialize)]
pub struct BulkResultRecord {
    pub cluster: String,
    pub tag: String,
    pub queue: String,
    pub retries: u32,
    pub request: RequestSummary,
    pub response: ResponseSummary,
    pub summary: ItemSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<BulkStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ErrorDetail>,
}

#[derive(Debug, Serialize)]
pub struct RequestSummary {
    pub url: String,
    pub body_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResponseSummary {
    pub status_code: u16,
    pub body_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ItemSummary {
    pub success: usize,
    pub retryable: usize,
    pub invalid: usize,
}

#[derive(Debug, Serialize)]
pub struct BulkStats {
    pub code: BTreeMap<u16, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indices: Option<BTreeMap<String, BTreeMap<u16, usize>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<BTreeMap<String, BTreeMap<u16, usize>>>,
}

#[derive(Debug, Default, Serialize)]
pub struct ErrorDetail {
    pub retryable: Vec<String>,
    pub invalid: Vec<String>,
}

/// 📥 The raw ingredients of a record.
pub(crate) struct RecordInput<'a> {
    pub cluster: &'a str,
    pub tag: &'a str,
    pub queue: &'a str,
    pub retries: u32,
    pub url: &'a str,
    pub request_body: &'a [u8],
    pub status: u16,
    pub response_body: &'a [u8],
    pub split: Option<&'a BulkSplit>,
}

fn clip(bytes: &[u8], max: usize) -> Option<String> {
    if max == 0 {
        return None;
    }
    let cut = bytes.len().min(max);
    Some(String::from_utf8_lossy(&bytes[..cut]).into_owned())
}

impl BulkResultRecord {
    /// 🤔 Is this response worth a record at all?
    pub(crate) fn wanted(handling: &ResponseHandlingConfig, status: u16, split: Option<&BulkSplit>) -> bool {
        let busy = status == 429 || split.is_some_and(BulkSplit::only_busy_failures);
        if busy {
            return handling.save_busy_results;
        }
        let failed = !(200..300).contains(&status) || split.is_some_and(BulkSplit::has_failures);
        if failed {
            handling.save_error_results
        } else {
            handling.save_success_results
        }
    }

    pub(crate) fn build(handling: &ResponseHandlingConfig, input: RecordInput<'_>) -> Self {
        let summary = input
            .split
            .map(|split| ItemSummary {
                success: split.success,
                retryable: split.retryable,
                invalid: split.non_retryable,
            })
            .unwrap_or_default();

        let stats = match (handling.output_bulk_stats, input.split) {
            (true, Some(split)) => Some(BulkStats {
                code: split.status_counts.clone(),
                indices: handling.include_index_stats.then(|| split.index_stats()),
                actions: handling.include_operation_stats.then(|| split.operation_stats()),
            }),
            _ => None,
        };

        let detail = match (handling.include_error_details, input.split) {
            (true, Some(split)) if split.has_failures() => {
                let mut detail = ErrorDetail::default();
                let failures = split
                    .outcomes
                    .iter()
                    .filter_map(|outcome| outcome.reason.as_ref().map(|reason| (outcome.class, reason)))
                    .take(handling.max_error_details_count);
                for (class, reason) in failures {
                    match class {
                        ItemClass::Retryable => detail.retryable.push(reason.clone()),
                        _ => detail.invalid.push(reason.clone()),
                    }
                }
                Some(detail)
            }
            _ => None,
        };

        Self {
            cluster: input.cluster.to_owned(),
            tag: input.tag.to_owned(),
            queue: input.queue.to_owned(),
            retries: input.retries,
            request: RequestSummary {
                url: input.url.to_owned(),
                body_length: input.request_body.len(),
                body: clip(input.request_body, handling.max_request_body_size),
            },
            response: ResponseSummary {
                status_code: input.status,
                body_length: input.response_body.len(),
                body: clip(input.response_body, handling.max_response_body_size),
            },
            summary,
            stats,
            detail,
        }
    }
}
