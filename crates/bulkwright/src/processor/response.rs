use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::value::RawValue;

use super::config::RetryException;
use crate::buffers::BulkBuffer;
use crate::error::BulkError;
use crate::walker::{BulkAction, bulk_operations};

/// ✂️ Error reasons longer than this get trimmed before they ride along in a buffer.
const MAX_REASON_LEN: usize = 1024;

/// 📬 The parts of a `_bulk` response we care about.
#[derive(Debug, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub errors: bool,
    /// 🧾 One single-key object per operation: `{"index": {...}}`, `{"delete": {...}}`...
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkItemResult>>,
}

/// 🧾 What the cluster said about one operation. `error` stays raw JSON until someone
/// actually needs to read it.
#[derive(Debug, Deserialize)]
pub struct BulkItemResult {
    #[serde(default, rename = "_index")]
    pub index: String,
    #[serde(default, rename = "_id")]
    pub id: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub error: Option<Box<RawValue>>,
}

impl BulkResponse {
    pub fn parse(body: &[u8]) -> Result<Self, BulkError> {
        serde_json::from_slice(body).map_err(|err| BulkError::InvalidResponse {
            message: err.to_string(),
        })
    }

    /// 🔎 The item for operation `offset`, whatever its action key.
    pub fn item(&self, offset: usize) -> Option<&BulkItemResult> {
        self.items.get(offset).and_then(|item| item.values().next())
    }
}

/// 🚦 Where an item goes after the cluster has spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemClass {
    Success,
    Retryable,
    NonRetryable,
}

/// 🚦 Classify one item. Only items carrying an `error` can fail: a delete that answers 404
/// `not_found` without an error body is a success as far as the write path is concerned.
pub fn classify_item(status: u16, error: Option<&str>, rules: &RetryException) -> ItemClass {
    let Some(error) = error else {
        return ItemClass::Success;
    };
    if rules.skip_retry(status, error) {
        return ItemClass::NonRetryable;
    }
    match status {
        429 if rules.retry_429 => ItemClass::Retryable,
        400..=499 => ItemClass::NonRetryable,
        _ => ItemClass::Retryable,
    }
}

/// 🧾 One operation's verdict, at its offset within the submitted bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub offset: usize,
    /// 0 when the response had no item for this operation.
    pub status: u16,
    pub class: ItemClass,
    pub action: BulkAction,
    pub index: String,
    pub reason: Option<String>,
}

/// 🧮 The result of splitting one response across the three buffers.
#[derive(Debug, Clone, Default)]
pub struct BulkSplit {
    pub outcomes: Vec<ItemOutcome>,
    pub status_counts: BTreeMap<u16, usize>,
    pub success: usize,
    pub retryable: usize,
    pub non_retryable: usize,
}

impl BulkSplit {
    pub fn has_failures(&self) -> bool {
        self.retryable + self.non_retryable > 0
    }

    /// 🐢 Every failed item failed with a 429.
    pub fn only_busy_failures(&self) -> bool {
        self.has_failures()
            && self
                .outcomes
                .iter()
                .filter(|outcome| outcome.class != ItemClass::Success)
                .all(|outcome| outcome.status == 429)
    }

    /// 📊 Status histogram per index.
    pub fn index_stats(&self) -> BTreeMap<String, BTreeMap<u16, usize>> {
        let mut stats: BTreeMap<String, BTreeMap<u16, usize>> = BTreeMap::new();
        for outcome in &self.outcomes {
            *stats
                .entry(outcome.index.clone())
                .or_default()
                .entry(outcome.status)
                .or_insert(0) += 1;
        }
        stats
    }

    /// 📊 Status histogram per action.
    pub fn operation_stats(&self) -> BTreeMap<String, BTreeMap<u16, usize>> {
        let mut stats: BTreeMap<String, BTreeMap<u16, usize>> = BTreeMap::new();
        for outcome in &self.outcomes {
            *stats
                .entry(outcome.action.as_str().to_owned())
                .or_default()
                .entry(outcome.status)
                .or_insert(0) += 1;
        }
        stats
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LEN {
        return reason;
    }
    let mut cut = MAX_REASON_LEN;
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    &reason[..cut]
}

/// ✂️ Walk the submitted bytes alongside the response items and copy every operation into
/// the buffer its verdict belongs to, with its message id and (for failures) its reason.
///
/// Message ids are taken from `request` by operation offset, so they follow their items
/// into whichever buffer they land in.
pub fn split_bulk_response(
    url_path: &str,
    request: &BulkBuffer,
    response: &BulkResponse,
    rules: &RetryException,
    success: &mut BulkBuffer,
    retryable: &mut BulkBuffer,
    non_retryable: &mut BulkBuffer,
) -> Result<BulkSplit, BulkError> {
    let mut split = BulkSplit::default();

    for op in bulk_operations(url_path, request.as_bytes()) {
        let op = op?;
        let (status, error, index) = match response.item(op.offset) {
            Some(item) => (
                item.status,
                item.error.as_deref().map(RawValue::get),
                if item.index.is_empty() {
                    op.meta.index.clone()
                } else {
                    item.index.clone()
                },
            ),
            None => (0, Some("missing from bulk response"), op.meta.index.clone()),
        };

        let class = classify_item(status, error, rules);
        let target: &mut BulkBuffer = match class {
            ItemClass::Success => {
                split.success += 1;
                &mut *success
            }
            ItemClass::Retryable => {
                split.retryable += 1;
                &mut *retryable
            }
            ItemClass::NonRetryable => {
                split.non_retryable += 1;
                &mut *non_retryable
            }
        };

        target.write_line(op.meta_line);
        if let Some(payload) = op.payload {
            target.write_line(payload);
        }
        if let Some(id) = request.message_ids().get(op.offset) {
            target.write_message_id(id)?;
        }
        let reason = match class {
            ItemClass::Success => None,
            _ => error.map(|e| truncate_reason(e).to_owned()),
        };
        if let Some(reason) = &reason {
            target.write_error_reason(reason);
        }

        if status != 0 {
            *split.status_counts.entry(status).or_insert(0) += 1;
        }
        split.outcomes.push(ItemOutcome {
            offset: op.offset,
            status,
            class,
            action: op.meta.action,
            index,
            reason,
        });
    }

    Ok(split)
}
