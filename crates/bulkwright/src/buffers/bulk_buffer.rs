use std::collections::BTreeMap;

use crate::error::BulkError;

/// 📦 A growable bag of NDJSON bulk bytes with its bookkeeping strapped to the side.
///
/// Invariants worth knowing before you touch anything:
/// - `message_ids` and `reasons` are index-aligned when both are populated.
/// - `response_status` is keyed by operation offset, not by line number. Operation #3 is the
///   third meta line, whatever the payloads in between look like.
/// - `reset` wipes everything including the queue label. `reset_data` keeps the label.
#[derive(Debug, Default)]
pub struct BulkBuffer {
    /// 🏷️ Which queue (or pipeline) this batch came from. Purely informational.
    pub queue: String,
    bytes: Vec<u8>,
    message_ids: Vec<String>,
    reasons: Vec<String>,
    response_status: BTreeMap<usize, u16>,
}

impl BulkBuffer {
    pub(crate) const EMPTY: BulkBuffer = BulkBuffer {
        queue: String::new(),
        bytes: Vec::new(),
        message_ids: Vec::new(),
        reasons: Vec::new(),
        response_status: BTreeMap::new(),
    };

    pub fn new() -> Self {
        Self::default()
    }

    /// 🔧 A buffer that starts with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// ➕ Track `id` and append `data`, newline-separated from whatever came before.
    ///
    /// Empty data or an empty id and the whole call is ignored: ids are looked up by
    /// operation offset, so every op that goes in through here carries exactly one.
    pub fn add(&mut self, id: &str, data: &[u8]) {
        if id.is_empty() || data.is_empty() {
            return;
        }
        self.message_ids.push(id.to_owned());
        self.write_line(data);
    }

    /// 📝 Raw append. No newline policing.
    pub fn write(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// 📝 Append `data`, inserting a `\n` first if the buffer doesn't already end in one.
    pub fn write_line(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.ensure_trailing_newline();
        self.bytes.extend_from_slice(data);
    }

    /// 🪪 Record a message id without writing any bytes.
    pub fn write_message_id(&mut self, id: &str) -> Result<(), BulkError> {
        if id.is_empty() {
            return Err(BulkError::InvalidMessageId);
        }
        self.message_ids.push(id.to_owned());
        Ok(())
    }

    pub fn write_error_reason(&mut self, reason: &str) {
        self.reasons.push(reason.to_owned());
    }

    /// 🧲 Append another buffer's operations, ids and reasons. Statuses stay behind: they are
    /// keyed by the other buffer's offsets.
    pub fn append(&mut self, other: &BulkBuffer) {
        self.write_line(other.as_bytes());
        self.message_ids.extend(other.message_ids.iter().cloned());
        self.reasons.extend(other.reasons.iter().cloned());
    }

    /// ⏎ The bulk API wants the body to end in a newline. Non-empty buffers get one.
    pub fn ensure_trailing_newline(&mut self) {
        if let Some(last) = self.bytes.last() {
            if *last != b'\n' {
                self.bytes.push(b'\n');
            }
        }
    }

    pub fn message_count(&self) -> usize {
        self.message_ids.len()
    }

    pub fn message_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn message_ids(&self) -> &[String] {
        &self.message_ids
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    /// 🧽 Forget everything: bytes, ids, reasons, statuses, queue label. Capacity survives.
    pub fn reset(&mut self) {
        self.reset_data();
        self.queue.clear();
    }

    /// 🧽 Forget the contents, keep the queue label.
    pub fn reset_data(&mut self) {
        self.bytes.clear();
        self.message_ids.clear();
        self.reasons.clear();
        self.response_status.clear();
    }

    /// 📬 Remember what the cluster said about operation `offset`.
    pub fn set_response_status(&mut self, offset: usize, status: u16) {
        self.response_status.insert(offset, status);
    }

    pub fn response_status(&self, offset: usize) -> Option<u16> {
        self.response_status.get(&offset).copied()
    }

    /// 📊 Histogram of recorded statuses. With `only_failures`, anything 2xx stays out of it.
    pub fn message_status(&self, only_failures: bool) -> BTreeMap<u16, usize> {
        let mut histogram = BTreeMap::new();
        for status in self.response_status.values() {
            if only_failures && (200..300).contains(status) {
                continue;
            }
            *histogram.entry(*status).or_insert(0) += 1;
        }
        histogram
    }

    /// 🔁 Swap the raw storage out so the pool can recycle it. Leaves an empty Vec behind.
    pub(crate) fn take_storage(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// 🔁 Adopt recycled storage. Only called on a freshly reset buffer.
    pub(crate) fn adopt_storage(&mut self, mut storage: Vec<u8>) {
        storage.clear();
        self.bytes = storage;
    }

    pub(crate) fn capacity(&self) -> usize {
        self.bytes.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_add_keeps_lines_apart() {
        let mut buffer = BulkBuffer::new();
        buffer.add("m1", br#"{"index":{"_index":"a"}}"#);
        buffer.add("m2", br#"{"field":1}"#);
        buffer.ensure_trailing_newline();

        assert_eq!(
            buffer.as_bytes(),
            b"{\"index\":{\"_index\":\"a\"}}\n{\"field\":1}\n"
        );
        assert_eq!(buffer.message_count(), 2);
        assert_eq!(buffer.message_ids(), &["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn the_one_where_empty_data_leaves_no_ghost_id() {
        let mut buffer = BulkBuffer::new();
        buffer.add("ghost", b"");
        assert_eq!(buffer.message_count(), 0);
        assert!(buffer.is_empty());

        buffer.add("", b"{\"index\":{}}\n{}");
        assert_eq!(buffer.message_count(), 0);
        assert!(buffer.is_empty());

        buffer.add("m1", b"{\"delete\":{\"_id\":\"1\"}}");
        assert_eq!(buffer.message_ids(), &["m1".to_string()]);
        assert_eq!(buffer.as_bytes(), b"{\"delete\":{\"_id\":\"1\"}}");
    }

    #[test]
    fn the_one_where_an_empty_id_is_rejected() {
        let mut buffer = BulkBuffer::new();
        assert!(matches!(
            buffer.write_message_id(""),
            Err(BulkError::InvalidMessageId)
        ));
        buffer.write_message_id("ok").expect("non-empty ids are fine");
        assert_eq!(buffer.message_count(), 1);
    }

    #[test]
    fn the_one_where_trailing_newline_is_not_doubled() {
        let mut buffer = BulkBuffer::new();
        buffer.ensure_trailing_newline();
        assert!(buffer.is_empty());

        buffer.write(b"abc\n");
        buffer.ensure_trailing_newline();
        assert_eq!(buffer.as_bytes(), b"abc\n");
    }

    #[test]
    fn the_one_where_status_histogram_can_hide_the_good_news() {
        let mut buffer = BulkBuffer::new();
        buffer.set_response_status(0, 201);
        buffer.set_response_status(1, 429);
        buffer.set_response_status(2, 400);
        buffer.set_response_status(3, 201);

        let all = buffer.message_status(false);
        assert_eq!(all.get(&201), Some(&2));
        assert_eq!(all.len(), 3);

        let failures = buffer.message_status(true);
        assert_eq!(failures.get(&201), None);
        assert_eq!(failures.get(&429), Some(&1));
        assert_eq!(failures.get(&400), Some(&1));
    }

    #[test]
    fn the_one_where_reset_data_keeps_the_label() {
        let mut buffer = BulkBuffer::new();
        buffer.queue = "orders".into();
        buffer.add("m1", b"{}");
        buffer.write_error_reason("nope");
        buffer.set_response_status(0, 400);

        buffer.reset_data();
        assert_eq!(buffer.queue, "orders");
        assert!(buffer.is_empty());
        assert!(buffer.reasons().is_empty());
        assert!(buffer.message_status(false).is_empty());

        buffer.reset();
        assert!(buffer.queue.is_empty());
    }
}
