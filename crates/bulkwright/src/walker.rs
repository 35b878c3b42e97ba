//! 🚶 The bulk walker: reads NDJSON bulk bodies one operation at a time.
//!
//! 📡 A bulk body is a polite little dance: meta line, payload line, meta line, payload line...
//! until someone shows up with a `delete`, which has no payload and leaves the dance floor
//! early. Blank lines are wallflowers, we step around them.
//!
//! 🧠 Knowledge graph:
//! - `bulk_operations` is the core: an iterator of `BulkOp`, zero-copy slices into the body.
//! - `walk_bulk_requests` is the callback flavor on top of it, for callers that want
//!   "tell me about every meta, tell me about every payload".
//! - `parse_action_meta`, `update_bulk_metadata`, `parse_url_level_bulk_meta` are the small
//!   sharp tools the processor and the CLI reach for.
//!
//! ⚠️ A meta line without a recognized action key ends the walk with
//! `BulkError::MalformedBulkMeta`. We do not guess. Guessing is how documents end up in
//! the wrong index at 3am.

use memchr::memchr;
use serde_json::{Map, Value};

use crate::error::BulkError;

/// 🎬 The four verbs of the bulk API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkAction {
    Index,
    Create,
    Update,
    Delete,
}

impl BulkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Create => "create",
            BulkAction::Update => "update",
            BulkAction::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "index" => Some(BulkAction::Index),
            "create" => Some(BulkAction::Create),
            "update" => Some(BulkAction::Update),
            "delete" => Some(BulkAction::Delete),
            _ => None,
        }
    }

    /// 🪶 Every action except `delete` drags a payload line behind it.
    pub fn has_payload(&self) -> bool {
        !matches!(self, BulkAction::Delete)
    }
}

/// 🏷️ What a meta line says about the operation. Missing fields are empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMeta {
    pub action: BulkAction,
    pub index: String,
    pub type_name: String,
    pub id: String,
    pub routing: String,
}

/// 🎞️ One operation: its meta line, the parsed meta, and the payload line if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOp<'a> {
    pub offset: usize,
    pub meta_line: &'a [u8],
    pub meta: ActionMeta,
    pub payload: Option<&'a [u8]>,
}

/// 🔍 Extract action, index, type, id and routing from a meta line.
///
/// Key order and whitespace do not matter. Returns `None` when the line isn't a JSON object
/// or none of its keys is a bulk action.
pub fn parse_action_meta(line: &[u8]) -> Option<ActionMeta> {
    let object: Map<String, Value> = serde_json::from_slice(line).ok()?;
    object.iter().find_map(|(key, body)| {
        let action = BulkAction::parse(key)?;
        let fields = body.as_object()?;
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| fields.get(*name).and_then(value_as_string))
                .unwrap_or_default()
        };
        Some(ActionMeta {
            action,
            index: field(&["_index"]),
            type_name: field(&["_type"]),
            id: field(&["_id"]),
            routing: field(&["_routing", "routing"]),
        })
    })
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// ✏️ Rewrite `_index`, `_type` and `_id` inside a meta line.
///
/// Existing keys keep their position, missing ones are appended in index/type/id order,
/// and an empty target leaves that field alone. Running it twice with the same targets
/// yields the same bytes. When `action` is `None`, the first recognized action key wins.
pub fn update_bulk_metadata(
    action: Option<BulkAction>,
    meta: &[u8],
    index: &str,
    type_name: &str,
    id: &str,
) -> Result<Vec<u8>, BulkError> {
    let malformed = || BulkError::MalformedBulkMeta {
        offset: 0,
        line: preview(meta),
    };
    let mut object: Map<String, Value> = serde_json::from_slice(meta).map_err(|_| malformed())?;

    let key = match action {
        Some(action) => action.as_str().to_owned(),
        None => object
            .keys()
            .find(|key| BulkAction::parse(key).is_some())
            .cloned()
            .ok_or_else(malformed)?,
    };

    let fields = object
        .get_mut(&key)
        .and_then(Value::as_object_mut)
        .ok_or_else(malformed)?;
    for (name, target) in [("_index", index), ("_type", type_name), ("_id", id)] {
        if !target.is_empty() {
            fields.insert(name.to_owned(), Value::String(target.to_owned()));
        }
    }

    serde_json::to_vec(&object).map_err(|_| malformed())
}

/// 🗺️ Pull URL-level defaults out of a bulk path.
///
/// `/idx/_bulk` gives `(Some("idx"), None)`, `/idx/doc/_bulk` gives both, `/_bulk` gives
/// neither. Repeated slashes are collapsed before anyone looks at the segments.
pub fn parse_url_level_bulk_meta(path: &str) -> (Option<String>, Option<String>) {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [index, "_bulk"] => (Some((*index).to_owned()), None),
        [index, type_name, "_bulk"] => {
            (Some((*index).to_owned()), Some((*type_name).to_owned()))
        }
        _ => (None, None),
    }
}

fn preview(line: &[u8]) -> String {
    const MAX_PREVIEW: usize = 256;
    let cut = line.len().min(MAX_PREVIEW);
    String::from_utf8_lossy(&line[..cut]).into_owned()
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// ✂️ Newline splitter. Eats `\r\n` the same as `\n`.
#[derive(Debug, Clone)]
struct Lines<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.position >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.position..];
        let line = match memchr(b'\n', rest) {
            Some(end) => {
                self.position += end + 1;
                &rest[..end]
            }
            None => {
                self.position = self.data.len();
                rest
            }
        };
        Some(line.strip_suffix(b"\r").unwrap_or(line))
    }
}

impl<'a> Lines<'a> {
    fn next_non_blank(&mut self) -> Option<&'a [u8]> {
        self.find(|line| !is_blank(line))
    }
}

type NoInterceptor = fn(&[u8]) -> bool;

/// 🚶 Iterator over the operations in a bulk body. See `bulk_operations`.
pub struct BulkOperations<'a, F = NoInterceptor> {
    lines: Lines<'a>,
    url_index: Option<String>,
    url_type: Option<String>,
    interceptor: Option<F>,
    offset: usize,
    finished: bool,
}

/// 🚶 Walk `data` operation by operation. `url_path` supplies `_index`/`_type` defaults the
/// way Elasticsearch does for `/{index}/_bulk`.
pub fn bulk_operations<'a>(url_path: &str, data: &'a [u8]) -> BulkOperations<'a> {
    let (url_index, url_type) = parse_url_level_bulk_meta(url_path);
    BulkOperations {
        lines: Lines { data, position: 0 },
        url_index,
        url_type,
        interceptor: None,
        offset: 0,
        finished: false,
    }
}

impl<'a, F> BulkOperations<'a, F>
where
    F: FnMut(&[u8]) -> bool,
{
    /// 🕵️ Attach a line interceptor. It sees every non-blank line first; `true` on a meta
    /// line drops that operation's payload, `true` on a payload line drops that line.
    pub fn with_interceptor<G>(self, interceptor: G) -> BulkOperations<'a, G>
    where
        G: FnMut(&[u8]) -> bool,
    {
        BulkOperations {
            lines: self.lines,
            url_index: self.url_index,
            url_type: self.url_type,
            interceptor: Some(interceptor),
            offset: self.offset,
            finished: self.finished,
        }
    }

    fn intercept(&mut self, line: &[u8]) -> bool {
        match self.interceptor.as_mut() {
            Some(interceptor) => interceptor(line),
            None => false,
        }
    }

    fn fill_url_defaults(&self, meta: &mut ActionMeta) {
        if meta.index.is_empty() {
            if let Some(index) = &self.url_index {
                meta.index.clone_from(index);
            }
        }
        if meta.type_name.is_empty() {
            if let Some(type_name) = &self.url_type {
                meta.type_name.clone_from(type_name);
            }
        }
    }
}

impl<'a, F> Iterator for BulkOperations<'a, F>
where
    F: FnMut(&[u8]) -> bool,
{
    type Item = Result<BulkOp<'a>, BulkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let meta_line = self.lines.next_non_blank()?;
        let drop_payload = self.intercept(meta_line);

        let Some(mut meta) = parse_action_meta(meta_line) else {
            self.finished = true;
            return Some(Err(BulkError::MalformedBulkMeta {
                offset: self.offset,
                line: preview(meta_line),
            }));
        };
        self.fill_url_defaults(&mut meta);

        let payload = if meta.action.has_payload() {
            match self.lines.next_non_blank() {
                Some(line) => {
                    let dropped = self.intercept(line) || drop_payload;
                    (!dropped).then_some(line)
                }
                None => None,
            }
        } else {
            None
        };

        let op = BulkOp {
            offset: self.offset,
            meta_line,
            meta,
            payload,
        };
        self.offset += 1;
        Some(Ok(op))
    }
}

/// 📞 Callback flavor of the walk. Returns how many operations were seen.
///
/// `on_meta` gets every meta line with its parsed meta and operation offset; an error from it
/// stops the walk. `on_payload` gets every payload line that survived the interceptor.
pub fn walk_bulk_requests<M, P>(
    url_path: &str,
    data: &[u8],
    interceptor: Option<&mut dyn FnMut(&[u8]) -> bool>,
    mut on_meta: M,
    mut on_payload: P,
) -> Result<usize, BulkError>
where
    M: FnMut(&[u8], &ActionMeta, usize) -> Result<(), BulkError>,
    P: FnMut(&[u8], &ActionMeta),
{
    match interceptor {
        Some(interceptor) => drive(
            bulk_operations(url_path, data).with_interceptor(interceptor),
            &mut on_meta,
            &mut on_payload,
        ),
        None => drive(bulk_operations(url_path, data), &mut on_meta, &mut on_payload),
    }
}

fn drive<'a, I, M, P>(ops: I, on_meta: &mut M, on_payload: &mut P) -> Result<usize, BulkError>
where
    I: Iterator<Item = Result<BulkOp<'a>, BulkError>>,
    M: FnMut(&[u8], &ActionMeta, usize) -> Result<(), BulkError>,
    P: FnMut(&[u8], &ActionMeta),
{
    let mut count = 0;
    for op in ops {
        let op = op?;
        on_meta(op.meta_line, &op.meta, op.offset)?;
        count += 1;
        if let Some(payload) = op.payload {
            on_payload(payload, &op.meta);
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    const MIXED: &[u8] = b"{\"index\":{\"_index\":\"a\",\"_id\":\"1\"}}\n{\"f\":1}\n\n{\"delete\":{\"_index\":\"a\",\"_id\":\"2\"}}\r\n{\"create\":{\"_index\":\"b\",\"_id\":\"3\",\"routing\":\"r1\"}}\r\n{\"f\":3}\n";

    #[test]
    fn the_one_where_deletes_have_no_payload() -> Result<()> {
        let mut metas = Vec::new();
        let mut payloads = Vec::new();
        let count = walk_bulk_requests(
            "/_bulk",
            MIXED,
            None,
            |_, meta, offset| {
                metas.push((meta.action, meta.id.clone(), offset));
                Ok(())
            },
            |payload, meta| payloads.push((meta.id.clone(), payload.to_vec())),
        )?;

        assert_eq!(count, 3);
        assert_eq!(
            metas,
            vec![
                (BulkAction::Index, "1".to_string(), 0),
                (BulkAction::Delete, "2".to_string(), 1),
                (BulkAction::Create, "3".to_string(), 2),
            ]
        );
        assert_eq!(
            payloads,
            vec![
                ("1".to_string(), b"{\"f\":1}".to_vec()),
                ("3".to_string(), b"{\"f\":3}".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn the_one_where_routing_comes_in_two_spellings() {
        let underscored = parse_action_meta(br#"{"index":{"_routing":"x"}}"#);
        let plain = parse_action_meta(br#"{"index":{"routing":"y"}}"#);
        assert_eq!(underscored.map(|m| m.routing), Some("x".to_string()));
        assert_eq!(plain.map(|m| m.routing), Some("y".to_string()));
    }

    #[test]
    fn the_one_where_spacing_and_key_order_dont_matter() {
        let meta = parse_action_meta(br#"{ "update" : { "_id" : "9", "_index" : "idx" } }"#);
        let meta = meta.expect("update meta should parse");
        assert_eq!(meta.action, BulkAction::Update);
        assert_eq!(meta.index, "idx");
        assert_eq!(meta.id, "9");

        let empty = parse_action_meta(br#"{ "update" : {} }"#).expect("empty update parses");
        assert_eq!(empty.action, BulkAction::Update);
        assert!(empty.index.is_empty() && empty.id.is_empty());
    }

    #[test]
    fn the_one_where_a_meta_without_an_action_ends_the_walk() {
        let data = b"{\"index\":{}}\n{}\n{\"upsert\":{}}\n{}\n";
        let result = walk_bulk_requests("/_bulk", data, None, |_, _, _| Ok(()), |_, _| {});
        match result {
            Err(BulkError::MalformedBulkMeta { offset, line }) => {
                assert_eq!(offset, 1);
                assert!(line.contains("upsert"));
            }
            other => panic!("expected malformed meta, got {other:?}"),
        }
    }

    #[test]
    fn the_one_where_the_meta_callback_can_stop_the_show() {
        let result = walk_bulk_requests(
            "/_bulk",
            MIXED,
            None,
            |_, _, offset| {
                if offset == 1 {
                    Err(BulkError::InvalidMessageId)
                } else {
                    Ok(())
                }
            },
            |_, _| {},
        );
        assert!(matches!(result, Err(BulkError::InvalidMessageId)));
    }

    #[test]
    fn the_one_where_the_interceptor_swallows_a_payload() -> Result<()> {
        let data = b"{\"index\":{\"_id\":\"skip-me\"}}\n{\"secret\":true}\n{\"index\":{\"_id\":\"keep\"}}\n{\"f\":2}\n";
        let mut seen_lines = 0;
        let mut interceptor = |line: &[u8]| {
            seen_lines += 1;
            line.windows(7).any(|w| w == b"skip-me")
        };
        let mut payloads = Vec::new();
        let count = walk_bulk_requests(
            "/_bulk",
            data,
            Some(&mut interceptor),
            |_, _, _| Ok(()),
            |payload, _| payloads.push(payload.to_vec()),
        )?;

        assert_eq!(count, 2);
        assert_eq!(payloads, vec![b"{\"f\":2}".to_vec()]);
        assert_eq!(seen_lines, 4);
        Ok(())
    }

    #[test]
    fn the_one_where_the_url_fills_in_the_blanks() -> Result<()> {
        let data = b"{\"index\":{\"_id\":\"1\"}}\n{}\n{\"index\":{\"_index\":\"explicit\",\"_id\":\"2\"}}\n{}\n";
        let ops: Vec<_> = bulk_operations("/logs//doc/_bulk", data).collect::<Result<_, _>>()?;
        assert_eq!(ops[0].meta.index, "logs");
        assert_eq!(ops[0].meta.type_name, "doc");
        assert_eq!(ops[1].meta.index, "explicit");
        Ok(())
    }

    #[test]
    fn the_one_where_url_paths_are_read_like_elasticsearch_reads_them() {
        assert_eq!(parse_url_level_bulk_meta("/_bulk"), (None, None));
        assert_eq!(
            parse_url_level_bulk_meta("/idx/_bulk"),
            (Some("idx".to_string()), None)
        );
        assert_eq!(
            parse_url_level_bulk_meta("//idx//doc//_bulk?refresh=true"),
            (Some("idx".to_string()), Some("doc".to_string()))
        );
        assert_eq!(parse_url_level_bulk_meta("/idx/_search"), (None, None));
    }

    #[test]
    fn the_one_where_metadata_gets_a_makeover() -> Result<()> {
        let patched = update_bulk_metadata(
            Some(BulkAction::Index),
            br#"{"index":{"_index":"medcl1","_type":"_doc","_id":"GZq"}}"#,
            "newIndex",
            "newType",
            "newId",
        )?;
        assert_eq!(
            patched,
            br#"{"index":{"_index":"newIndex","_type":"newType","_id":"newId"}}"#.to_vec()
        );

        let appended = update_bulk_metadata(
            None,
            br#"{"index":{"_index":"medcl1","_id":"GZq"}}"#,
            "newIndex",
            "newType",
            "newId",
        )?;
        assert_eq!(
            appended,
            br#"{"index":{"_index":"newIndex","_id":"newId","_type":"newType"}}"#.to_vec()
        );

        let untouched = update_bulk_metadata(
            Some(BulkAction::Index),
            br#"{"index":{"_index":"medcl1","_type":"doc1"}}"#,
            "",
            "",
            "newId",
        )?;
        assert_eq!(
            untouched,
            br#"{"index":{"_index":"medcl1","_type":"doc1","_id":"newId"}}"#.to_vec()
        );
        Ok(())
    }

    #[test]
    fn the_one_where_patching_twice_changes_nothing() -> Result<()> {
        let meta = br#"{"create":{"_id":"x"}}"#;
        let once = update_bulk_metadata(None, meta, "i", "t", "y")?;
        let twice = update_bulk_metadata(None, &once, "i", "t", "y")?;
        assert_eq!(once, twice);
        Ok(())
    }
}
