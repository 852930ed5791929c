/// Decoding of one transcript line into a typed record.
///
/// Lines are parsed leniently through `serde_json::Value`: lines that are not
/// JSON or carry no usable timestamp yield `None` and are skipped by the
/// caller.
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Record kind from the top-level `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Assistant,
    User,
    Other,
}

/// Token counts reported on an assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

/// Content blocks the correlator cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    /// `id` is absent on malformed blocks; those still count toward lines of
    /// code but cannot be correlated.
    ToolUse {
        id: Option<String>,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        is_error: bool,
    },
}

/// One decoded transcript line.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub kind: RecordKind,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub blocks: Vec<ContentBlock>,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

/// Parse an ISO 8601 timestamp such as `2025-06-01T12:00:00.123Z`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl RawRecord {
    /// Decode one line. Returns `None` for malformed JSON or a missing or
    /// unparseable timestamp. A missing `message` object, or content that is
    /// not a block list, yields a record with no blocks and no usage.
    pub fn parse_line(line: &str) -> Option<Self> {
        let v: Value = serde_json::from_str(line).ok()?;
        Self::from_value(&v)
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        let timestamp = v
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)?;

        let kind = match v.get("type").and_then(Value::as_str) {
            Some("assistant") => RecordKind::Assistant,
            Some("user") => RecordKind::User,
            _ => RecordKind::Other,
        };
        let session_id = v
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        // Without a block-structured message the record only contributes its
        // timestamp and session id.
        let message = v.get("message").and_then(Value::as_object);
        let Some((message, items)) = message.and_then(|m| match m.get("content") {
            None => Some((m, &[] as &[Value])),
            Some(Value::Array(items)) => Some((m, items.as_slice())),
            Some(_) => None,
        }) else {
            return Some(RawRecord {
                kind,
                timestamp,
                session_id,
                blocks: Vec::new(),
                model: None,
                usage: None,
            });
        };
        let blocks = items.iter().filter_map(parse_block).collect();

        let usage = message
            .get("usage")
            .and_then(Value::as_object)
            .filter(|u| !u.is_empty())
            .map(|u| Usage {
                input_tokens: count(u.get("input_tokens")),
                output_tokens: count(u.get("output_tokens")),
                cache_read_input_tokens: count(u.get("cache_read_input_tokens")),
                cache_creation_input_tokens: count(u.get("cache_creation_input_tokens")),
            });

        Some(RawRecord {
            kind,
            timestamp,
            session_id,
            blocks,
            model: message
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage,
        })
    }
}

fn count(v: Option<&Value>) -> u64 {
    v.and_then(Value::as_u64).unwrap_or(0)
}

fn parse_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type").and_then(Value::as_str)? {
        "tool_use" => Some(ContentBlock::ToolUse {
            id: block
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())?
                .to_string(),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        _ => None,
    }
}
