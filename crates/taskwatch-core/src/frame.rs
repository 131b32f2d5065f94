//! Decoding of raw transport text into typed task events.
//!
//! A transport message carries either several JSON frames joined by a
//! separator token or one bare JSON object. Every frame is decoded on its own
//! so a malformed frame never costs its siblings.

use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{Author, EntryKind, EntrySnapshot, EntryStyle, TaskEvent};
use crate::model::EntryId;

/// Separator between frames batched into one transport message.
pub const FRAME_SEPARATOR: &str = "\n\n";

/// Literal frame some servers send instead of a `done` object.
pub const DONE_SENTINEL: &str = "[DONE]";

const TAG_STREAMING_CHUNK: &str = "streaming_chunk";
const TAG_FULL_CONTENT: &str = "full_content_update";
const TAG_TOOL_REQUEST: &str = "tool_request";
const TAG_TOOL_RESPONSE: &str = "tool_response";
const TAG_DONE: &str = "done";
const TAG_ERROR: &str = "error";
const TAG_CONNECTION_ACK: &str = "connection_ack";

/// Parses `raw` with the default separator.
pub fn parse(raw: &str) -> Vec<TaskEvent> {
    FrameParser::default().parse(raw)
}

/// Stateless frame splitter and decoder.
#[derive(Clone, Debug)]
pub struct FrameParser {
    separator: String,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(FRAME_SEPARATOR)
    }
}

impl FrameParser {
    /// Creates a parser splitting on `separator`; an empty separator disables splitting.
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Decodes every frame in `raw`, in wire order, dropping the ones that
    /// do not yield an event.
    pub fn parse(&self, raw: &str) -> Vec<TaskEvent> {
        self.split(raw)
            .into_iter()
            .filter_map(|frame| decode_frame(frame).into_event())
            .collect()
    }

    /// Splits `raw` into trimmed, non-empty frames.
    pub fn split<'a>(&self, raw: &'a str) -> Vec<&'a str> {
        if self.separator.is_empty() || !raw.contains(self.separator.as_str()) {
            let trimmed = raw.trim();
            return if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed]
            };
        }
        raw.split(self.separator.as_str())
            .map(str::trim)
            .filter(|frame| !frame.is_empty())
            .collect()
    }
}

/// Result of decoding a single frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Event(TaskEvent),
    /// Server acknowledged the connection; nothing to surface.
    Acknowledged,
    /// Frame was discarded; the reason has already been logged.
    Dropped(String),
}

impl FrameOutcome {
    pub fn into_event(self) -> Option<TaskEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Acknowledged | Self::Dropped(_) => None,
        }
    }
}

/// Returns true when `frame` is the transport-level completion marker.
pub fn is_completion_marker(frame: &str) -> bool {
    let frame = frame.trim();
    if frame == DONE_SENTINEL {
        return true;
    }
    // Cheap pre-check before paying for a full decode.
    if !frame.contains(TAG_DONE) {
        return false;
    }
    serde_json::from_str::<Value>(frame)
        .ok()
        .and_then(|value| value.get("type").and_then(Value::as_str).map(|t| t == TAG_DONE))
        .unwrap_or(false)
}

/// Decodes one frame. Never fails; malformed input becomes `Dropped`.
pub fn decode_frame(frame: &str) -> FrameOutcome {
    let frame = frame.trim();
    if frame == DONE_SENTINEL {
        return FrameOutcome::Event(TaskEvent::Done);
    }
    let value: Value = match serde_json::from_str(frame) {
        Ok(value) => value,
        Err(e) => return dropped(format!("invalid JSON frame: {e}")),
    };
    if !value.is_object() {
        return dropped("frame is not a JSON object".to_string());
    }
    decode_value(&value)
}

fn decode_value(value: &Value) -> FrameOutcome {
    let tag = value.get("type").and_then(Value::as_str);
    let parent = parent_snapshot(value);

    match tag {
        Some(TAG_CONNECTION_ACK) => {
            debug!("connection acknowledged by server");
            return FrameOutcome::Acknowledged;
        }
        Some(TAG_DONE) => return FrameOutcome::Event(TaskEvent::Done),
        Some(TAG_ERROR) => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| {
                    value
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                })
                .unwrap_or("task stream error");
            return FrameOutcome::Event(TaskEvent::Error {
                message: message.to_string(),
            });
        }
        Some(TAG_STREAMING_CHUNK) => {
            let (Some(parent), Some(chunk)) = (parent, string_field(value, "contentChunk")) else {
                return dropped("streaming chunk without parent entry or chunk payload".into());
            };
            return FrameOutcome::Event(TaskEvent::StreamingChunk { parent, chunk });
        }
        _ => {}
    }

    let Some(parent) = parent else {
        return dropped(format!(
            "frame of type {} has no parent entry",
            tag.unwrap_or("<none>")
        ));
    };

    match tag {
        Some(TAG_FULL_CONTENT) => match string_field(value, "content") {
            Some(content) => FrameOutcome::Event(TaskEvent::FullContentUpdate { parent, content }),
            None => dropped("full content update without content".into()),
        },
        Some(TAG_TOOL_REQUEST) => {
            let name = string_field(value, "name");
            let arguments = value.get("arguments").filter(|v| !v.is_null()).cloned();
            match (name, arguments) {
                (Some(name), Some(arguments)) => FrameOutcome::Event(TaskEvent::ToolRequest {
                    parent,
                    name,
                    arguments,
                }),
                _ => dropped("tool request without name or arguments".into()),
            }
        }
        Some(TAG_TOOL_RESPONSE) => {
            let name = string_field(value, "name");
            let content = value.get("content").and_then(render_content);
            match (name, content) {
                (Some(name), Some(content)) => FrameOutcome::Event(TaskEvent::ToolResponse {
                    parent,
                    name,
                    content,
                }),
                _ => dropped("tool response without name or content".into()),
            }
        }
        other => recover(value, parent, other),
    }
}

/// Best-effort decoding of a parented frame whose discriminant is unknown.
fn recover(value: &Value, parent: EntrySnapshot, tag: Option<&str>) -> FrameOutcome {
    if let Some(chunk) = string_field(value, "contentChunk") {
        debug!(tag = tag.unwrap_or("<none>"), entry = %parent.id, "recovered frame as streaming chunk");
        return FrameOutcome::Event(TaskEvent::StreamingChunk { parent, chunk });
    }
    if let Some(content) = string_field(value, "content") {
        debug!(tag = tag.unwrap_or("<none>"), entry = %parent.id, "recovered frame as full content update");
        return FrameOutcome::Event(TaskEvent::FullContentUpdate { parent, content });
    }
    dropped(format!(
        "unrecognized frame type {} for entry {}",
        tag.unwrap_or("<none>"),
        parent.id
    ))
}

fn parent_snapshot(value: &Value) -> Option<EntrySnapshot> {
    if let Some(parent) = value.get("parentEntry").filter(|p| p.is_object()) {
        let id = parent.get("id").and_then(id_string)?;
        return Some(EntrySnapshot {
            id: EntryId::new(id),
            author: parent
                .get("author")
                .and_then(Value::as_str)
                .and_then(Author::parse),
            style: parent
                .get("style")
                .and_then(Value::as_str)
                .and_then(EntryStyle::parse),
            kind: parent
                .get("kind")
                .and_then(Value::as_str)
                .and_then(EntryKind::parse),
            attachments: parent
                .get("attachments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            timestamp: parent
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                .map(|ts| ts.with_timezone(&chrono::Utc)),
        });
    }
    value
        .get("parentEntryId")
        .and_then(id_string)
        .map(EntrySnapshot::bare)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

fn render_content(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn dropped(reason: String) -> FrameOutcome {
    warn!(reason = %reason, "dropping task event frame");
    FrameOutcome::Dropped(reason)
}
