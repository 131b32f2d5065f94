use chrono::{DateTime, Utc};

use crate::model::EntryId;

/// Who authored a message entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Agent,
}

impl Author {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Self::User),
            "agent" | "assistant" | "ai" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// Whether an entry is still receiving chunks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStyle {
    Static,
    Streaming,
}

impl EntryStyle {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "static" => Some(Self::Static),
            "streaming" | "actively_streaming" | "actively-streaming" => Some(Self::Streaming),
            _ => None,
        }
    }
}

/// What a message entry represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Text,
    ToolRequest,
    ToolResponse,
}

impl EntryKind {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "tool_request" | "tool-request" => Some(Self::ToolRequest),
            "tool_response" | "tool-response" => Some(Self::ToolResponse),
            _ => None,
        }
    }
}

/// The parent entry as announced by the server alongside an event.
///
/// Only `id` is guaranteed; the reconciler fills the rest with defaults when
/// it has to materialize an entry from a bare reference.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub author: Option<Author>,
    pub style: Option<EntryStyle>,
    pub kind: Option<EntryKind>,
    pub attachments: Vec<serde_json::Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl EntrySnapshot {
    /// Creates a snapshot that carries nothing but the entry id.
    pub fn bare(id: impl Into<EntryId>) -> Self {
        Self {
            id: id.into(),
            author: None,
            style: None,
            kind: None,
            attachments: Vec::new(),
            timestamp: None,
        }
    }

    pub fn author(mut self, author: Author) -> Self {
        self.author = Some(author);
        self
    }

    pub fn style(mut self, style: EntryStyle) -> Self {
        self.style = Some(style);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// One typed unit decoded from the task event feed.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent {
    /// Incremental text fragment for a message.
    StreamingChunk { parent: EntrySnapshot, chunk: String },
    /// Authoritative replacement of a message's full text.
    FullContentUpdate { parent: EntrySnapshot, content: String },
    /// Tool invocation announced by the remote agent.
    ToolRequest {
        parent: EntrySnapshot,
        name: String,
        arguments: serde_json::Value,
    },
    /// Result of a previously announced tool invocation.
    ToolResponse {
        parent: EntrySnapshot,
        name: String,
        content: String,
    },
    /// No further events follow on this connection.
    Done,
    /// Reported failure; does not terminate the stream by itself.
    Error { message: String },
}

impl TaskEvent {
    /// Returns the parent snapshot for message-bearing events.
    pub fn parent(&self) -> Option<&EntrySnapshot> {
        match self {
            Self::StreamingChunk { parent, .. }
            | Self::FullContentUpdate { parent, .. }
            | Self::ToolRequest { parent, .. }
            | Self::ToolResponse { parent, .. } => Some(parent),
            Self::Done | Self::Error { .. } => None,
        }
    }

    /// Returns the id of the entry this event mutates.
    pub fn parent_entry_id(&self) -> Option<&EntryId> {
        self.parent().map(|parent| &parent.id)
    }
}
