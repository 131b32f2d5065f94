//! Folding of the task event sequence into an ordered message store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::event::{Author, EntryKind, EntrySnapshot, EntryStyle, TaskEvent};
use crate::model::EntryId;

/// Which id space an entry lives in. Text and tool entries never merge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum EntryFamily {
    Text,
    Tool,
}

/// Store key of a message entry.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntryKey {
    pub family: EntryFamily,
    pub id: EntryId,
}

impl EntryKey {
    pub fn text(id: impl Into<EntryId>) -> Self {
        Self {
            family: EntryFamily::Text,
            id: id.into(),
        }
    }

    pub fn tool(id: impl Into<EntryId>) -> Self {
        Self {
            family: EntryFamily::Tool,
            id: id.into(),
        }
    }
}

/// Name, arguments and (once paired) the response of a tool invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Option<serde_json::Value>,
    pub response: Option<String>,
}

/// Accumulated state of one logical chat message.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEntry {
    pub id: EntryId,
    pub author: Author,
    pub style: EntryStyle,
    pub kind: EntryKind,
    pub content: String,
    pub attachments: Vec<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub tool: Option<ToolCall>,
    arrival: u64,
}

impl MessageEntry {
    fn materialize(
        snapshot: &EntrySnapshot,
        kind: EntryKind,
        default_style: EntryStyle,
        arrival: u64,
    ) -> Self {
        Self {
            id: snapshot.id.clone(),
            author: snapshot.author.unwrap_or(Author::Agent),
            style: snapshot.style.unwrap_or(default_style),
            kind,
            content: String::new(),
            attachments: snapshot.attachments.clone(),
            timestamp: snapshot.timestamp.unwrap_or_else(Utc::now),
            tool: None,
            arrival,
        }
    }

    pub fn key(&self) -> EntryKey {
        let family = match self.kind {
            EntryKind::Text => EntryFamily::Text,
            EntryKind::ToolRequest | EntryKind::ToolResponse => EntryFamily::Tool,
        };
        EntryKey {
            family,
            id: self.id.clone(),
        }
    }

    /// Position in which the entry was first seen by the store.
    pub fn arrival(&self) -> u64 {
        self.arrival
    }
}

/// Outcome of applying one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Created(EntryKey),
    Updated(EntryKey),
    Unchanged(EntryKey),
    /// `Done` was observed; the store is untouched.
    Completed,
    /// `Error` was observed; the store is untouched.
    Failed(String),
}

/// Message entries keyed by family and id. Entries are never removed.
#[derive(Clone, Debug, Default)]
pub struct MessageStore {
    entries: HashMap<EntryKey, MessageEntry>,
    next_arrival: u64,
}

impl MessageStore {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &EntryKey) -> Option<&MessageEntry> {
        self.entries.get(key)
    }

    /// Text entry with the given id.
    pub fn text(&self, id: &str) -> Option<&MessageEntry> {
        self.entries.get(&EntryKey::text(id))
    }

    /// Tool entry with the given id.
    pub fn tool(&self, id: &str) -> Option<&MessageEntry> {
        self.entries.get(&EntryKey::tool(id))
    }

    /// Entries sorted by timestamp, ties broken by arrival order.
    pub fn ordered(&self) -> Vec<&MessageEntry> {
        let mut entries: Vec<&MessageEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.arrival.cmp(&b.arrival))
        });
        entries
    }

    fn entry_or_materialize(
        &mut self,
        key: EntryKey,
        snapshot: &EntrySnapshot,
        kind: EntryKind,
        default_style: EntryStyle,
    ) -> (&mut MessageEntry, bool) {
        let arrival = self.next_arrival;
        let mut created = false;
        let entry = self.entries.entry(key).or_insert_with(|| {
            created = true;
            MessageEntry::materialize(snapshot, kind, default_style, arrival)
        });
        if created {
            self.next_arrival += 1;
        }
        (entry, created)
    }
}

/// Applies task events to a `MessageStore` in delivery order.
///
/// Chunks append and are therefore not idempotent; the connection layer
/// guarantees each chunk is delivered at most once. Full content updates
/// overwrite and can be replayed safely.
#[derive(Debug, Default)]
pub struct MessageReconciler {
    store: MessageStore,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn into_store(self) -> MessageStore {
        self.store
    }

    /// Applies a batch of events in order.
    pub fn apply_all(&mut self, events: impl IntoIterator<Item = TaskEvent>) -> Vec<Applied> {
        events.into_iter().map(|event| self.apply(event)).collect()
    }

    pub fn apply(&mut self, event: TaskEvent) -> Applied {
        match event {
            TaskEvent::StreamingChunk { parent, chunk } => self.apply_chunk(&parent, &chunk),
            TaskEvent::FullContentUpdate { parent, content } => {
                self.apply_full_content(&parent, content)
            }
            TaskEvent::ToolRequest {
                parent,
                name,
                arguments,
            } => self.apply_tool_request(&parent, name, arguments),
            TaskEvent::ToolResponse {
                parent,
                name,
                content,
            } => self.apply_tool_response(&parent, name, content),
            TaskEvent::Done => Applied::Completed,
            TaskEvent::Error { message } => Applied::Failed(message),
        }
    }

    fn apply_chunk(&mut self, parent: &EntrySnapshot, chunk: &str) -> Applied {
        let key = EntryKey::text(parent.id.clone());
        let (entry, created) = self.store.entry_or_materialize(
            key.clone(),
            parent,
            EntryKind::Text,
            EntryStyle::Streaming,
        );
        entry.content.push_str(chunk);
        debug!(entry = %key.id, len = entry.content.len(), "appended streaming chunk");
        if created {
            Applied::Created(key)
        } else if chunk.is_empty() {
            Applied::Unchanged(key)
        } else {
            Applied::Updated(key)
        }
    }

    fn apply_full_content(&mut self, parent: &EntrySnapshot, content: String) -> Applied {
        let key = EntryKey::text(parent.id.clone());
        let (entry, created) =
            self.store
                .entry_or_materialize(key.clone(), parent, EntryKind::Text, EntryStyle::Static);
        let mut changed = false;
        if entry.content != content {
            entry.content = content;
            changed = true;
        }
        if let Some(style) = parent.style
            && entry.style != style
        {
            entry.style = style;
            changed = true;
        }
        outcome(key, created, changed)
    }

    fn apply_tool_request(
        &mut self,
        parent: &EntrySnapshot,
        name: String,
        arguments: serde_json::Value,
    ) -> Applied {
        let key = EntryKey::tool(parent.id.clone());
        let (entry, created) = self.store.entry_or_materialize(
            key.clone(),
            parent,
            EntryKind::ToolRequest,
            EntryStyle::Static,
        );
        let changed = match entry.tool.as_mut() {
            Some(tool) => {
                let changed = tool.name != name || tool.arguments.as_ref() != Some(&arguments);
                // A paired response keeps its content; only the call text is re-rendered.
                if entry.kind == EntryKind::ToolRequest {
                    entry.content = render_tool_request(&name, &arguments);
                }
                tool.name = name;
                tool.arguments = Some(arguments);
                changed
            }
            None => {
                entry.content = render_tool_request(&name, &arguments);
                entry.tool = Some(ToolCall {
                    name,
                    arguments: Some(arguments),
                    response: None,
                });
                true
            }
        };
        outcome(key, created, changed)
    }

    fn apply_tool_response(
        &mut self,
        parent: &EntrySnapshot,
        name: String,
        content: String,
    ) -> Applied {
        let key = EntryKey::tool(parent.id.clone());
        let (entry, created) = self.store.entry_or_materialize(
            key.clone(),
            parent,
            EntryKind::ToolResponse,
            EntryStyle::Static,
        );
        let changed = entry.kind != EntryKind::ToolResponse || entry.content != content;
        entry.kind = EntryKind::ToolResponse;
        match entry.tool.as_mut() {
            Some(tool) => {
                if tool.name != name {
                    warn!(entry = %key.id, request = %tool.name, response = %name, "tool response name does not match request");
                }
                tool.response = Some(content.clone());
            }
            None => {
                entry.tool = Some(ToolCall {
                    name,
                    arguments: None,
                    response: Some(content.clone()),
                });
            }
        }
        entry.content = content;
        outcome(key, created, changed)
    }
}

fn outcome(key: EntryKey, created: bool, changed: bool) -> Applied {
    match (created, changed) {
        (true, _) => Applied::Created(key),
        (false, true) => Applied::Updated(key),
        (false, false) => Applied::Unchanged(key),
    }
}

fn render_tool_request(name: &str, arguments: &serde_json::Value) -> String {
    format!("{name}({arguments})")
}
