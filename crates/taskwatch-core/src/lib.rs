//! Client-side engine that follows a remote agent task: it streams the task's
//! event feed into a message store and polls the task's trace spans.
//!
//! # Streaming a task
//!
//! ```no_run
//! use taskwatch_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), TaskwatchError> {
//! let client = Taskwatch::from_env()?;
//! let (handler, mut notices) = ChannelHandler::new();
//! let stream = client.supervise(TaskId::new("task-42"), handler);
//!
//! let mut reconciler = MessageReconciler::new();
//! while let Some(notice) = notices.recv().await {
//!     match notice {
//!         StreamNotice::Event { event, .. } => {
//!             reconciler.apply(event);
//!         }
//!         StreamNotice::Completed { .. } => break,
//!         _ => {}
//!     }
//! }
//! stream.stop();
//!
//! for entry in reconciler.store().ordered() {
//!     println!("{:?}: {}", entry.author, entry.content);
//! }
//! # Ok(())
//! # }
//! ```

/// Engine entry point wiring configuration to collaborators.
pub mod client;
/// Backend location, stream, polling and reconnect settings.
pub mod config;
/// Live connection to one task's event feed.
pub mod connection;
/// Public error types.
pub mod errors;
/// Typed task events and parent-entry snapshots.
pub mod event;
/// Frame splitting and decoding.
pub mod frame;
/// Identifier newtypes.
pub mod model;
/// Process-wide logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Folding task events into a message store.
pub mod reconcile;
/// Supervised reconnection with backoff.
pub mod reconnect;
/// One-connection-per-task table.
pub mod registry;
/// Span polling and span trees.
pub mod trace;
/// Collaborator contracts and their HTTP implementations.
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::Taskwatch;
pub use config::{ApiConfig, StreamConfig, TaskwatchConfig, TracePollerConfig};
pub use connection::{
    ChannelHandler, ConnectionState, StreamConnection, StreamHandler, StreamNotice,
};
pub use errors::{
    ConfigError, FetchError, StreamError, TaskwatchError, TraceError, TransportError,
};
pub use event::{Author, EntryKind, EntrySnapshot, EntryStyle, TaskEvent};
pub use frame::{FrameOutcome, FrameParser};
pub use model::{ConnectionId, EntryId, SpanId, TaskId, TraceId};
pub use observability::init_observability;
pub use reconcile::{
    Applied, EntryFamily, EntryKey, MessageEntry, MessageReconciler, MessageStore, ToolCall,
};
pub use reconnect::{
    Backoff, ReconnectConfig, SupervisedStream, SupervisorExit, supervise,
};
pub use registry::StreamRegistry;
pub use trace::{
    PollHandle, PollPhase, Span, SpanNode, SpanSnapshot, SpanTree, TickReport, TracePoller,
    TraceUpdate,
};
pub use transport::{
    EventSource, HttpEventSource, HttpTraceApi, TaskInfo, TraceApi, TransportMessage,
    TransportStream,
};
