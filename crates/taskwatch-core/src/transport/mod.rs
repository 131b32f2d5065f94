//! Contracts for the collaborators the engine consumes, plus their HTTP
//! implementations.

mod http;
pub(crate) mod sse;

use std::pin::Pin;

use crate::errors::{FetchError, TransportError};
use crate::model::{TaskId, TraceId};
use crate::trace::Span;

pub use http::{HttpEventSource, HttpTraceApi};

/// One inbound message from an event source. `data` may batch several frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Transport-level event name, when the transport has one.
    pub event: Option<String>,
    pub data: String,
}

impl TransportMessage {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

/// Ordered stream of transport messages. Dropping it closes the transport.
pub type TransportStream = Pin<
    Box<dyn futures::Stream<Item = Result<TransportMessage, TransportError>> + Send + 'static>,
>;

/// Opens the per-task real-time feed.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, task_id: &TaskId) -> Result<TransportStream, TransportError>;
}

/// Task details relevant to trace polling.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Request/response calls used by the trace poller. Both must be safe to retry.
#[async_trait::async_trait]
pub trait TraceApi: Send + Sync {
    async fn fetch_task(&self, task_id: &TaskId) -> Result<TaskInfo, FetchError>;

    async fn fetch_spans(
        &self,
        task_id: &TaskId,
        trace_id: &TraceId,
    ) -> Result<Vec<Span>, FetchError>;
}
