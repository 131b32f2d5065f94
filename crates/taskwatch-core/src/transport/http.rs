use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::debug;

use super::sse::SseDecoder;
use super::{EventSource, TaskInfo, TraceApi, TransportMessage, TransportStream};
use crate::config::ApiConfig;
use crate::errors::{ConfigError, FetchError, TransportError};
use crate::frame::FRAME_SEPARATOR;
use crate::model::{TaskId, TraceId};
use crate::trace::Span;

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Server-sent-events feed at `{base}/api/tasks/{task}/events`.
///
/// Each `data:` line of an event is forwarded as its own frame, joined with
/// the frame separator, so one event can batch several frames.
pub struct HttpEventSource {
    client: reqwest::Client,
    config: ApiConfig,
    frame_separator: String,
}

impl HttpEventSource {
    pub fn new(config: ApiConfig) -> Result<Self, ConfigError> {
        // No overall timeout: the response body lives as long as the stream.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::invalid("http client", e.to_string()))?;
        Ok(Self {
            client,
            config,
            frame_separator: FRAME_SEPARATOR.to_string(),
        })
    }

    /// Must match the separator of the parser reading this source.
    pub fn frame_separator(mut self, separator: impl Into<String>) -> Self {
        self.frame_separator = separator.into();
        self
    }
}

#[async_trait::async_trait]
impl EventSource for HttpEventSource {
    async fn open(&self, task_id: &TaskId) -> Result<TransportStream, TransportError> {
        let url = self.config.events_url(task_id);
        debug!(task_id = %task_id, url = %url, "opening task event stream");
        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = self.config.api_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::terminal(format!("event stream request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::terminal(format!(
                "event stream request failed with status {status}: {body}"
            )));
        }
        Ok(Box::pin(sse_message_stream(
            Box::pin(response.bytes_stream()),
            SseDecoder::new(self.frame_separator.clone()),
        )))
    }
}

fn sse_message_stream(
    bytes_stream: ByteStream,
    decoder: SseDecoder,
) -> impl futures::Stream<Item = Result<TransportMessage, TransportError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<TransportMessage>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream,
            decoder,
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(message) = state.pending.pop_front() {
                    return Ok(Some((message, state)));
                }
                if state.done {
                    return Ok(None);
                }
                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push_chunk(&chunk));
                    }
                    Some(Err(e)) => {
                        return Err(TransportError::terminal(format!(
                            "event stream read failed: {e}"
                        )));
                    }
                    None => {
                        state.pending.extend(state.decoder.finish());
                        state.done = true;
                    }
                }
            }
        },
    )
}

/// Task and span lookups against the task backend.
pub struct HttpTraceApi {
    client: reqwest::Client,
    config: ApiConfig,
}

impl HttpTraceApi {
    pub fn new(config: ApiConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::invalid("http client", e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(token) = self.config.api_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(format!("GET {url} failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("reading {url} failed: {e}")))?;
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(body)
    }
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum SpansBody {
    Bare(Vec<Span>),
    Wrapped { spans: Vec<Span> },
}

pub(crate) fn decode_spans(body: &str) -> Result<Vec<Span>, FetchError> {
    match serde_json::from_str::<SpansBody>(body) {
        Ok(SpansBody::Bare(spans) | SpansBody::Wrapped { spans }) => Ok(spans),
        Err(e) => Err(FetchError::Decode(format!("invalid span list: {e}"))),
    }
}

#[async_trait::async_trait]
impl TraceApi for HttpTraceApi {
    async fn fetch_task(&self, task_id: &TaskId) -> Result<TaskInfo, FetchError> {
        let body = self.get_text(&self.config.task_url(task_id)).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(format!("invalid task: {e}")))
    }

    async fn fetch_spans(
        &self,
        task_id: &TaskId,
        trace_id: &TraceId,
    ) -> Result<Vec<Span>, FetchError> {
        let body = self
            .get_text(&self.config.spans_url(task_id, trace_id))
            .await?;
        decode_spans(&body)
    }
}
