//! In-process fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::channel::mpsc;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::connection::StreamNotice;
use crate::errors::TransportError;
use crate::model::TaskId;
use crate::transport::{EventSource, TransportMessage, TransportStream};

pub(crate) type FeedSender = mpsc::UnboundedSender<Result<TransportMessage, TransportError>>;

/// Event source whose streams are fed by the test. Each `open` consumes the
/// next scripted outcome; opening with nothing scripted fails.
#[derive(Default)]
pub(crate) struct FakeSource {
    scripted: Mutex<VecDeque<Result<TransportStream, TransportError>>>,
    opens: AtomicUsize,
    held: AtomicBool,
    gate: Notify,
}

impl FakeSource {
    /// Scripts a successful open and returns the sender feeding that stream.
    /// Dropping the sender ends the stream.
    pub(crate) fn feed(&self) -> FeedSender {
        let (tx, rx) = mpsc::unbounded();
        let stream: TransportStream = Box::pin(rx);
        self.scripted
            .lock()
            .expect("scripted lock")
            .push_back(Ok(stream));
        tx
    }

    pub(crate) fn fail(&self, error: TransportError) {
        self.scripted
            .lock()
            .expect("scripted lock")
            .push_back(Err(error));
    }

    /// Parks every later `open` until [`release`](Self::release).
    pub(crate) fn hold_opens(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EventSource for FakeSource {
    async fn open(&self, _task_id: &TaskId) -> Result<TransportStream, TransportError> {
        let released = self.gate.notified();
        tokio::pin!(released);
        released.as_mut().enable();
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.held.load(Ordering::SeqCst) {
            released.await;
        }
        self.scripted
            .lock()
            .expect("scripted lock")
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::terminal("connection refused")))
    }
}

pub(crate) fn send(feed: &FeedSender, data: impl Into<String>) {
    feed.unbounded_send(Ok(TransportMessage::data(data)))
        .expect("feed open");
}

pub(crate) fn chunk(id: &str, chunk: &str) -> String {
    serde_json::json!({
        "type": "streaming_chunk",
        "parentEntry": {"id": id, "author": "agent", "style": "streaming"},
        "contentChunk": chunk,
    })
    .to_string()
}

/// Collects notices until the channel closes.
pub(crate) async fn drain(rx: &mut UnboundedReceiver<StreamNotice>) -> Vec<StreamNotice> {
    let mut notices = Vec::new();
    while let Ok(Some(notice)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        notices.push(notice);
    }
    notices
}

/// Waits for the next notice.
pub(crate) async fn next(rx: &mut UnboundedReceiver<StreamNotice>) -> StreamNotice {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notice within timeout")
        .expect("notice channel open")
}
