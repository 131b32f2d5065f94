//! One live connection to a task's event feed.
//!
//! A reader task pulls transport messages, cuts each batch at its completion
//! marker and decodes the frames before it. Decoded events travel over a
//! bounded channel to a dispatcher task, which is the only caller of the
//! [`StreamHandler`]; delivery therefore follows wire order and every event
//! is handed out at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt as _;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::errors::StreamError;
use crate::event::TaskEvent;
use crate::frame::{FrameParser, decode_frame, is_completion_marker};
use crate::model::{ConnectionId, TaskId};
use crate::transport::{EventSource, TransportMessage};

/// Callbacks invoked by a [`StreamConnection`], always from a single task and
/// in wire order.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_event(&self, task_id: &TaskId, event: TaskEvent);

    fn on_error(&self, task_id: &TaskId, error: StreamError);

    fn on_connected(&self, _task_id: &TaskId) {}

    /// The completion marker arrived; the connection closes right after.
    fn on_completed(&self, _task_id: &TaskId) {}
}

/// Handler callbacks as values.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamNotice {
    Connected { task_id: TaskId },
    Event { task_id: TaskId, event: TaskEvent },
    Error { task_id: TaskId, error: StreamError },
    Completed { task_id: TaskId },
}

/// Forwards every callback into an unbounded channel.
///
/// The receiver yields `None` once every connection using the handler has
/// shut down.
#[derive(Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<StreamNotice>,
}

impl ChannelHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, notice: StreamNotice) {
        if self.tx.send(notice).is_err() {
            debug!("stream notice receiver dropped");
        }
    }
}

impl StreamHandler for ChannelHandler {
    fn on_event(&self, task_id: &TaskId, event: TaskEvent) {
        self.send(StreamNotice::Event {
            task_id: task_id.clone(),
            event,
        });
    }

    fn on_error(&self, task_id: &TaskId, error: StreamError) {
        self.send(StreamNotice::Error {
            task_id: task_id.clone(),
            error,
        });
    }

    fn on_connected(&self, task_id: &TaskId) {
        self.send(StreamNotice::Connected {
            task_id: task_id.clone(),
        });
    }

    fn on_completed(&self, task_id: &TaskId) {
        self.send(StreamNotice::Completed {
            task_id: task_id.clone(),
        });
    }
}

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

pub(crate) type CloseHook = Box<dyn FnOnce(ConnectionId) + Send>;

enum Dispatch {
    Connected,
    Event(TaskEvent),
    Error(StreamError),
    Completed,
}

struct Shared {
    id: ConnectionId,
    task_id: TaskId,
    disconnected: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<ConnectionState>,
    on_close: Mutex<Option<CloseHook>>,
}

impl Shared {
    /// Closes the connection once; later calls return false.
    fn close(&self) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.cancel_tx.send(true);
        self.state_tx.send_replace(ConnectionState::Closed);
        let hook = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook(self.id);
        }
        true
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

/// Handle to one live connection. Clones share the connection.
///
/// Dropping the handles does not close the connection; call
/// [`disconnect`](Self::disconnect).
#[derive(Clone)]
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.shared.id)
            .field("task_id", &self.shared.task_id)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamConnection {
    /// Opens `task_id` on `source` and starts delivering to `handler`.
    /// Must be called from within a tokio runtime.
    pub fn open(
        task_id: TaskId,
        source: Arc<dyn EventSource>,
        parser: FrameParser,
        buffer_capacity: usize,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        Self::open_with_hook(task_id, source, parser, buffer_capacity, handler, None)
    }

    pub(crate) fn open_with_hook(
        task_id: TaskId,
        source: Arc<dyn EventSource>,
        parser: FrameParser,
        buffer_capacity: usize,
        handler: Arc<dyn StreamHandler>,
        on_close: Option<CloseHook>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            id: ConnectionId::generate(),
            task_id: task_id.clone(),
            disconnected: AtomicBool::new(false),
            cancel_tx,
            state_tx,
            on_close: Mutex::new(on_close),
        });
        let (tx, rx) = mpsc::channel(buffer_capacity.max(1));
        debug!(task_id = %task_id, connection = %shared.id, "opening stream connection");
        tokio::spawn(read_task(task_id, source, parser, tx, cancel_rx));
        tokio::spawn(dispatch_task(shared.clone(), rx, handler));
        Self { shared }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.shared.task_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Resolves once the connection is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    /// Closes the transport and silences the handler. Returns false if the
    /// connection was already closed.
    pub fn disconnect(&self) -> bool {
        let closed = self.shared.close();
        if closed {
            info!(task_id = %self.shared.task_id, connection = %self.shared.id, "stream disconnected");
        }
        closed
    }
}

/// Resolves when `rx` turns true. Never resolves if the sender is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let sender_alive = rx.wait_for(|cancelled| *cancelled).await.is_ok();
    if !sender_alive {
        std::future::pending::<()>().await;
    }
}

async fn read_task(
    task_id: TaskId,
    source: Arc<dyn EventSource>,
    parser: FrameParser,
    tx: mpsc::Sender<Dispatch>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let opened = tokio::select! {
        biased;
        _ = cancelled(&mut cancel_rx) => return,
        opened = source.open(&task_id) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(err) => {
            let _ = tx
                .send(Dispatch::Error(StreamError::Open {
                    task_id,
                    message: err.message,
                }))
                .await;
            return;
        }
    };
    if tx.send(Dispatch::Connected).await.is_err() {
        return;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                if !forward_message(&task_id, &parser, &message, &tx).await {
                    return;
                }
            }
            Some(Err(err)) => {
                let error = StreamError::from_transport(&task_id, err);
                let terminal = error.is_terminal();
                if tx.send(Dispatch::Error(error)).await.is_err() || terminal {
                    return;
                }
            }
            None => {
                let _ = tx
                    .send(Dispatch::Error(StreamError::ClosedBeforeCompletion { task_id }))
                    .await;
                return;
            }
        }
    }
}

/// Returns false once nothing more should be read.
async fn forward_message(
    task_id: &TaskId,
    parser: &FrameParser,
    message: &TransportMessage,
    tx: &mpsc::Sender<Dispatch>,
) -> bool {
    let frames = parser.split(&message.data);
    // Frames after the marker are never delivered.
    let completion = frames.iter().position(|frame| is_completion_marker(frame));
    let deliverable = &frames[..completion.unwrap_or(frames.len())];
    debug!(task_id = %task_id, frames = frames.len(), completes = completion.is_some(), "transport message received");

    for frame in deliverable {
        if let Some(event) = decode_frame(frame).into_event()
            && tx.send(Dispatch::Event(event)).await.is_err()
        {
            return false;
        }
    }
    if completion.is_some() {
        let _ = tx.send(Dispatch::Completed).await;
        return false;
    }
    true
}

async fn dispatch_task(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Dispatch>,
    handler: Arc<dyn StreamHandler>,
) {
    let task_id = shared.task_id.clone();
    while let Some(item) = rx.recv().await {
        if shared.is_disconnected() {
            break;
        }
        match item {
            Dispatch::Connected => {
                shared.state_tx.send_replace(ConnectionState::Open);
                info!(task_id = %task_id, connection = %shared.id, "stream connected");
                handler.on_connected(&task_id);
            }
            Dispatch::Event(event) => handler.on_event(&task_id, event),
            Dispatch::Error(error) => {
                let terminal = error.is_terminal();
                warn!(task_id = %task_id, error = %error, terminal, "stream error");
                handler.on_error(&task_id, error);
                if terminal {
                    shared.close();
                    return;
                }
            }
            Dispatch::Completed => {
                info!(task_id = %task_id, connection = %shared.id, "stream completed");
                handler.on_completed(&task_id);
                shared.close();
                return;
            }
        }
    }
    shared.close();
}
