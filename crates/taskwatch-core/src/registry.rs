use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::connection::{CloseHook, StreamConnection, StreamHandler};
use crate::frame::FrameParser;
use crate::model::{ConnectionId, TaskId};
use crate::transport::EventSource;

struct RegistryInner {
    source: Arc<dyn EventSource>,
    parser: FrameParser,
    buffer_capacity: usize,
    connections: DashMap<TaskId, StreamConnection>,
}

/// Table of live connections, at most one per task id.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl StreamRegistry {
    pub fn new(source: Arc<dyn EventSource>, config: &StreamConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                source,
                parser: FrameParser::new(config.frame_separator.clone()),
                buffer_capacity: config.buffer_capacity,
                connections: DashMap::new(),
            }),
        }
    }

    /// Opens a connection for `task_id`, disconnecting and replacing any
    /// connection already registered for it.
    pub fn connect(&self, task_id: TaskId, handler: Arc<dyn StreamHandler>) -> StreamConnection {
        if let Some((_, previous)) = self.inner.connections.remove(&task_id) {
            debug!(task_id = %task_id, connection = %previous.id(), "replacing existing connection");
            previous.disconnect();
        }
        let connection = StreamConnection::open_with_hook(
            task_id.clone(),
            self.inner.source.clone(),
            self.inner.parser.clone(),
            self.inner.buffer_capacity,
            handler,
            Some(evict_on_close(Arc::downgrade(&self.inner), task_id.clone())),
        );
        // A concurrent connect for the same id may have slipped in.
        if let Some(displaced) = self
            .inner
            .connections
            .insert(task_id.clone(), connection.clone())
        {
            displaced.disconnect();
        }
        // Closed before it was inserted: its eviction found nothing to remove.
        if connection.is_closed() {
            let id = connection.id();
            self.inner
                .connections
                .remove_if(&task_id, |_, current| current.id() == id);
        }
        connection
    }

    /// Disconnects and forgets the connection for `task_id`. Returns false
    /// when none was registered.
    pub fn disconnect(&self, task_id: &TaskId) -> bool {
        match self.inner.connections.remove(task_id) {
            Some((_, connection)) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    /// Disconnects every registered connection and returns how many were removed.
    pub fn disconnect_all(&self) -> usize {
        let task_ids: Vec<TaskId> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let removed = task_ids.iter().filter(|id| self.disconnect(id)).count();
        info!(removed, "all stream connections disconnected");
        removed
    }

    /// True when a connection for `task_id` is registered and not closed.
    pub fn has(&self, task_id: &TaskId) -> bool {
        self.inner
            .connections
            .get(task_id)
            .is_some_and(|connection| !connection.is_closed())
    }

    pub fn connection(&self, task_id: &TaskId) -> Option<StreamConnection> {
        self.inner
            .connections
            .get(task_id)
            .map(|connection| connection.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }
}

fn evict_on_close(inner: Weak<RegistryInner>, task_id: TaskId) -> CloseHook {
    Box::new(move |closed_id: ConnectionId| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        // Only the connection that closed may remove itself; a replacement stays.
        if inner
            .connections
            .remove_if(&task_id, |_, current| current.id() == closed_id)
            .is_some()
        {
            debug!(task_id = %task_id, connection = %closed_id, "evicted closed connection");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ChannelHandler, StreamNotice};
    use crate::errors::StreamError;
    use crate::event::TaskEvent;
    use crate::testing::{FakeSource, chunk, drain, next, send};
    use std::sync::Mutex;

    fn registry(source: &Arc<FakeSource>) -> StreamRegistry {
        let source: Arc<dyn EventSource> = source.clone();
        StreamRegistry::new(source, &StreamConfig::default())
    }

    #[tokio::test]
    async fn second_connect_replaces_first() {
        let source = Arc::new(FakeSource::default());
        let first_feed = source.feed();
        let _second_feed = source.feed();
        let registry = registry(&source);
        let task = TaskId::new("t1");

        let (first_handler, mut first_rx) = ChannelHandler::new();
        let first = registry.connect(task.clone(), first_handler);
        assert!(matches!(next(&mut first_rx).await, StreamNotice::Connected { .. }));
        let (second_handler, mut second_rx) = ChannelHandler::new();
        let second = registry.connect(task.clone(), second_handler);
        assert!(matches!(next(&mut second_rx).await, StreamNotice::Connected { .. }));

        assert!(first.is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.connection(&task).map(|c| c.id()), Some(second.id()));
        assert!(registry.has(&task));

        let _ = first_feed.unbounded_send(Ok(crate::transport::TransportMessage::data(chunk(
            "m1", "stale",
        ))));
        let stale: Vec<StreamNotice> = drain(&mut first_rx)
            .await
            .into_iter()
            .filter(|n| matches!(n, StreamNotice::Event { .. }))
            .collect();
        assert!(stale.is_empty());
        assert_eq!(source.opens(), 2);
    }

    #[tokio::test]
    async fn completed_connection_evicts_itself() {
        let source = Arc::new(FakeSource::default());
        let feed = source.feed();
        let registry = registry(&source);
        let task = TaskId::new("t1");
        let (handler, mut rx) = ChannelHandler::new();
        let connection = registry.connect(task.clone(), handler);

        send(&feed, "[DONE]");
        let notices = drain(&mut rx).await;
        assert!(matches!(notices.last(), Some(StreamNotice::Completed { .. })));
        connection.closed().await;
        assert!(!registry.has(&task));
        assert!(registry.is_empty());
        assert!(!registry.disconnect(&task));
    }

    #[tokio::test]
    async fn failed_open_evicts_itself() {
        let source = Arc::new(FakeSource::default());
        let registry = registry(&source);
        let task = TaskId::new("t1");
        let (handler, mut rx) = ChannelHandler::new();
        let connection = registry.connect(task.clone(), handler);

        assert!(matches!(
            next(&mut rx).await,
            StreamNotice::Error { error: StreamError::Open { .. }, .. }
        ));
        connection.closed().await;
        assert!(registry.is_empty());
    }

    /// Reconnects from inside `on_completed`, like a view re-rendering.
    struct Reconnector {
        registry: StreamRegistry,
        replacement: Mutex<Option<Arc<dyn StreamHandler>>>,
        events: Mutex<Vec<TaskEvent>>,
    }

    impl StreamHandler for Reconnector {
        fn on_event(&self, _task_id: &TaskId, event: TaskEvent) {
            self.events.lock().expect("events").push(event);
        }

        fn on_error(&self, _task_id: &TaskId, _error: StreamError) {}

        fn on_completed(&self, task_id: &TaskId) {
            if let Some(handler) = self.replacement.lock().expect("replacement").take() {
                self.registry.connect(task_id.clone(), handler);
            }
        }
    }

    #[tokio::test]
    async fn reconnect_from_completion_callback_keeps_replacement() {
        let source = Arc::new(FakeSource::default());
        let first_feed = source.feed();
        let _second_feed = source.feed();
        let registry = registry(&source);
        let task = TaskId::new("t1");
        let (replacement, mut replacement_rx) = ChannelHandler::new();
        let replacement: Arc<dyn StreamHandler> = replacement;
        let handler = Arc::new(Reconnector {
            registry: registry.clone(),
            replacement: Mutex::new(Some(replacement)),
            events: Mutex::new(Vec::new()),
        });

        let first = registry.connect(task.clone(), handler.clone());
        send(&first_feed, format!("{}\n\n[DONE]", chunk("m1", "a")));
        first.closed().await;

        assert!(matches!(
            next(&mut replacement_rx).await,
            StreamNotice::Connected { .. }
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.has(&task));
        assert_ne!(registry.connection(&task).map(|c| c.id()), Some(first.id()));
        assert_eq!(handler.events.lock().expect("events").len(), 1);
    }

    #[tokio::test]
    async fn disconnect_all_tolerates_closed_connections() {
        let source = Arc::new(FakeSource::default());
        let _feed_a = source.feed();
        let _feed_b = source.feed();
        let registry = registry(&source);
        let (handler, _rx) = ChannelHandler::new();
        let a = registry.connect(TaskId::new("a"), handler.clone());
        let b = registry.connect(TaskId::new("b"), handler);

        // Closed through its own handle; its eviction already ran.
        assert!(a.disconnect());
        assert!(!registry.has(&TaskId::new("a")));

        assert_eq!(registry.disconnect_all(), 1);
        assert!(b.is_closed());
        assert!(registry.is_empty());
        assert_eq!(registry.disconnect_all(), 0);
    }
}
