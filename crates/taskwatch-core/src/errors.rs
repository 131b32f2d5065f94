use crate::model::TaskId;

/// Error reported by an `EventSource` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable description of the failure.
    pub message: String,
    /// Whether the transport is closed and will yield nothing further.
    pub terminal: bool,
}

impl TransportError {
    /// Creates an error after which the transport is closed.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: true,
        }
    }

    /// Creates an error the transport recovers from on its own.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: false,
        }
    }
}

/// Errors surfaced through `StreamHandler::on_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The event source could not be opened.
    #[error("failed to open event stream for task {task_id}: {message}")]
    Open { task_id: TaskId, message: String },
    /// The transport reported a failure while streaming.
    #[error("transport error for task {task_id}: {message}")]
    Transport {
        task_id: TaskId,
        message: String,
        terminal: bool,
    },
    /// The transport ended without sending a completion marker.
    #[error("event stream for task {task_id} closed before completion")]
    ClosedBeforeCompletion { task_id: TaskId },
}

impl StreamError {
    pub(crate) fn from_transport(task_id: &TaskId, err: TransportError) -> Self {
        Self::Transport {
            task_id: task_id.clone(),
            message: err.message,
            terminal: err.terminal,
        }
    }

    /// Returns the task whose stream failed.
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Open { task_id, .. }
            | Self::Transport { task_id, .. }
            | Self::ClosedBeforeCompletion { task_id } => task_id,
        }
    }

    /// Returns true when the connection is closed after this error.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Transport { terminal, .. } => *terminal,
            Self::Open { .. } | Self::ClosedBeforeCompletion { .. } => true,
        }
    }
}

/// Failure of a request/response call to the task backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Backend answered with a non-success status.
    #[error("request failed with status {status}: {message}")]
    Http { status: u16, message: String },
    /// Request could not be sent or the body could not be read.
    #[error("transport error: {0}")]
    Transport(String),
    /// Body did not have the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors returned by `TracePoller` operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// No polling session is active.
    #[error("trace poller is not started")]
    NotStarted,
    /// The polling session was stopped or replaced before the tick finished.
    #[error("trace poll cancelled")]
    Cancelled,
    /// The span fetch failed; the span list was cleared.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Invalid or missing configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing {0}")]
    Missing(&'static str),
    /// A setting is present but unusable.
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }
}

/// Top-level error type for the public API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskwatchError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Trace(#[from] TraceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_terminal_flag_carries_into_stream_error() {
        let task = TaskId::new("t1");
        let transient = StreamError::from_transport(&task, TransportError::transient("hiccup"));
        let terminal = StreamError::from_transport(&task, TransportError::terminal("reset"));
        assert!(!transient.is_terminal());
        assert!(terminal.is_terminal());
        assert_eq!(terminal.task_id(), &task);
    }

    #[test]
    fn open_and_early_close_are_terminal() {
        let task = TaskId::new("t1");
        assert!(
            StreamError::Open {
                task_id: task.clone(),
                message: "refused".into()
            }
            .is_terminal()
        );
        assert!(StreamError::ClosedBeforeCompletion { task_id: task }.is_terminal());
    }
}
