use std::sync::Arc;

use crate::config::TaskwatchConfig;
use crate::connection::StreamHandler;
use crate::errors::TaskwatchError;
use crate::model::TaskId;
use crate::reconnect::{SupervisedStream, supervise};
use crate::registry::StreamRegistry;
use crate::trace::TracePoller;
use crate::transport::{EventSource, HttpEventSource, HttpTraceApi, TraceApi};

/// Wires the engine components to one backend.
///
/// Cloning is cheap; clones share the registry and the trace poller.
#[derive(Clone)]
pub struct Taskwatch {
    config: Arc<TaskwatchConfig>,
    registry: StreamRegistry,
    poller: TracePoller,
}

impl Taskwatch {
    /// Validates `config` and builds the HTTP collaborators from it.
    pub fn new(config: TaskwatchConfig) -> Result<Self, TaskwatchError> {
        config.validate()?;
        let source: Arc<dyn EventSource> = Arc::new(
            HttpEventSource::new(config.api.clone())?
                .frame_separator(config.stream.frame_separator.clone()),
        );
        let api: Arc<dyn TraceApi> = Arc::new(HttpTraceApi::new(config.api.clone())?);
        Ok(Self::with_collaborators(config, source, api))
    }

    /// Builds from `TASKWATCH_*` environment variables.
    pub fn from_env() -> Result<Self, TaskwatchError> {
        Self::new(TaskwatchConfig::from_env()?)
    }

    /// Uses caller-supplied collaborators instead of the HTTP ones.
    pub fn with_collaborators(
        config: TaskwatchConfig,
        source: Arc<dyn EventSource>,
        api: Arc<dyn TraceApi>,
    ) -> Self {
        let registry = StreamRegistry::new(source, &config.stream);
        let poller = TracePoller::new(api, config.trace.clone());
        Self {
            config: Arc::new(config),
            registry,
            poller,
        }
    }

    pub fn config(&self) -> &TaskwatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn trace_poller(&self) -> &TracePoller {
        &self.poller
    }

    /// Streams `task_id` with the configured reconnect policy.
    pub fn supervise(&self, task_id: TaskId, handler: Arc<dyn StreamHandler>) -> SupervisedStream {
        supervise(
            self.registry.clone(),
            task_id,
            handler,
            self.config.reconnect.clone(),
        )
    }

    /// Disconnects every stream and stops trace polling.
    pub fn shutdown(&self) {
        self.registry.disconnect_all();
        self.poller.stop();
    }
}
