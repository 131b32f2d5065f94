use std::time::Duration;

use crate::errors::ConfigError;
use crate::frame::FRAME_SEPARATOR;
use crate::model::{TaskId, TraceId};
use crate::reconnect::ReconnectConfig;

/// Location and credentials of the task backend.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Base URL, for example `https://tasks.example.com`.
    pub base_url: String,
    /// Optional bearer token.
    pub api_token: Option<String>,
    /// Timeout for request/response calls (task and span lookups).
    pub request_timeout: Duration,
    /// Timeout for establishing any connection, including the event stream.
    pub connect_timeout: Duration,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub(crate) fn task_url(&self, task_id: &TaskId) -> String {
        format!("{}/api/tasks/{task_id}", self.base())
    }

    pub(crate) fn events_url(&self, task_id: &TaskId) -> String {
        format!("{}/api/tasks/{task_id}/events", self.base())
    }

    pub(crate) fn spans_url(&self, task_id: &TaskId, trace_id: &TraceId) -> String {
        format!("{}/api/tasks/{task_id}/traces/{trace_id}/spans", self.base())
    }
}

/// Event stream settings.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Token separating frames batched into one transport message.
    pub frame_separator: String,
    /// Capacity of the channel between the transport reader and the dispatcher.
    pub buffer_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_separator: FRAME_SEPARATOR.to_string(),
            buffer_capacity: 128,
        }
    }
}

/// Trace polling cadence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracePollerConfig {
    /// Delay between the completion of one tick and the start of the next.
    pub interval: Duration,
    /// Minimum time between the starts of two fetches (manual refresh excepted).
    pub min_spacing: Duration,
}

impl Default for TracePollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            min_spacing: Duration::from_millis(1000),
        }
    }
}

impl TracePollerConfig {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn min_spacing(mut self, min_spacing: Duration) -> Self {
        self.min_spacing = min_spacing;
        self
    }
}

/// Complete client configuration.
#[derive(Clone, Debug)]
pub struct TaskwatchConfig {
    pub api: ApiConfig,
    pub stream: StreamConfig,
    pub trace: TracePollerConfig,
    pub reconnect: ReconnectConfig,
}

impl TaskwatchConfig {
    /// Creates a config with defaults for everything but the backend location.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiConfig::new(base_url),
            stream: StreamConfig::default(),
            trace: TracePollerConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Builds a config from `TASKWATCH_*` environment variables.
    ///
    /// - `TASKWATCH_BASE_URL` (required)
    /// - `TASKWATCH_API_TOKEN`
    /// - `TASKWATCH_REQUEST_TIMEOUT_SECS`
    /// - `TASKWATCH_POLL_INTERVAL_MS`, `TASKWATCH_MIN_FETCH_SPACING_MS`
    /// - `TASKWATCH_STREAM_BUFFER`, `TASKWATCH_FRAME_SEPARATOR`
    /// - `TASKWATCH_RECONNECT_MAX_ATTEMPTS` (`0` means unlimited)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_url = get("TASKWATCH_BASE_URL").ok_or(ConfigError::Missing("TASKWATCH_BASE_URL"))?;
        let mut config = Self::new(base_url.trim());
        if let Some(token) = get("TASKWATCH_API_TOKEN") {
            config.api.api_token = Some(token);
        }
        if let Some(raw) = get("TASKWATCH_REQUEST_TIMEOUT_SECS") {
            config.api.request_timeout =
                Duration::from_secs(parse_u64("TASKWATCH_REQUEST_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = get("TASKWATCH_POLL_INTERVAL_MS") {
            config.trace.interval =
                Duration::from_millis(parse_u64("TASKWATCH_POLL_INTERVAL_MS", &raw)?);
        }
        if let Some(raw) = get("TASKWATCH_MIN_FETCH_SPACING_MS") {
            config.trace.min_spacing =
                Duration::from_millis(parse_u64("TASKWATCH_MIN_FETCH_SPACING_MS", &raw)?);
        }
        if let Some(raw) = get("TASKWATCH_STREAM_BUFFER") {
            config.stream.buffer_capacity = parse_u64("TASKWATCH_STREAM_BUFFER", &raw)? as usize;
        }
        // Not filtered for blank values: whitespace separators are legitimate.
        if let Some(separator) = lookup("TASKWATCH_FRAME_SEPARATOR").filter(|v| !v.is_empty()) {
            config.stream.frame_separator = unescape(&separator);
        }
        if let Some(raw) = get("TASKWATCH_RECONNECT_MAX_ATTEMPTS") {
            let attempts = parse_u64("TASKWATCH_RECONNECT_MAX_ATTEMPTS", &raw)?;
            config.reconnect.max_attempts = (attempts > 0).then_some(attempts as u32);
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.api.base_url.trim();
        if base.is_empty() {
            return Err(ConfigError::Missing("TASKWATCH_BASE_URL"));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "TASKWATCH_BASE_URL",
                "must start with http:// or https://",
            ));
        }
        if self.stream.buffer_capacity == 0 {
            return Err(ConfigError::invalid(
                "TASKWATCH_STREAM_BUFFER",
                "must be greater than 0",
            ));
        }
        if self.trace.interval.is_zero() {
            return Err(ConfigError::invalid(
                "TASKWATCH_POLL_INTERVAL_MS",
                "must be greater than 0",
            ));
        }
        self.reconnect.validate()
    }
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::invalid(key, format!("{raw:?}: {e}")))
}

/// Env values cannot hold raw newlines comfortably; accept `\n` escapes.
fn unescape(raw: &str) -> String {
    raw.replace("\\n", "\n").replace("\\r", "\r").replace("\\t", "\t")
}
