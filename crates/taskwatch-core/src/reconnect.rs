//! Reconnection policy layered over [`StreamRegistry`].
//!
//! Connections never reconnect on their own. [`supervise`] wraps a handler,
//! watches for terminal errors and opens a fresh connection through the
//! registry after an exponential, jittered delay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{StreamConnection, StreamHandler, cancelled};
use crate::errors::{ConfigError, StreamError};
use crate::event::TaskEvent;
use crate::model::TaskId;
use crate::registry::StreamRegistry;

/// Backoff settings for supervised streams.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Relative random spread applied to each delay, in `0.0..=1.0`.
    pub jitter: f64,
    /// Reconnects allowed in a row without a successful connect; `None` is unlimited.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: Some(8),
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "reconnect.multiplier",
                "must be a finite number >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                "reconnect.jitter",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::invalid(
                "reconnect.max_delay",
                "must not be shorter than the initial delay",
            ));
        }
        Ok(())
    }
}

/// Exponential backoff with a cap and random jitter.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.config
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let exponent = self.attempts.min(62) as i32;
        let base = (self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent))
            .min(self.config.max_delay.as_secs_f64());
        self.attempts += 1;

        let spread = base * self.config.jitter;
        let delay = if spread > 0.0 {
            base + rng.gen_range(-spread..=spread)
        } else {
            base
        };
        Some(Duration::from_secs_f64(delay.max(0.0)))
    }
}

/// Why a supervised stream stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The task's stream sent its completion marker.
    Completed,
    /// [`SupervisedStream::stop`] was called.
    Stopped,
    /// Reconnects kept failing until `max_attempts` ran out.
    Exhausted { attempts: u32 },
    /// The connection was closed or replaced by someone else.
    Detached,
}

enum Signal {
    /// First event on a connection.
    Delivering,
    Lost,
    Completed,
}

/// Passes callbacks through and reports lifecycle to the supervisor.
struct SupervisedHandler {
    inner: Arc<dyn StreamHandler>,
    epoch: u64,
    delivered: AtomicBool,
    signals: mpsc::UnboundedSender<(u64, Signal)>,
}

impl SupervisedHandler {
    fn signal(&self, signal: Signal) {
        let _ = self.signals.send((self.epoch, signal));
    }
}

impl StreamHandler for SupervisedHandler {
    fn on_event(&self, task_id: &TaskId, event: TaskEvent) {
        self.inner.on_event(task_id, event);
        if !self.delivered.swap(true, Ordering::SeqCst) {
            self.signal(Signal::Delivering);
        }
    }

    fn on_error(&self, task_id: &TaskId, error: StreamError) {
        let terminal = error.is_terminal();
        self.inner.on_error(task_id, error);
        if terminal {
            self.signal(Signal::Lost);
        }
    }

    fn on_connected(&self, task_id: &TaskId) {
        self.inner.on_connected(task_id);
    }

    fn on_completed(&self, task_id: &TaskId) {
        self.inner.on_completed(task_id);
        self.signal(Signal::Completed);
    }
}

/// Handle to a supervised stream.
pub struct SupervisedStream {
    task_id: TaskId,
    registry: StreamRegistry,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<SupervisorExit>,
}

impl SupervisedStream {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// The connection currently registered for the task, if any.
    pub fn connection(&self) -> Option<StreamConnection> {
        self.registry.connection(&self.task_id)
    }

    /// Stops supervising and disconnects the current connection.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Waits for the supervisor to finish.
    pub async fn wait(self) -> SupervisorExit {
        match self.join.await {
            Ok(exit) => exit,
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "stream supervisor task failed");
                SupervisorExit::Stopped
            }
        }
    }
}

/// Streams `task_id` through `registry`, reconnecting after terminal errors.
///
/// The backoff resets once a connection delivers its first event; a server
/// that accepts and then drops the connection still uses up attempts.
/// Supervision ends
/// on completion, on [`SupervisedStream::stop`], when attempts run out, or
/// when the connection is closed from outside.
pub fn supervise(
    registry: StreamRegistry,
    task_id: TaskId,
    handler: Arc<dyn StreamHandler>,
    config: ReconnectConfig,
) -> SupervisedStream {
    let (stop_tx, stop_rx) = watch::channel(false);
    let join = tokio::spawn(run_supervisor(
        registry.clone(),
        task_id.clone(),
        handler,
        config,
        stop_rx,
    ));
    SupervisedStream {
        task_id,
        registry,
        stop_tx,
        join,
    }
}

async fn run_supervisor(
    registry: StreamRegistry,
    task_id: TaskId,
    handler: Arc<dyn StreamHandler>,
    config: ReconnectConfig,
    mut stop_rx: watch::Receiver<bool>,
) -> SupervisorExit {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let mut backoff = Backoff::new(config);
    let mut epoch = 0_u64;
    let connect = |epoch: u64| {
        registry.connect(
            task_id.clone(),
            Arc::new(SupervisedHandler {
                inner: handler.clone(),
                epoch,
                delivered: AtomicBool::new(false),
                signals: signal_tx.clone(),
            }),
        )
    };
    let mut connection = connect(epoch);
    info!(task_id = %task_id, "supervised stream started");

    loop {
        // Signals are sent before the connection reports closed, so they win.
        let signal = tokio::select! {
            biased;
            _ = cancelled(&mut stop_rx) => {
                connection.disconnect();
                info!(task_id = %task_id, "supervised stream stopped");
                return SupervisorExit::Stopped;
            }
            signal = signal_rx.recv() => signal,
            _ = connection.closed() => {
                info!(task_id = %task_id, connection = %connection.id(), "supervised connection closed externally");
                return SupervisorExit::Detached;
            }
        };
        let Some((signal_epoch, signal)) = signal else {
            return SupervisorExit::Stopped;
        };
        if signal_epoch != epoch {
            continue;
        }
        match signal {
            Signal::Delivering => {
                debug!(task_id = %task_id, "supervised stream delivering; backoff reset");
                backoff.reset();
            }
            Signal::Completed => {
                info!(task_id = %task_id, "supervised stream completed");
                return SupervisorExit::Completed;
            }
            Signal::Lost => {
                let Some(delay) = backoff.next_delay() else {
                    warn!(task_id = %task_id, attempts = backoff.attempts(), "giving up on stream reconnects");
                    return SupervisorExit::Exhausted {
                        attempts: backoff.attempts(),
                    };
                };
                info!(
                    task_id = %task_id,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting stream"
                );
                tokio::select! {
                    biased;
                    _ = cancelled(&mut stop_rx) => return SupervisorExit::Stopped,
                    _ = tokio::time::sleep(delay) => {}
                }
                epoch += 1;
                connection = connect(epoch);
            }
        }
    }
}
