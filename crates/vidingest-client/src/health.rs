//! Connection health monitoring for active streams.
//!
//! Each stream owns a [`StreamHealth`] fed with acks and buffer-duration
//! reports. A [`ConnectionHealthMonitor`] samples every registered stream on
//! an interval, escalates staleness and latency pressure, raises the
//! matching stream events and recycles upload sessions through the stream's
//! controller.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vidingest_auth::time::{duration_to_units, units_to_duration};
use vidingest_auth::Timestamp;

use crate::provider::CallbacksProvider;
use crate::service::UploadHandle;
use crate::state_machine::StreamController;

/// Default spacing between latency escalation steps.
pub const HEALTH_QUIET_PERIOD: Duration = Duration::from_secs(30);
/// Default breach-free time before a machine resets.
pub const HEALTH_BACK_TO_NORMAL_PERIOD: Duration = Duration::from_secs(60);

const STALE_NORMAL: u8 = 0;
const STALE_RESET_CONNECTION: u8 = 1;

const LATENCY_NORMAL: u8 = 0;
const LATENCY_RESET_CONNECTION: u8 = 1;
const LATENCY_THROTTLE_PIPELINE: u8 = 2;
const LATENCY_INFINITE_RETRY: u8 = 3;

/// Escalation state for a connection without acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleState {
    /// Acks are arriving.
    #[default]
    Normal,
    /// A recycle was issued; waiting out the back-to-normal period.
    ResetConnection,
}

impl From<u8> for StaleState {
    fn from(raw: u8) -> Self {
        match raw {
            STALE_RESET_CONNECTION => StaleState::ResetConnection,
            _ => StaleState::Normal,
        }
    }
}

impl From<StaleState> for u8 {
    fn from(state: StaleState) -> Self {
        match state {
            StaleState::Normal => STALE_NORMAL,
            StaleState::ResetConnection => STALE_RESET_CONNECTION,
        }
    }
}

/// Escalation state for buffered latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyState {
    /// Buffered duration is under the ceiling.
    #[default]
    Normal,
    /// The session was recycled once.
    ResetConnection,
    /// The host was asked to throttle.
    ThrottlePipeline,
    /// Recycle on every quiet period until pressure clears.
    InfiniteRetry,
}

impl From<u8> for LatencyState {
    fn from(raw: u8) -> Self {
        match raw {
            LATENCY_RESET_CONNECTION => LatencyState::ResetConnection,
            LATENCY_THROTTLE_PIPELINE => LatencyState::ThrottlePipeline,
            LATENCY_INFINITE_RETRY => LatencyState::InfiniteRetry,
            _ => LatencyState::Normal,
        }
    }
}

impl From<LatencyState> for u8 {
    fn from(state: LatencyState) -> Self {
        match state {
            LatencyState::Normal => LATENCY_NORMAL,
            LatencyState::ResetConnection => LATENCY_RESET_CONNECTION,
            LatencyState::ThrottlePipeline => LATENCY_THROTTLE_PIPELINE,
            LatencyState::InfiniteRetry => LATENCY_INFINITE_RETRY,
        }
    }
}

/// Timing of the health monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Sampling interval (default: 1 second).
    pub sample_interval: Duration,
    /// Minimum spacing between escalation steps (default: 30 seconds).
    pub quiet_period: Duration,
    /// Breach-free time before returning to normal (default: 60 seconds).
    pub back_to_normal: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            quiet_period: HEALTH_QUIET_PERIOD,
            back_to_normal: HEALTH_BACK_TO_NORMAL_PERIOD,
        }
    }
}

/// Something the monitor decided to do for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Raise `connection_stale`.
    ConnectionStale {
        /// Time since the last ack or the session opening.
        since_last_ack: Duration,
    },
    /// Raise `latency_pressure`.
    LatencyPressure {
        /// Buffered duration that breached the ceiling.
        buffer_duration: Duration,
        /// Whether the host should slow production.
        throttle: bool,
    },
    /// Close the current session and open a new one.
    Recycle,
}

#[derive(Debug, Default)]
struct Escalation {
    stale_changed: Timestamp,
    latency_armed: bool,
    latency_quiet_until: Timestamp,
    latency_last_breach: Timestamp,
}

/// Health signals of one stream.
pub struct StreamHealth {
    stream_name: String,
    connection_staleness: Duration,
    max_latency: Duration,
    last_ack: AtomicU64,
    buffer_duration: AtomicU64,
    session: AtomicU64,
    stale_state: AtomicU8,
    latency_state: AtomicU8,
    escalation: Mutex<Escalation>,
}

impl StreamHealth {
    /// Fresh signals with the stream's thresholds.
    pub fn new(stream_name: impl Into<String>, connection_staleness: Duration, max_latency: Duration) -> Self {
        Self {
            stream_name: stream_name.into(),
            connection_staleness,
            max_latency,
            last_ack: AtomicU64::new(0),
            buffer_duration: AtomicU64::new(0),
            session: AtomicU64::new(0),
            stale_state: AtomicU8::new(STALE_NORMAL),
            latency_state: AtomicU8::new(LATENCY_NORMAL),
            escalation: Mutex::new(Escalation::default()),
        }
    }

    /// Name of the monitored stream.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Mark `session` open. Staleness is measured from `now` until the
    /// first ack arrives.
    pub fn open_session(&self, session: UploadHandle, now: Timestamp) {
        self.last_ack.store(now.as_hundreds_of_nanos(), Ordering::Release);
        self.session.store(session.0, Ordering::Release);
    }

    /// Mark the session closed.
    pub fn close_session(&self) {
        self.session.store(0, Ordering::Release);
    }

    /// The open session, if any.
    pub fn session(&self) -> Option<UploadHandle> {
        match self.session.load(Ordering::Acquire) {
            0 => None,
            id => Some(UploadHandle(id)),
        }
    }

    /// Uploading with an open session.
    pub fn is_ready(&self) -> bool {
        self.session().is_some()
    }

    /// Record an ack received at `now`.
    pub fn record_ack(&self, now: Timestamp) {
        self.last_ack.fetch_max(now.as_hundreds_of_nanos(), Ordering::AcqRel);
    }

    /// Time of the newest ack, or of the session opening.
    pub fn last_ack(&self) -> Timestamp {
        Timestamp::from_hundreds_of_nanos(self.last_ack.load(Ordering::Acquire))
    }

    /// Record the duration currently buffered and unacknowledged.
    pub fn record_buffer_duration(&self, duration: Duration) {
        self.buffer_duration
            .store(duration_to_units(duration), Ordering::Release);
    }

    /// Last reported buffered duration.
    pub fn buffer_duration(&self) -> Duration {
        units_to_duration(self.buffer_duration.load(Ordering::Acquire))
    }

    /// Current staleness state.
    pub fn stale_state(&self) -> StaleState {
        StaleState::from(self.stale_state.load(Ordering::Acquire))
    }

    /// Current latency state.
    pub fn latency_state(&self) -> LatencyState {
        LatencyState::from(self.latency_state.load(Ordering::Acquire))
    }

    /// Run both escalation machines for one sample.
    pub fn evaluate(&self, now: Timestamp, config: &HealthConfig) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        let ready = self.is_ready();
        let mut escalation = self.escalation.lock();

        match self.stale_state() {
            StaleState::Normal => {
                let since_last_ack = now.duration_since(self.last_ack());
                if ready && since_last_ack > self.connection_staleness {
                    actions.push(HealthAction::ConnectionStale { since_last_ack });
                    actions.push(HealthAction::Recycle);
                    escalation.stale_changed = now;
                    self.stale_state
                        .store(StaleState::ResetConnection.into(), Ordering::Release);
                }
            }
            StaleState::ResetConnection => {
                if now.duration_since(escalation.stale_changed) >= config.back_to_normal {
                    self.stale_state
                        .store(StaleState::Normal.into(), Ordering::Release);
                }
            }
        }

        let buffer_duration = self.buffer_duration();
        if buffer_duration > self.max_latency {
            escalation.latency_last_breach = now;
            if !escalation.latency_armed {
                escalation.latency_armed = true;
                escalation.latency_quiet_until = now.saturating_add(config.quiet_period);
                actions.push(HealthAction::LatencyPressure {
                    buffer_duration,
                    throttle: false,
                });
            } else if now >= escalation.latency_quiet_until {
                escalation.latency_quiet_until = now.saturating_add(config.quiet_period);
                let next = match self.latency_state() {
                    LatencyState::Normal => {
                        actions.push(HealthAction::Recycle);
                        LatencyState::ResetConnection
                    }
                    LatencyState::ResetConnection => {
                        actions.push(HealthAction::LatencyPressure {
                            buffer_duration,
                            throttle: true,
                        });
                        LatencyState::ThrottlePipeline
                    }
                    LatencyState::ThrottlePipeline | LatencyState::InfiniteRetry => {
                        actions.push(HealthAction::Recycle);
                        LatencyState::InfiniteRetry
                    }
                };
                self.latency_state.store(next.into(), Ordering::Release);
            }
        } else if escalation.latency_armed
            && now.duration_since(escalation.latency_last_breach) >= config.back_to_normal
        {
            escalation.latency_armed = false;
            self.latency_state
                .store(LatencyState::Normal.into(), Ordering::Release);
        }

        drop(escalation);
        let mut recycle_kept = false;
        actions.retain(|action| {
            if *action != HealthAction::Recycle {
                return true;
            }
            let keep = ready && !recycle_kept;
            recycle_kept |= keep;
            keep
        });
        actions
    }
}

/// Samples every registered stream and acts on breaches.
pub struct ConnectionHealthMonitor {
    config: HealthConfig,
    provider: Arc<CallbacksProvider>,
    streams: DashMap<String, StreamController>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHealthMonitor {
    /// Monitor with no streams; call `start` to begin sampling.
    pub fn new(provider: Arc<CallbacksProvider>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            streams: DashMap::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Timings in effect.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start sampling `controller`'s stream.
    pub fn register(&self, controller: StreamController) {
        debug!(stream = %controller.name(), "health monitoring stream");
        self.streams.insert(controller.name().to_string(), controller);
    }

    /// Stop sampling the named stream.
    pub fn unregister(&self, stream_name: &str) {
        self.streams.remove(stream_name);
    }

    /// Number of streams sampled.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// One sampling pass. Returns the number of actions taken.
    ///
    /// Decisions are collected first; events and recycles run after every
    /// registry guard is dropped, so handlers may call back into the stream
    /// or the monitor.
    pub fn sample(&self) -> usize {
        let now = self.provider.current_time();
        let pending: Vec<(StreamController, Vec<HealthAction>)> = self
            .streams
            .iter()
            .filter_map(|entry| {
                let controller = entry.value();
                let actions = controller.health().evaluate(now, &self.config);
                (!actions.is_empty()).then(|| (controller.clone(), actions))
            })
            .collect();

        let mut taken = 0;
        for (controller, actions) in pending {
            for action in actions {
                taken += 1;
                self.apply(&controller, action);
            }
        }
        taken
    }

    fn apply(&self, controller: &StreamController, action: HealthAction) {
        let name = controller.name();
        let events = self.provider.stream_events();
        match action {
            HealthAction::ConnectionStale { since_last_ack } => {
                warn!(stream = %name, ?since_last_ack, "connection stale");
                events.connection_stale(name, since_last_ack);
            }
            HealthAction::LatencyPressure {
                buffer_duration,
                throttle,
            } => {
                warn!(stream = %name, ?buffer_duration, throttle, "latency pressure");
                events.latency_pressure(name, buffer_duration, throttle);
            }
            HealthAction::Recycle => {
                info!(stream = %name, "recycling upload session");
                controller.reset_connection();
            }
        }
    }

    /// Start the sampling task. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.sample_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.sample();
                    }
                }
            }
            debug!("health monitor stopped");
        }));
    }

    /// Cancel sampling and wait for the task to end.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
