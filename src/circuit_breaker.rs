//! Usage: Per-provider circuit breaker (closed -> open -> half-open) guarding upstream calls.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_OPEN_DURATION_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_duration_secs: DEFAULT_OPEN_DURATION_SECS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_secs)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<Instant>,
    pub last_transition_at: Instant,
    /// Earliest instant a trial call may pass; only set while open.
    pub open_until: Option<Instant>,
    pub trial_in_flight: bool,
}

impl CircuitSnapshot {
    pub fn open_remaining(&self, now: Instant) -> Option<Duration> {
        self.open_until.map(|until| until.saturating_duration_since(now))
    }
}

#[derive(Debug, Clone)]
pub struct CircuitTransition {
    pub prev_state: CircuitState,
    pub next_state: CircuitState,
    pub reason: &'static str,
    pub snapshot: CircuitSnapshot,
}

#[derive(Debug, Clone)]
pub struct CircuitChange {
    pub before: CircuitSnapshot,
    pub after: CircuitSnapshot,
    pub transition: Option<CircuitTransition>,
}

#[derive(Debug, Clone)]
pub struct CircuitCheck {
    pub allow: bool,
    /// Set when this admission is the half-open trial; identifies it among later trials.
    pub trial: Option<u64>,
    pub after: CircuitSnapshot,
    pub transition: Option<CircuitTransition>,
}

/// Outcome of [`CircuitBreaker::execute`] when the operation did not produce a value.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker refused the call; the operation was never invoked.
    Rejected(CircuitSnapshot),
    /// The operation ran and failed; the failure has been recorded.
    Failed(E),
}

#[derive(Debug)]
struct BreakerHealth {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_transition_at: Instant,
    trial_in_flight: bool,
    trial_seq: u64,
}

/// Who is reporting an outcome.
#[derive(Debug, Clone, Copy)]
enum Reporter {
    /// Low-level caller driving the breaker by hand; a half-open outcome is the trial's.
    Direct,
    /// A call admitted by `execute`, carrying its trial tag if it was the trial.
    Admitted(Option<u64>),
}

impl Reporter {
    fn is_current_trial(self, health: &BreakerHealth) -> bool {
        match self {
            Self::Direct => true,
            Self::Admitted(trial) => trial == Some(health.trial_seq),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    health: Mutex<BreakerHealth>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            ..config
        };
        Self {
            name: name.into(),
            config,
            health: Mutex::new(BreakerHealth {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                last_transition_at: Instant::now(),
                trial_in_flight: false,
                trial_seq: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Runs `operation` if the breaker admits it and records the outcome.
    ///
    /// The lock is held only for the admission check and for the outcome write; the
    /// operation itself runs unlocked so concurrent calls do not queue behind each other.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let check = self.should_allow(Instant::now());
        if let Some(t) = check.transition.as_ref() {
            self.log_transition(t);
        }
        if !check.allow {
            tracing::debug!(
                provider = %self.name,
                state = check.after.state.as_str(),
                "circuit rejected call"
            );
            return Err(BreakerError::Rejected(check.after));
        }

        let reporter = Reporter::Admitted(check.trial);
        let mut guard = AdmittedCall {
            breaker: self,
            trial: check.trial,
            armed: true,
        };
        let result = operation().await;
        guard.disarm();

        let change = match &result {
            Ok(_) => self.record_success_from(Instant::now(), reporter),
            Err(_) => self.record_failure_from(Instant::now(), reporter),
        };
        if let Some(t) = change.transition.as_ref() {
            self.log_transition(t);
        }

        result.map_err(BreakerError::Failed)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let guard = self.lock_health();
        self.snapshot_from_health(&guard)
    }

    pub fn should_allow(&self, now: Instant) -> CircuitCheck {
        let mut guard = self.lock_health();
        let mut transition = None;
        let mut trial = None;

        let allow = match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = now.saturating_duration_since(guard.last_transition_at);
                if elapsed >= self.config.open_duration() {
                    guard.state = CircuitState::HalfOpen;
                    guard.last_transition_at = now;
                    trial = Some(Self::start_trial(&mut guard));
                    transition = Some(CircuitTransition {
                        prev_state: CircuitState::Open,
                        next_state: CircuitState::HalfOpen,
                        reason: "OPEN_EXPIRED",
                        snapshot: self.snapshot_from_health(&guard),
                    });
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if guard.trial_in_flight {
                    false
                } else {
                    trial = Some(Self::start_trial(&mut guard));
                    true
                }
            }
        };

        CircuitCheck {
            allow,
            trial,
            after: self.snapshot_from_health(&guard),
            transition,
        }
    }

    /// Records a success. In half-open this is taken as the trial's outcome.
    pub fn record_success(&self, now: Instant) -> CircuitChange {
        self.record_success_from(now, Reporter::Direct)
    }

    /// Records a failure. In half-open this is taken as the trial's outcome.
    pub fn record_failure(&self, now: Instant) -> CircuitChange {
        self.record_failure_from(now, Reporter::Direct)
    }

    fn record_success_from(&self, now: Instant, reporter: Reporter) -> CircuitChange {
        let mut guard = self.lock_health();
        let before = self.snapshot_from_health(&guard);
        let mut transition = None;

        match guard.state {
            CircuitState::Closed => {
                guard.failure_count = 0;
            }
            CircuitState::HalfOpen if !reporter.is_current_trial(&guard) => {
                tracing::debug!(provider = %self.name, "stale success ignored while half-open");
            }
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Closed;
                guard.failure_count = 0;
                guard.trial_in_flight = false;
                guard.last_transition_at = now;
                transition = Some(CircuitTransition {
                    prev_state: CircuitState::HalfOpen,
                    next_state: CircuitState::Closed,
                    reason: "TRIAL_SUCCEEDED",
                    snapshot: self.snapshot_from_health(&guard),
                });
            }
            // Late outcomes from calls admitted before the trip do not move an open circuit.
            CircuitState::Open => {}
        }

        CircuitChange {
            before,
            after: self.snapshot_from_health(&guard),
            transition,
        }
    }

    fn record_failure_from(&self, now: Instant, reporter: Reporter) -> CircuitChange {
        let mut guard = self.lock_health();
        let before = self.snapshot_from_health(&guard);
        let mut transition = None;

        match guard.state {
            CircuitState::Closed => {
                guard.failure_count = guard.failure_count.saturating_add(1);
                guard.last_failure_at = Some(now);
                if guard.failure_count >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.last_transition_at = now;
                    transition = Some(CircuitTransition {
                        prev_state: CircuitState::Closed,
                        next_state: CircuitState::Open,
                        reason: "FAILURE_THRESHOLD_REACHED",
                        snapshot: self.snapshot_from_health(&guard),
                    });
                }
            }
            CircuitState::HalfOpen if !reporter.is_current_trial(&guard) => {
                tracing::debug!(provider = %self.name, "stale failure ignored while half-open");
            }
            CircuitState::HalfOpen => {
                guard.failure_count = guard.failure_count.saturating_add(1);
                guard.last_failure_at = Some(now);
                guard.state = CircuitState::Open;
                guard.trial_in_flight = false;
                guard.last_transition_at = now;
                transition = Some(CircuitTransition {
                    prev_state: CircuitState::HalfOpen,
                    next_state: CircuitState::Open,
                    reason: "TRIAL_FAILED",
                    snapshot: self.snapshot_from_health(&guard),
                });
            }
            CircuitState::Open => {}
        }

        CircuitChange {
            before,
            after: self.snapshot_from_health(&guard),
            transition,
        }
    }

    /// Administrative override: force Closed with a zeroed failure count.
    pub fn reset(&self, now: Instant) -> CircuitChange {
        let mut guard = self.lock_health();
        let before = self.snapshot_from_health(&guard);
        let prev_state = guard.state;

        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.trial_in_flight = false;
        if prev_state != CircuitState::Closed {
            guard.last_transition_at = now;
        }

        let after = self.snapshot_from_health(&guard);
        drop(guard);

        let transition = (prev_state != CircuitState::Closed).then(|| CircuitTransition {
            prev_state,
            next_state: CircuitState::Closed,
            reason: "MANUAL_RESET",
            snapshot: after.clone(),
        });
        if let Some(t) = transition.as_ref() {
            self.log_transition(t);
        }

        CircuitChange {
            before,
            after,
            transition,
        }
    }

    /// A holder that panicked leaves plain counters behind, so the state stays usable.
    fn lock_health(&self) -> MutexGuard<'_, BreakerHealth> {
        self.health.lock().unwrap_or_else(|poisoned| {
            tracing::error!(provider = %self.name, "circuit state lock poisoned; recovered");
            self.health.clear_poison();
            poisoned.into_inner()
        })
    }

    fn start_trial(health: &mut BreakerHealth) -> u64 {
        health.trial_in_flight = true;
        health.trial_seq = health.trial_seq.wrapping_add(1);
        health.trial_seq
    }

    /// Frees the half-open trial slot when the trial call is dropped before it reports.
    fn release_abandoned_trial(&self, trial: u64) {
        let mut guard = self.lock_health();
        if guard.state == CircuitState::HalfOpen
            && guard.trial_in_flight
            && guard.trial_seq == trial
        {
            guard.trial_in_flight = false;
            tracing::debug!(provider = %self.name, "half-open trial abandoned; slot released");
        }
    }

    fn snapshot_from_health(&self, health: &BreakerHealth) -> CircuitSnapshot {
        let open_until = (health.state == CircuitState::Open)
            .then(|| health.last_transition_at + self.config.open_duration());
        CircuitSnapshot {
            state: health.state,
            failure_count: health.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_at: health.last_failure_at,
            last_transition_at: health.last_transition_at,
            open_until,
            trial_in_flight: health.trial_in_flight,
        }
    }

    fn log_transition(&self, t: &CircuitTransition) {
        if t.next_state == CircuitState::Open {
            tracing::warn!(
                provider = %self.name,
                from = t.prev_state.as_str(),
                to = t.next_state.as_str(),
                reason = t.reason,
                failure_count = t.snapshot.failure_count,
                failure_threshold = t.snapshot.failure_threshold,
                "circuit transition"
            );
        } else {
            tracing::info!(
                provider = %self.name,
                from = t.prev_state.as_str(),
                to = t.next_state.as_str(),
                reason = t.reason,
                "circuit transition"
            );
        }
    }
}

struct AdmittedCall<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
    armed: bool,
}

impl AdmittedCall<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if let (true, Some(trial)) = (self.armed, self.trial) {
            self.breaker.release_abandoned_trial(trial);
        }
    }
}
