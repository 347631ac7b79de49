//! Circuit breaker guarding a consumption loop's broker pulls.
//!
//! A circuit breaker monitors pulls and "opens" (stops polling) when receive
//! faults exceed a threshold, so a broker outage does not turn every
//! subscription into a hot retry loop.
//!
//! # States
//!
//! - **Closed**: Normal operation. Pulls proceed. Consecutive faults are counted.
//! - **Open**: Too many faults. No pulls until the cooldown elapses.
//! - **HalfOpen**: Cooldown elapsed. Exactly one trial pull is allowed; success
//!   closes the circuit, failure reopens it with a longer cooldown (capped).
//!
//! The breaker is owned by a single loop, so it is a plain state machine with
//! no locking; the loop publishes its state through the subscription status.
//!
//! # Example
//!
//! ```rust
//! use spider_bus_runtime::circuit_breaker::{Admission, CircuitBreakerConfig, PollCircuitBreaker, State};
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(2)
//!     .cooldown(Duration::from_secs(5))
//!     .build();
//! let mut breaker = PollCircuitBreaker::new(config);
//!
//! let now = Instant::now();
//! breaker.record_failure(now);
//! breaker.record_failure(now);
//! assert_eq!(breaker.state(), State::Open);
//! assert_eq!(breaker.admit(now), Admission::Wait(Duration::from_secs(5)));
//! ```

use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive faults before opening the circuit
    pub failure_threshold: u32,
    /// Initial time spent Open before the `HalfOpen` trial
    pub cooldown: Duration,
    /// Ceiling for the escalated cooldown
    pub max_cooldown: Duration,
    /// Cooldown growth factor after a failed trial
    pub cooldown_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(60),
            cooldown_multiplier: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            cooldown: None,
            max_cooldown: None,
            cooldown_multiplier: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<u32>,
    cooldown: Option<Duration>,
    max_cooldown: Option<Duration>,
    cooldown_multiplier: Option<f64>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens after this many consecutive faults.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the initial cooldown.
    ///
    /// How long to wait in Open state before trying `HalfOpen`.
    #[must_use]
    pub const fn cooldown(mut self, duration: Duration) -> Self {
        self.cooldown = Some(duration);
        self
    }

    /// Set the cooldown ceiling.
    #[must_use]
    pub const fn max_cooldown(mut self, duration: Duration) -> Self {
        self.max_cooldown = Some(duration);
        self
    }

    /// Set the cooldown growth factor applied after each failed trial.
    #[must_use]
    pub const fn cooldown_multiplier(mut self, multiplier: f64) -> Self {
        self.cooldown_multiplier = Some(multiplier);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold).max(1),
            cooldown: self.cooldown.unwrap_or(defaults.cooldown),
            max_cooldown: self.max_cooldown.unwrap_or(defaults.max_cooldown),
            cooldown_multiplier: self
                .cooldown_multiplier
                .unwrap_or(defaults.cooldown_multiplier),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, pulls proceed normally
    Closed,
    /// Circuit is open, no pulls until the cooldown elapses
    Open,
    /// Circuit is half-open, one trial pull in flight
    HalfOpen,
}

impl State {
    /// Gauge encoding used by the metrics exporter.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }

    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Whether the loop may pull right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Pull normally
    Proceed,
    /// Cooldown elapsed; this pull is the single `HalfOpen` trial
    Trial,
    /// Circuit open; sleep this long before asking again
    Wait(Duration),
}

/// State change reported back to the loop for logging and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// CLOSED -> OPEN after the failure threshold was reached
    Opened {
        /// Cooldown before the first trial
        cooldown: Duration,
    },
    /// HALF_OPEN -> OPEN after a failed trial
    Reopened {
        /// Escalated cooldown
        cooldown: Duration,
        /// Consecutive failed trials so far
        failed_trials: u32,
    },
    /// HALF_OPEN -> CLOSED after a successful trial
    Closed,
}

/// Circuit breaker for a single polling loop.
#[derive(Debug, Clone)]
pub struct PollCircuitBreaker {
    topic: String,
    config: CircuitBreakerConfig,
    state: State,
    consecutive_failures: u32,
    failed_trials: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl PollCircuitBreaker {
    /// Create a new, closed circuit breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            topic: String::new(),
            config,
            state: State::Closed,
            consecutive_failures: 0,
            failed_trials: 0,
            cooldown,
            opened_at: None,
        }
    }

    /// Attach the topic whose loop this breaker guards; it is logged with
    /// every transition.
    #[must_use]
    pub fn for_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Topic logged with transitions (empty if none was attached).
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the current state of the circuit breaker.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Consecutive faults recorded since the last success.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Consecutive failed `HalfOpen` trials since the circuit last closed.
    #[must_use]
    pub const fn failed_trials(&self) -> u32 {
        self.failed_trials
    }

    /// Cooldown that applies the next time the circuit is open.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Decide whether a pull may happen at `now`.
    ///
    /// An open circuit whose cooldown elapsed moves to `HalfOpen` and admits
    /// one trial.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            State::Closed => Admission::Proceed,
            State::HalfOpen => Admission::Trial,
            State::Open => {
                let opened_at = *self.opened_at.get_or_insert(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    tracing::info!(
                        topic = %self.topic,
                        cooldown_ms = self.cooldown.as_millis(),
                        "Circuit breaker transitioning OPEN -> HALF_OPEN"
                    );
                    self.state = State::HalfOpen;
                    Admission::Trial
                } else {
                    Admission::Wait(self.cooldown - elapsed)
                }
            }
        }
    }

    /// Handle a successful pull (with or without a message).
    pub fn record_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        match self.state {
            State::Closed => None,
            State::HalfOpen | State::Open => {
                tracing::info!(
                    topic = %self.topic,
                    failed_trials = self.failed_trials,
                    "Circuit breaker transitioning HALF_OPEN -> CLOSED"
                );
                self.state = State::Closed;
                self.failed_trials = 0;
                self.cooldown = self.config.cooldown;
                self.opened_at = None;
                Some(Transition::Closed)
            }
        }
    }

    /// Handle a failed pull.
    pub fn record_failure(&mut self, now: Instant) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        match self.state {
            State::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        topic = %self.topic,
                        failures = self.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    self.state = State::Open;
                    self.opened_at = Some(now);
                    Some(Transition::Opened {
                        cooldown: self.cooldown,
                    })
                } else {
                    None
                }
            }
            State::HalfOpen => {
                self.failed_trials = self.failed_trials.saturating_add(1);
                self.cooldown = self.escalated_cooldown();
                tracing::warn!(
                    topic = %self.topic,
                    failed_trials = self.failed_trials,
                    cooldown_ms = self.cooldown.as_millis(),
                    "Circuit breaker transitioning HALF_OPEN -> OPEN (recovery failed)"
                );
                self.state = State::Open;
                self.opened_at = Some(now);
                Some(Transition::Reopened {
                    cooldown: self.cooldown,
                    failed_trials: self.failed_trials,
                })
            }
            State::Open => {
                // A pull slipped through while open; restart the cooldown.
                self.opened_at = Some(now);
                None
            }
        }
    }

    fn escalated_cooldown(&self) -> Duration {
        let next = self.cooldown.as_secs_f64() * self.config.cooldown_multiplier;
        if !next.is_finite() || next >= self.config.max_cooldown.as_secs_f64() {
            self.config.max_cooldown
        } else {
            Duration::from_secs_f64(next.max(0.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> PollCircuitBreaker {
        PollCircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .cooldown(Duration::from_secs(2))
                .max_cooldown(Duration::from_secs(5))
                .cooldown_multiplier(2.0)
                .build(),
        )
    }

    #[test]
    fn test_circuit_breaker_carries_topic() {
        let mut breaker = breaker(1).for_topic("agent-requests");
        let now = Instant::now();

        assert_eq!(breaker.topic(), "agent-requests");
        assert!(matches!(
            breaker.record_failure(now),
            Some(Transition::Opened { .. })
        ));
        assert_eq!(breaker.topic(), "agent-requests");
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_circuit_breaker_closed_on_success() {
        let mut breaker = breaker(3);
        let now = Instant::now();

        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.record_success(), None);

        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.admit(now), Admission::Proceed);
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let mut breaker = breaker(3);
        let now = Instant::now();

        assert_eq!(breaker.record_failure(now), None);
        assert_eq!(breaker.record_failure(now), None);
        assert_eq!(
            breaker.record_failure(now),
            Some(Transition::Opened {
                cooldown: Duration::from_secs(2)
            })
        );

        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_circuit_breaker_waits_while_open() {
        let mut breaker = breaker(1);
        let now = Instant::now();
        breaker.record_failure(now);

        assert_eq!(
            breaker.admit(now + Duration::from_millis(500)),
            Admission::Wait(Duration::from_millis(1500))
        );
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_circuit_breaker_transitions_to_half_open() {
        let mut breaker = breaker(1);
        let now = Instant::now();
        breaker.record_failure(now);

        assert_eq!(breaker.admit(now + Duration::from_secs(2)), Admission::Trial);
        assert_eq!(breaker.state(), State::HalfOpen);
    }

    #[test]
    fn test_circuit_breaker_closes_after_successful_trial() {
        let mut breaker = breaker(1);
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.admit(now + Duration::from_secs(2));

        assert_eq!(breaker.record_success(), Some(Transition::Closed));
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.failed_trials(), 0);
    }

    #[test]
    fn test_circuit_breaker_reopens_with_escalated_cooldown() {
        let mut breaker = breaker(1);
        let mut now = Instant::now();
        breaker.record_failure(now);

        now += Duration::from_secs(2);
        breaker.admit(now);
        assert_eq!(
            breaker.record_failure(now),
            Some(Transition::Reopened {
                cooldown: Duration::from_secs(4),
                failed_trials: 1,
            })
        );
        assert_eq!(breaker.state(), State::Open);

        now += Duration::from_secs(4);
        assert_eq!(breaker.admit(now), Admission::Trial);
        assert_eq!(
            breaker.record_failure(now),
            Some(Transition::Reopened {
                cooldown: Duration::from_secs(5),
                failed_trials: 2,
            })
        );
    }

    #[test]
    fn test_circuit_breaker_success_resets_cooldown() {
        let mut breaker = breaker(1);
        let mut now = Instant::now();
        breaker.record_failure(now);
        now += Duration::from_secs(2);
        breaker.admit(now);
        breaker.record_failure(now);
        assert_eq!(breaker.cooldown(), Duration::from_secs(4));

        now += Duration::from_secs(4);
        breaker.admit(now);
        breaker.record_success();

        assert_eq!(breaker.cooldown(), Duration::from_secs(2));
    }

    #[test]
    fn test_state_gauge_encoding() {
        for state in [State::Closed, State::HalfOpen, State::Open] {
            assert_eq!(State::from_u8(state.as_u8()), state);
        }
        assert!((State::Open.as_gauge() - 2.0).abs() < f64::EPSILON);
    }
}
