//! Circuit breaker and detection-risk monitor for one crawl session.
//!
//! Trips on two independent signals: genuine failures (error rate over a
//! rolling window) and suspiciously fast successes (mean latency under a
//! floor, typical of cached or decoy pages served to a detected bot).
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[error rate | latency floor | blocked]--> OPEN --[timeout]--> HALF_OPEN (trials)
//!                                                                           |
//!                                           <--[trial failure]--            |
//!                                                                           |
//! CLOSED <-----------------------[all trials succeeded]---------------------+
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected without touching the network.
    Open,
    /// Circuit is half-open - a fixed number of trial requests are admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes kept in the rolling window.
    pub window_size: usize,

    /// Outcomes required in the window before the trip rules are evaluated.
    pub min_samples: usize,

    /// Error rate (0.0..=1.0) above which the circuit opens.
    pub error_rate_threshold: f64,

    /// Mean latency of successful responses below which the circuit opens.
    #[serde(with = "duration_ms", rename = "latency_floor_ms")]
    pub latency_floor: Duration,

    /// Time to wait before transitioning from Open to Half-Open.
    #[serde(with = "duration_ms", rename = "recovery_timeout_ms")]
    pub recovery_timeout: Duration,

    /// Trial requests admitted in Half-Open; all must succeed to close.
    pub half_open_trials: u32,

    /// When a blocking response (403/429) is seen, multiply the recovery timeout by this factor.
    pub blocked_backoff_multiplier: f32,

    /// Maximum recovery timeout after blocking backoffs.
    #[serde(with = "duration_ms", rename = "max_recovery_timeout_ms")]
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_samples: 8,
            error_rate_threshold: 0.15,
            latency_floor: Duration::from_millis(120),
            recovery_timeout: Duration::from_secs(60),
            half_open_trials: 2,
            blocked_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(600),
        }
    }
}

/// Why the circuit last opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    ErrorRate { rate: f64 },
    LatencyFloor { mean_ms: f64 },
    Blocked,
    TrialFailed,
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::ErrorRate { rate } => write!(f, "error rate {:.0}%", rate * 100.0),
            TripReason::LatencyFloor { mean_ms } => {
                write!(f, "mean latency {mean_ms:.0}ms under floor")
            }
            TripReason::Blocked => write!(f, "blocked response"),
            TripReason::TrialFailed => write!(f, "half-open trial failed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency: Duration,
}

/// Aggregates over the current rolling window.
#[derive(Debug, Clone, Copy, Default)]
struct WindowStats {
    samples: usize,
    errors: usize,
    latency_samples: usize,
    mean_latency: Option<Duration>,
    latency_stddev: Option<Duration>,
}

impl WindowStats {
    fn error_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.errors as f64 / self.samples as f64
        }
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    window: VecDeque<Sample>,
    window_start: DateTime<Utc>,
    request_count: u64,
    error_count: u64,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    trials_admitted: u32,
    trial_successes: u32,
    current_recovery_timeout: Duration,
    trips: u32,
    last_trip: Option<TripReason>,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(config.window_size),
            window_start: Utc::now(),
            request_count: 0,
            error_count: 0,
            opened_at: None,
            opened_at_utc: None,
            trials_admitted: 0,
            trial_successes: 0,
            current_recovery_timeout: config.recovery_timeout,
            trips: 0,
            last_trip: None,
        }
    }

    fn push(&mut self, sample: Sample, window_size: usize) {
        self.request_count += 1;
        if !sample.success {
            self.error_count += 1;
        }
        self.window.push_back(sample);
        while self.window.len() > window_size.max(1) {
            self.window.pop_front();
        }
    }

    fn stats(&self) -> WindowStats {
        let samples = self.window.len();
        let errors = self.window.iter().filter(|s| !s.success).count();
        let latencies: Vec<f64> = self
            .window
            .iter()
            .filter(|s| s.success)
            .map(|s| s.latency.as_secs_f64())
            .collect();

        let (mean_latency, latency_stddev) = if latencies.is_empty() {
            (None, None)
        } else {
            let n = latencies.len() as f64;
            let mean = latencies.iter().sum::<f64>() / n;
            let variance = latencies.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;
            (
                Some(Duration::from_secs_f64(mean)),
                Some(Duration::from_secs_f64(variance.sqrt())),
            )
        };

        WindowStats {
            samples,
            errors,
            latency_samples: latencies.len(),
            mean_latency,
            latency_stddev,
        }
    }

    fn time_until_half_open(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        self.opened_at
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
    }
}

/// Serializable copy of the breaker's counters, embedded in session checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub window_started_at: DateTime<Utc>,
    pub request_count: u64,
    pub error_count: u64,
    pub window_samples: usize,
    pub error_rate: f64,
    pub mean_latency_ms: Option<f64>,
    pub latency_stddev_ms: Option<f64>,
    pub opened_at: Option<DateTime<Utc>>,
    pub trips: u32,
    pub last_trip: Option<TripReason>,
}

/// How close the session is to being detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionRisk {
    Nominal,
    Elevated,
    Critical,
}

/// Read-only view of the breaker used to decide slow-down or abort.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSignal {
    pub state: CircuitState,
    pub samples: usize,
    pub error_rate: f64,
    pub mean_latency: Option<Duration>,
    pub latency_stddev: Option<Duration>,
    pub risk: DetectionRisk,
}

impl DetectionSignal {
    /// Factor applied to pacing delays while this signal holds.
    pub fn slowdown_factor(&self) -> f64 {
        match self.risk {
            DetectionRisk::Nominal => 1.0,
            DetectionRisk::Elevated => 2.0,
            DetectionRisk::Critical => 3.0,
        }
    }
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - request was rejected without calling the site.
    Open { name: String, retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Per-session circuit breaker. Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Whether a request may be issued now.
    ///
    /// In Half-Open each `true` consumes one of the trial slots.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.trials_admitted < self.config.half_open_trials {
                    inner.trials_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left before an open circuit starts admitting trials.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.time_until_half_open()
    }

    /// Runs `operation` through the breaker, timing it and recording the outcome.
    ///
    /// - Closed / admitted trial: executes the operation
    /// - Open (or no trial slot left): returns `CircuitBreakerError::Open` without executing
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if !self.allow_request() {
            let retry_after = self.time_until_half_open().unwrap_or(Duration::ZERO);
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after,
            });
        }

        let started = Instant::now();
        let result = operation().await;
        let latency = started.elapsed();

        match &result {
            Ok(_) => self.record_outcome(true, latency),
            Err(e) if e.is_blocking() => self.record_blocked(latency),
            Err(e) => self.record_outcome(!e.should_trip_circuit(), latency),
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    /// Records one completed request.
    pub fn record_outcome(&self, success: bool, latency: Duration) {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.push(Sample { success, latency }, self.config.window_size);

        match inner.state {
            CircuitState::Closed => {
                if let Some(reason) = self.trip_reason(&inner.stats()) {
                    self.open(&mut inner, reason);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.trial_successes += 1;
                    if inner.trial_successes >= self.config.half_open_trials {
                        self.close(&mut inner);
                    }
                } else {
                    self.open(&mut inner, TripReason::TrialFailed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a 403/429 response. Opens the circuit immediately and extends recovery.
    pub fn record_blocked(&self, latency: Duration) {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.push(
            Sample {
                success: false,
                latency,
            },
            self.config.window_size,
        );

        if inner.state == CircuitState::Open {
            return;
        }

        let extended = Duration::try_from_secs_f32(
            inner.current_recovery_timeout.as_secs_f32()
                * self.config.blocked_backoff_multiplier.max(1.0),
        )
        .unwrap_or(self.config.max_recovery_timeout);
        inner.current_recovery_timeout = extended.min(self.config.max_recovery_timeout);
        tracing::info!(
            circuit = %self.name,
            recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
            "Extended recovery timeout due to blocking response"
        );
        self.open(&mut inner, TripReason::Blocked);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        let stats = inner.stats();

        CircuitSnapshot {
            state: inner.state,
            window_started_at: inner.window_start,
            request_count: inner.request_count,
            error_count: inner.error_count,
            window_samples: stats.samples,
            error_rate: stats.error_rate(),
            mean_latency_ms: stats.mean_latency.map(|d| d.as_secs_f64() * 1000.0),
            latency_stddev_ms: stats.latency_stddev.map(|d| d.as_secs_f64() * 1000.0),
            opened_at: inner.opened_at_utc,
            trips: inner.trips,
            last_trip: inner.last_trip.clone(),
        }
    }

    /// Recomputes the detection risk from the current window.
    pub fn detection_signal(&self) -> DetectionSignal {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        let stats = inner.stats();

        let risk = if inner.state != CircuitState::Closed {
            DetectionRisk::Critical
        } else if stats.samples >= (self.config.min_samples / 2).max(1)
            && (stats.error_rate() > self.config.error_rate_threshold / 2.0
                || stats
                    .mean_latency
                    .is_some_and(|m| m < self.config.latency_floor.mul_f64(1.5)))
        {
            DetectionRisk::Elevated
        } else {
            DetectionRisk::Nominal
        };

        DetectionSignal {
            state: inner.state,
            samples: stats.samples,
            error_rate: stats.error_rate(),
            mean_latency: stats.mean_latency,
            latency_stddev: stats.latency_stddev,
            risk,
        }
    }

    fn trip_reason(&self, stats: &WindowStats) -> Option<TripReason> {
        if stats.samples < self.config.min_samples {
            return None;
        }
        let rate = stats.error_rate();
        if rate > self.config.error_rate_threshold {
            return Some(TripReason::ErrorRate { rate });
        }
        if stats.latency_samples >= self.config.min_samples
            && let Some(mean) = stats.mean_latency
            && mean < self.config.latency_floor
        {
            return Some(TripReason::LatencyFloor {
                mean_ms: mean.as_secs_f64() * 1000.0,
            });
        }
        None
    }

    fn open(&self, inner: &mut CircuitBreakerInner, reason: TripReason) {
        tracing::warn!(
            circuit = %self.name,
            from = %inner.state,
            reason = %reason,
            "Circuit breaker opening"
        );
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_utc = Some(Utc::now());
        inner.trials_admitted = 0;
        inner.trial_successes = 0;
        inner.trips += 1;
        inner.last_trip = Some(reason);
    }

    fn close(&self, inner: &mut CircuitBreakerInner) {
        tracing::info!(
            circuit = %self.name,
            "Circuit breaker closing after {} successful trials",
            inner.trial_successes
        );
        inner.state = CircuitState::Closed;
        inner.window.clear();
        inner.window_start = Utc::now();
        inner.request_count = 0;
        inner.error_count = 0;
        inner.opened_at = None;
        inner.opened_at_utc = None;
        inner.trials_admitted = 0;
        inner.trial_successes = 0;
        inner.current_recovery_timeout = self.config.recovery_timeout;
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened) = inner.opened_at
            && opened.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.trials_admitted = 0;
            inner.trial_successes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const NORMAL: Duration = Duration::from_millis(800);

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window_size: 10,
            min_samples: 4,
            error_rate_threshold: 0.15,
            latency_floor: Duration::from_millis(100),
            recovery_timeout: Duration::from_millis(10),
            half_open_trials: 2,
            blocked_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_opens_when_error_rate_exceeds_threshold() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            cb.record_outcome(true, NORMAL);
        }
        cb.record_outcome(false, NORMAL);

        // 1 error in 4 samples = 25% > 15%
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert!(matches!(
            cb.snapshot().last_trip,
            Some(TripReason::ErrorRate { .. })
        ));
    }

    #[test]
    fn test_stays_closed_below_min_samples() {
        let cb = CircuitBreaker::new("test", config());
        cb.record_outcome(false, NORMAL);
        cb.record_outcome(false, NORMAL);
        cb.record_outcome(false, NORMAL);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_stays_closed_under_threshold() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            window_size: 20,
            ..config()
        });
        for _ in 0..9 {
            cb.record_outcome(true, NORMAL);
        }
        // Before the error the window is 9 successes; 1/10 = 10% <= 15%
        cb.record_outcome(false, NORMAL);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_anomalously_fast_successes_trip() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..4 {
            cb.record_outcome(true, Duration::from_millis(5));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.snapshot().last_trip,
            Some(TripReason::LatencyFloor { .. })
        ));
    }

    #[test]
    fn test_blocked_opens_immediately() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(30),
            max_recovery_timeout: Duration::from_secs(300),
            ..config()
        });
        cb.record_blocked(NORMAL);

        assert_eq!(cb.state(), CircuitState::Open);
        let remaining = cb.time_until_half_open().unwrap();
        assert!(remaining > Duration::from_secs(55));
        assert!(remaining <= Duration::from_secs(60));
    }

    #[test]
    fn test_blocked_backoff_capped_at_max() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(200),
            max_recovery_timeout: Duration::from_secs(300),
            ..config()
        });
        cb.record_blocked(NORMAL);
        assert!(cb.time_until_half_open().unwrap() <= Duration::from_secs(300));
    }

    #[test]
    fn test_blocked_backoff_with_extreme_multiplier() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(60),
            max_recovery_timeout: Duration::from_secs(600),
            blocked_backoff_multiplier: f32::MAX,
            ..config()
        });
        cb.record_blocked(NORMAL);
        let remaining = cb.time_until_half_open().unwrap();
        assert!(remaining > Duration::from_secs(590));
        assert!(remaining <= Duration::from_secs(600));

        // A shrinking multiplier never shortens the recovery timeout.
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(60),
            max_recovery_timeout: Duration::from_secs(600),
            blocked_backoff_multiplier: -1.0,
            ..config()
        });
        cb.record_blocked(NORMAL);
        assert!(cb.time_until_half_open().unwrap() > Duration::from_secs(50));
    }

    #[test]
    fn test_open_transitions_to_half_open_after_timeout() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..4 {
            cb.record_outcome(false, NORMAL);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_fixed_number_of_trials() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..4 {
            cb.record_outcome(false, NORMAL);
        }
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_recovery_passes_through_half_open() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..4 {
            cb.record_outcome(false, NORMAL);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Successes reported while open do not close the circuit.
        cb.record_outcome(true, NORMAL);
        cb.record_outcome(true, NORMAL);
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_outcome(true, NORMAL);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_outcome(true, NORMAL);
        assert_eq!(cb.state(), CircuitState::Closed);

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.request_count, 0);
        assert_eq!(snapshot.window_samples, 0);
        assert_eq!(snapshot.trips, 1);
    }

    #[test]
    fn test_half_open_reopens_on_trial_failure() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..4 {
            cb.record_outcome(false, NORMAL);
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_outcome(false, NORMAL);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().last_trip, Some(TripReason::TrialFailed));
    }

    #[test]
    fn test_detection_signal_escalates() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            window_size: 20,
            min_samples: 10,
            ..config()
        });
        for _ in 0..5 {
            cb.record_outcome(true, NORMAL);
        }
        assert_eq!(cb.detection_signal().risk, DetectionRisk::Nominal);

        cb.record_outcome(false, NORMAL);
        // 1/6 > 7.5% but below min_samples, so the breaker stays closed
        let signal = cb.detection_signal();
        assert_eq!(signal.state, CircuitState::Closed);
        assert_eq!(signal.risk, DetectionRisk::Elevated);
        assert_eq!(signal.slowdown_factor(), 2.0);

        cb.record_blocked(NORMAL);
        assert_eq!(cb.detection_signal().risk, DetectionRisk::Critical);
    }

    #[test]
    fn test_latency_statistics() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        cb.record_outcome(true, Duration::from_millis(400));
        cb.record_outcome(true, Duration::from_millis(600));
        cb.record_outcome(false, Duration::from_millis(5000));

        let snapshot = cb.snapshot();
        let mean = snapshot.mean_latency_ms.unwrap();
        let stddev = snapshot.latency_stddev_ms.unwrap();
        assert!((mean - 500.0).abs() < 1.0);
        assert!((stddev - 100.0).abs() < 1.0);
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn test_call_does_not_execute_when_open() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(60),
            ..config()
        });
        cb.record_blocked(NORMAL);

        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let result = cb
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AppError>("should not execute")
                })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_call_records_outcomes_by_error_class() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        let ok = cb.call(|| async { Ok::<_, AppError>(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let _ = cb
            .call(|| async {
                Err::<(), _>(AppError::HttpError {
                    status: 404,
                    url: "u".into(),
                })
            })
            .await;
        let _ = cb
            .call(|| async { Err::<(), _>(AppError::Timeout(30)) })
            .await;

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.request_count, 3);
        // The 404 is a definitive answer, not a failure signal.
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn test_call_blocked_opens_circuit() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        let result = cb
            .call(|| async {
                Err::<(), _>(AppError::Blocked {
                    status: 429,
                    url: "u".into(),
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(CircuitBreakerError::Inner(AppError::Blocked { .. }))
        ));
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
