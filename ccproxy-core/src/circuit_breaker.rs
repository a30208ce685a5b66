//! Per-upstream circuit breaker: closed -> open -> half-open.
//!
//! Failures accumulate two ways: consecutive-failure count (classic circuit
//! breaker) and a failure ratio over a minimum sample size (catches a
//! upstream that fails intermittently rather than in an unbroken streak).
//! Either condition opens the circuit.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open - too many failures")]
    Open,
    #[error("Circuit breaker timeout")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit outright.
    pub failure_threshold: u32,
    /// Failure ratio (0.0-1.0) that opens the circuit once `min_samples`
    /// requests have been observed, even without a pure failure streak.
    pub error_threshold: f64,
    /// Minimum number of requests before the ratio condition applies.
    pub min_samples: u32,
    /// Time to wait after opening before admitting half-open probes.
    #[serde(with = "crate::common::duration_serde")]
    pub open_duration: Duration,
    /// Maximum time to wait for an individual request.
    #[serde(with = "crate::common::duration_serde")]
    pub request_timeout: Duration,
    /// Maximum concurrent probe calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Successes required, while half-open, to close the circuit.
    pub half_open_required_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_threshold: 0.5,
            min_samples: 10,
            open_duration: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            half_open_required_successes: 3,
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    half_open_calls: u32,
    half_open_successes: u32,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_time: None,
            last_success_time: None,
            half_open_calls: 0,
            half_open_successes: 0,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitBreakerState>>,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(CircuitBreakerState::default())),
            name,
        }
    }

    /// Execute `operation` under circuit-breaker protection: checks `allow`,
    /// runs with a deadline, and records the outcome.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.allow().await {
            tracing::warn!("circuit breaker {} is open, blocking request", self.name);
            return Err(CircuitBreakerError::Open);
        }

        match tokio::time::timeout(self.config.request_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record(true).await;
                Ok(value)
            }
            Ok(Err(_)) => {
                self.record(false).await;
                Err(CircuitBreakerError::Open)
            }
            Err(_) => {
                self.record(false).await;
                Err(CircuitBreakerError::Timeout)
            }
        }
    }

    /// Whether a request may proceed right now; also drives the
    /// open -> half-open transition once `open_duration` has elapsed.
    pub async fn allow(&self) -> bool {
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.open_duration {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_calls = 0;
                    state.half_open_successes = 0;
                    tracing::info!("circuit breaker {} -> half_open", self.name);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_calls < self.config.half_open_max_calls {
                    state.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record the outcome of a call admitted by `allow`.
    pub async fn record(&self, success: bool) {
        let mut state = self.state.write().await;
        let now = Instant::now();

        if success {
            state.successes += 1;
            state.consecutive_failures = 0;
            state.last_success_time = Some(now);

            match state.state {
                CircuitState::Closed => {}
                CircuitState::HalfOpen => {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= self.config.half_open_required_successes {
                        state.state = CircuitState::Closed;
                        state.failures = 0;
                        state.successes = 0;
                        state.consecutive_failures = 0;
                        state.half_open_calls = 0;
                        state.half_open_successes = 0;
                        tracing::info!("circuit breaker {} -> closed", self.name);
                    }
                }
                CircuitState::Open => {}
            }
        } else {
            state.failures += 1;
            state.consecutive_failures += 1;
            state.last_failure_time = Some(now);

            match state.state {
                CircuitState::Closed => {
                    let total = state.failures + state.successes;
                    let ratio_tripped = total >= self.config.min_samples
                        && (state.failures as f64 / total as f64) > self.config.error_threshold;
                    if state.consecutive_failures >= self.config.failure_threshold || ratio_tripped
                    {
                        state.state = CircuitState::Open;
                        state.opened_at = Some(now);
                        tracing::warn!(
                            "circuit breaker {} -> open after {} consecutive failures",
                            self.name,
                            state.consecutive_failures
                        );
                    }
                }
                CircuitState::HalfOpen => {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    state.half_open_calls = 0;
                    state.half_open_successes = 0;
                    tracing::warn!("circuit breaker {} -> open (half-open probe failed)", self.name);
                }
                CircuitState::Open => {}
            }
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn get_metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.read().await;
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            consecutive_failures: state.consecutive_failures,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
        }
    }

    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
    }

    /// Force closed and zero all counters.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = CircuitBreakerState::default();
    }
}

#[derive(Debug)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
}
