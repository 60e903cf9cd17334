//! Retry with exponential backoff, and per-operation circuit breakers
//!
//! A [`RetryManager`] is an explicit context object: breaker state is keyed by
//! operation name and shared by every call made through the same manager.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Backoff parameters for one call site
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_retries: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    #[default]
    Closed,
    /// Calls fail fast
    Open,
    /// One trial call is allowed through after the reset timeout
    HalfOpen,
}

/// Breaker parameters for one named operation
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a trial call
    pub reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    /// A half-open trial call is running
    trial_in_flight: bool,
}

impl CircuitBreaker {
    /// Effective state, moving Open to HalfOpen once the reset timeout has passed
    fn refresh(&mut self, reset_timeout: Duration) -> CircuitState {
        if self.state == CircuitState::Open {
            let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or(reset_timeout);
            if elapsed >= reset_timeout {
                self.state = CircuitState::HalfOpen;
            }
        }
        self.state
    }
}

/// Releases the half-open trial slot if the trial call is dropped unfinished
struct TrialGuard<'a> {
    breakers: &'a DashMap<String, CircuitBreaker>,
    name: &'a str,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(mut breaker) = self.breakers.get_mut(self.name) {
                breaker.trial_in_flight = false;
            }
        }
    }
}

/// Failure of a single attempt under [`RetryManager::execute_with_timeout`]
enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(e) => write!(f, "{}", e),
            AttemptError::TimedOut(after) => write!(f, "timed out after {:?}", after),
        }
    }
}

/// Retry and circuit breaker executor
///
/// ```
/// # tokio_test::block_on(async {
/// use playlink_core::{RetryManager, RetryPolicy};
///
/// let retry = RetryManager::new();
/// let value = retry
///     .execute_with_retry("lookup", &RetryPolicy::default(), |_attempt| async {
///         Ok::<_, String>(7)
///     })
///     .await
///     .unwrap();
/// assert_eq!(value, 7);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct RetryManager {
    breakers: DashMap<String, CircuitBreaker>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` until it succeeds or `policy.max_retries` attempts have failed
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> Result<T, SessionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_with_retry_observed(name, policy, op, |_, _, _| {})
            .await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry), calling
    /// `on_retry(attempt, max_retries, delay)` before each backoff sleep
    pub async fn execute_with_retry_observed<T, E, F, Fut, R>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        op: F,
        on_retry: R,
    ) -> Result<T, SessionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        R: FnMut(u32, u32, Duration),
    {
        retry_loop(name, policy, op, on_retry)
            .await
            .map_err(|e| SessionError::RetriesExhausted {
                operation: name.to_string(),
                attempts: policy.max_retries.max(1),
                last_error: e.to_string(),
            })
    }

    /// Retry with each attempt bounded by `deadline`
    ///
    /// If the last attempt timed out the result is `OperationTimeout`.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        deadline: Duration,
        mut op: F,
    ) -> Result<T, SessionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let bounded = move |attempt| {
            let fut = op(attempt);
            async move {
                match tokio::time::timeout(deadline, fut).await {
                    Ok(result) => result.map_err(AttemptError::Failed),
                    Err(_) => Err(AttemptError::TimedOut(deadline)),
                }
            }
        };

        match retry_loop(name, policy, bounded, |_, _, _| {}).await {
            Ok(value) => Ok(value),
            Err(AttemptError::TimedOut(after)) => Err(SessionError::OperationTimeout {
                operation: name.to_string(),
                after,
            }),
            Err(e) => Err(SessionError::RetriesExhausted {
                operation: name.to_string(),
                attempts: policy.max_retries.max(1),
                last_error: e.to_string(),
            }),
        }
    }

    /// Run `op` through the breaker named by `config.name`
    ///
    /// While the breaker is open the call fails fast with `CircuitOpen`
    /// and `op` is never invoked. Once half-open, a single trial call is let
    /// through; other callers keep failing fast until it completes.
    pub async fn execute_with_circuit_breaker<T, E, F, Fut>(
        &self,
        config: &CircuitBreakerConfig,
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SessionError>,
    {
        let mut guard = TrialGuard {
            breakers: &self.breakers,
            name: &config.name,
            armed: false,
        };
        {
            let mut breaker = self.breakers.entry(config.name.clone()).or_default();
            let fail_fast = match breaker.refresh(config.reset_timeout) {
                CircuitState::Closed => false,
                CircuitState::Open => true,
                CircuitState::HalfOpen if breaker.trial_in_flight => true,
                CircuitState::HalfOpen => {
                    debug!(operation = %config.name, "Circuit half-open, letting a trial call through");
                    breaker.trial_in_flight = true;
                    guard.armed = true;
                    false
                }
            };
            if fail_fast {
                debug!(operation = %config.name, "Circuit open, failing fast");
                return Err(SessionError::CircuitOpen(config.name.clone()).into());
            }
        }

        let result = op().await;

        let mut breaker = self.breakers.entry(config.name.clone()).or_default();
        if guard.armed {
            breaker.trial_in_flight = false;
            guard.armed = false;
        }
        match &result {
            Ok(_) => {
                if breaker.state != CircuitState::Closed {
                    info!(operation = %config.name, "Circuit closed");
                }
                breaker.state = CircuitState::Closed;
                breaker.failure_count = 0;
                breaker.opened_at = None;
            }
            Err(_) => {
                breaker.failure_count += 1;
                let trip = breaker.state == CircuitState::HalfOpen
                    || breaker.failure_count >= config.failure_threshold;
                if trip {
                    warn!(
                        operation = %config.name,
                        failures = breaker.failure_count,
                        "Circuit opened"
                    );
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
        }

        result
    }

    /// Current state of a named breaker (Closed if it has never been used)
    pub fn circuit_state(&self, name: &str, reset_timeout: Duration) -> CircuitState {
        self.breakers
            .get_mut(name)
            .map(|mut b| b.refresh(reset_timeout))
            .unwrap_or_default()
    }

    /// Force a breaker back to closed
    pub fn reset_circuit_breaker(&self, name: &str) {
        if self.breakers.remove(name).is_some() {
            info!(operation = %name, "Circuit breaker reset");
        }
    }
}

async fn retry_loop<T, E, F, Fut, R>(
    name: &str,
    policy: &RetryPolicy,
    mut op: F,
    mut on_retry: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    R: FnMut(u32, u32, Duration),
{
    let max = policy.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = %name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < max => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = %name,
                    attempt,
                    max_retries = max,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed: {}",
                    e
                );
                on_retry(attempt, max, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(operation = %name, attempts = max, "Giving up: {}", e);
                return Err(e);
            }
        }
    }
}
