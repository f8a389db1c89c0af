//! Circuit breaker implementation for upstream service protection.
//!
//! One instance guards each backend. Failure accounting is the breaker's
//! job alone; the health checker reports point-in-time health and never
//! counts consecutive failures.

use crate::models::events::{EventEmitter, GatewayEvent};
use crate::models::settings::CircuitBreakerSettings;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,   // Normal operation
    Open = 1,     // Circuit is open, failing fast
    HalfOpen = 2, // Testing if service is back
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Runtime thresholds and timeouts for one breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u64,
    /// Half-open successes that close the circuit.
    pub success_threshold: u64,
    /// How long an open circuit waits before admitting probes.
    pub open_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_allowed_requests: u64,
    /// Responses at or above this status count as failures.
    pub failure_status_threshold: u16,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_allowed_requests: 1,
            failure_status_threshold: 500,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: if settings.failure_threshold > 0 {
                settings.failure_threshold
            } else {
                defaults.failure_threshold
            },
            success_threshold: if settings.success_threshold > 0 {
                settings.success_threshold
            } else {
                defaults.success_threshold
            },
            open_timeout: if settings.open_timeout > 0 {
                Duration::from_secs(settings.open_timeout)
            } else {
                defaults.open_timeout
            },
            half_open_allowed_requests: if settings.half_open_allowed_requests > 0 {
                settings.half_open_allowed_requests
            } else {
                defaults.half_open_allowed_requests
            },
            failure_status_threshold: defaults.failure_status_threshold,
        }
    }
}

/// Per-backend circuit breaker.
///
/// # States
///
/// - **Closed**: requests pass through; consecutive failures are counted.
/// - **Open**: requests are short-circuited until `open_timeout` elapses.
/// - **HalfOpen**: up to `half_open_allowed_requests` probes run
///   concurrently; enough successes close the circuit, any failure reopens
///   it.
///
/// # Thread Safety
///
/// State and counters use atomics; only the open timestamp sits behind a
/// lock. Safe under concurrent callers.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    half_open_inflight: AtomicU64,
    opened_at: RwLock<Option<Instant>>,
    backend_id: String,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("failure_count", &self.failure_count)
            .field("success_count", &self.success_count)
            .field("half_open_inflight", &self.half_open_inflight)
            .field("opened_at", &self.opened_at)
            .field("backend_id", &self.backend_id)
            .field("emitter", &self.emitter.as_ref().map(|_| "<EventEmitter>"))
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(backend_id: String, config: CircuitBreakerConfig) -> Arc<Self> {
        Self::with_emitter(backend_id, config, None)
    }

    pub fn with_emitter(
        backend_id: String,
        config: CircuitBreakerConfig,
        emitter: Option<Arc<dyn EventEmitter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            half_open_inflight: AtomicU64::new(0),
            opened_at: RwLock::new(None),
            backend_id,
            emitter,
        })
    }

    /// Whether a request issued right now would be short-circuited.
    ///
    /// Observation only: probe credit is not consumed. An open circuit whose
    /// timeout has elapsed transitions to half-open here, so callers see the
    /// probe window as soon as it opens.
    pub fn is_open(&self) -> bool {
        match self.state() {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if self.open_timeout_elapsed() {
                    self.transition_to_half_open();
                    self.half_open_inflight.load(Ordering::Acquire)
                        >= self.config.half_open_allowed_requests
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_inflight.load(Ordering::Acquire)
                    >= self.config.half_open_allowed_requests
            }
        }
    }

    /// Admits a request, consuming a probe credit when half-open.
    ///
    /// Returns `false` when the call must be short-circuited. Callers that
    /// get `true` must report the outcome via [`record_success`] or
    /// [`record_failure`] so half-open credits are released.
    ///
    /// [`record_success`]: CircuitBreaker::record_success
    /// [`record_failure`]: CircuitBreaker::record_failure
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.open_timeout_elapsed() {
                    self.transition_to_half_open();
                    self.acquire_probe_credit()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.acquire_probe_credit(),
        }
    }

    fn acquire_probe_credit(&self) -> bool {
        let mut current = self.half_open_inflight.load(Ordering::Acquire);
        loop {
            if current >= self.config.half_open_allowed_requests {
                return false;
            }
            match self.half_open_inflight.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_probe_credit(&self) {
        let mut current = self.half_open_inflight.load(Ordering::Acquire);
        while current > 0 {
            match self.half_open_inflight.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn open_timeout_elapsed(&self) -> bool {
        match *self.opened_at.read().unwrap() {
            Some(at) => at.elapsed() >= self.config.open_timeout,
            None => true,
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.release_probe_credit();
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {
                debug!(
                    "Unexpected success in open state for circuit {}",
                    self.backend_id
                );
            }
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                self.release_probe_credit();
                self.transition_to_open();
            }
            CircuitState::Open => {
                *self.opened_at.write().unwrap() = Some(Instant::now());
            }
        }
    }

    /// Wraps an operation, short-circuiting when the breaker disallows it.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            debug!("Circuit breaker {} is open, failing fast", self.backend_id);
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match operation.await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(error) => {
                self.record_failure();
                Err(CircuitBreakerError::OperationFailed(error))
            }
        }
    }

    fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.opened_at.write().unwrap() = Some(Instant::now());
        self.success_count.store(0, Ordering::Release);
        self.half_open_inflight.store(0, Ordering::Release);

        warn!("Circuit breaker {} opened due to failures", self.backend_id);
        self.emit(GatewayEvent::CircuitBreakerOpen {
            backend_id: self.backend_id.clone(),
            failure_count: self.failure_count(),
        });
    }

    fn transition_to_half_open(&self) {
        // Only one observer performs the transition.
        if self
            .state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.success_count.store(0, Ordering::Release);
        self.half_open_inflight.store(0, Ordering::Release);

        info!(
            "Circuit breaker {} transitioned to half-open",
            self.backend_id
        );
        self.emit(GatewayEvent::CircuitBreakerHalfOpen {
            backend_id: self.backend_id.clone(),
        });
    }

    fn transition_to_closed(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.half_open_inflight.store(0, Ordering::Release);

        info!(
            "Circuit breaker {} closed - service recovered",
            self.backend_id
        );
        self.emit(GatewayEvent::CircuitBreakerClosed {
            backend_id: self.backend_id.clone(),
        });
    }

    fn emit(&self, event: GatewayEvent) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(event);
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a response status counts as a failure for this backend.
    pub fn is_failure_status(&self, status: u16) -> bool {
        status >= self.config.failure_status_threshold
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open")]
    CircuitOpen,
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    fn config(failures: u64, successes: u64, open_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            open_timeout: Duration::from_millis(open_ms),
            half_open_allowed_requests: 1,
            failure_status_threshold: 500,
        }
    }

    #[tokio::test]
    async fn closed_state_passes_through() {
        let cb = CircuitBreaker::new("test".to_string(), config(3, 2, 1000));

        assert_eq!(cb.state(), CircuitState::Closed);

        let result = cb.call(async { Ok::<i32, &str>(42) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_on_failures() {
        let cb = CircuitBreaker::new("test".to_string(), config(2, 2, 1000));

        let result = cb.call(async { Err::<i32, &str>("error") }).await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);

        let result = cb.call(async { Err::<i32, &str>("error") }).await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // Next call fails fast without touching the operation
        let result = cb.call(async { Ok::<i32, &str>(42) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn half_open_recovery() {
        let cb = CircuitBreaker::new("test".to_string(), config(1, 2, 100));

        let _ = cb.call(async { Err::<i32, &str>("error") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(150)).await;

        let result = cb.call(async { Ok::<i32, &str>(42) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let result = cb.call(async { Ok::<i32, &str>(42) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_limited_probes() {
        let cb = CircuitBreaker::new("test".to_string(), config(1, 5, 50));

        let _ = cb.call(async { Err::<i32, &str>("error") }).await;
        sleep(Duration::from_millis(80)).await;

        // Single probe credit: first acquire succeeds, second is refused
        assert!(cb.try_acquire());
        assert!(!cb.try_acquire());
        assert!(cb.is_open());

        cb.record_success();
        assert!(cb.try_acquire());
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test".to_string(), config(1, 2, 50));

        let _ = cb.call(async { Err::<i32, &str>("error") }).await;
        sleep(Duration::from_millis(80)).await;

        let result = cb.call(async { Err::<i32, &str>("still down") }).await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn failure_status_criterion() {
        let cb = CircuitBreaker::new("test".to_string(), CircuitBreakerConfig::default());
        assert!(cb.is_failure_status(500));
        assert!(cb.is_failure_status(503));
        assert!(!cb.is_failure_status(404));
    }
}
