use arcus_rs::services::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
use std::time::Duration;
use tokio::time::sleep;

fn config(
    failure_threshold: u64,
    success_threshold: u64,
    open_timeout: Duration,
    half_open_allowed: u64,
) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        success_threshold,
        open_timeout,
        half_open_allowed_requests: half_open_allowed,
        failure_status_threshold: 500,
    }
}

#[tokio::test]
async fn opens_after_exactly_threshold_failures() {
    let cb = CircuitBreaker::new(
        "users".to_string(),
        config(3, 2, Duration::from_secs(10), 1),
    );

    for _ in 0..2 {
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
    cb.record_failure();
    assert_eq!(cb.state(), CircuitState::Open);

    // Short-circuited: the operation must never run.
    async fn must_not_run() -> Result<(), &'static str> {
        panic!("operation ran while circuit was open")
    }
    let result = cb.call(must_not_run()).await;
    assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
}

#[tokio::test]
async fn success_in_closed_state_resets_failure_count() {
    let cb = CircuitBreaker::new(
        "users".to_string(),
        config(3, 2, Duration::from_secs(10), 1),
    );

    cb.record_failure();
    cb.record_failure();
    assert_eq!(cb.failure_count(), 2);

    cb.record_success();
    assert_eq!(cb.failure_count(), 0);

    // The counter restarted; two more failures stay under the threshold.
    cb.record_failure();
    cb.record_failure();
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test]
async fn exactly_one_probe_after_open_timeout() {
    let cb = CircuitBreaker::new(
        "users".to_string(),
        config(1, 2, Duration::from_millis(50), 1),
    );

    cb.record_failure();
    assert_eq!(cb.state(), CircuitState::Open);
    assert!(!cb.try_acquire());

    sleep(Duration::from_millis(80)).await;

    // One probe credit, no more.
    assert!(cb.try_acquire());
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    assert!(!cb.try_acquire());
}

#[tokio::test]
async fn half_open_closes_after_success_threshold() {
    let cb = CircuitBreaker::new(
        "users".to_string(),
        config(1, 2, Duration::from_millis(20), 2),
    );

    cb.record_failure();
    sleep(Duration::from_millis(40)).await;

    assert!(cb.try_acquire());
    cb.record_success();
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    assert!(cb.try_acquire());
    cb.record_success();
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test]
async fn half_open_failure_restarts_open_timeout() {
    let cb = CircuitBreaker::new(
        "users".to_string(),
        config(1, 1, Duration::from_millis(50), 1),
    );

    cb.record_failure();
    sleep(Duration::from_millis(80)).await;

    assert!(cb.try_acquire());
    cb.record_failure();
    assert_eq!(cb.state(), CircuitState::Open);
    // freshly reopened: no probe before the timeout elapses again
    assert!(!cb.try_acquire());

    sleep(Duration::from_millis(80)).await;
    assert!(cb.try_acquire());
}

#[tokio::test]
async fn concurrent_callers_share_one_probe_credit() {
    let cb = CircuitBreaker::new(
        "users".to_string(),
        config(1, 1, Duration::from_millis(20), 1),
    );
    cb.record_failure();
    sleep(Duration::from_millis(40)).await;

    let mut admitted = 0;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cb = cb.clone();
        handles.push(tokio::spawn(async move { cb.try_acquire() }));
    }
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}

#[test]
fn settings_conversion_fills_defaults() {
    use arcus_rs::models::settings::CircuitBreakerSettings;

    let settings = CircuitBreakerSettings {
        enabled: true,
        failure_threshold: 0,
        success_threshold: 0,
        open_timeout: 0,
        half_open_allowed_requests: 0,
    };
    let config = CircuitBreakerConfig::from(&settings);
    assert_eq!(config.failure_threshold, 5);
    assert_eq!(config.success_threshold, 2);
    assert_eq!(config.open_timeout, Duration::from_secs(30));
    assert_eq!(config.half_open_allowed_requests, 1);
}
