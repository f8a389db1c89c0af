//! Periodic backend health checking.
//!
//! One loop owned by the module probes every registered backend: DNS
//! resolution first, then a bounded HTTP GET against the configured
//! endpoint. Live traffic within `recent_request_threshold` suppresses the
//! probe - real requests are a sufficient health signal.
//!
//! A single failed probe flips the reported health to `false`;
//! consecutive-failure accounting belongs to the circuit breaker, not here.

use crate::models::events::{now_utc, EventEmitter, GatewayEvent};
use crate::models::health::HealthStatus;
use crate::models::settings::HealthCheckSettings;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::utils::path::host_port_of;
use log::{debug, info, warn};
use rand::Rng;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Runtime probe configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub recent_request_threshold: Duration,
    pub endpoint: String,
    pub expected_status_codes: Vec<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            recent_request_threshold: Duration::ZERO,
            endpoint: "/".to_string(),
            expected_status_codes: vec![200],
        }
    }
}

impl From<&HealthCheckSettings> for HealthCheckConfig {
    fn from(settings: &HealthCheckSettings) -> Self {
        Self {
            enabled: settings.enabled,
            interval: Duration::from_secs(settings.interval.max(1)),
            timeout: Duration::from_secs(settings.timeout.max(1)),
            recent_request_threshold: Duration::from_secs(settings.recent_request_threshold),
            endpoint: if settings.endpoint.is_empty() {
                "/".to_string()
            } else {
                settings.endpoint.clone()
            },
            expected_status_codes: if settings.expected_status_codes.is_empty() {
                vec![200]
            } else {
                settings.expected_status_codes.clone()
            },
        }
    }
}

#[derive(Debug, Clone)]
struct ProbeTarget {
    url: String,
    config: HealthCheckConfig,
}

/// Health checker for all registered backends.
pub struct HealthChecker {
    client: Client,
    config: RwLock<HealthCheckConfig>,
    targets: RwLock<HashMap<String, ProbeTarget>>,
    status: RwLock<HashMap<String, HealthStatus>>,
    last_request: RwLock<HashMap<String, Instant>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    emitter: Option<Arc<dyn EventEmitter>>,
    shutdown: watch::Sender<bool>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, emitter: Option<Arc<dyn EventEmitter>>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .expect("Failed to create health-check HTTP client");
        Arc::new(Self {
            client,
            config: RwLock::new(config),
            targets: RwLock::new(HashMap::new()),
            status: RwLock::new(HashMap::new()),
            last_request: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            emitter,
            shutdown,
        })
    }

    /// Replaces the probed backend set. Per-backend configs override the
    /// global probe config.
    pub fn update_backends(
        &self,
        backends: HashMap<String, (String, Option<HealthCheckConfig>)>,
    ) {
        let global = self.config.read().unwrap().clone();
        let mut targets = self.targets.write().unwrap();
        targets.clear();
        for (backend_id, (url, config)) in backends {
            targets.insert(
                backend_id,
                ProbeTarget {
                    url,
                    config: config.unwrap_or_else(|| global.clone()),
                },
            );
        }
    }

    /// Replaces the global probe configuration; backends without their own
    /// override pick it up on the next pass.
    pub fn update_config(&self, config: HealthCheckConfig) {
        let mut targets = self.targets.write().unwrap();
        for target in targets.values_mut() {
            target.config = config.clone();
        }
        *self.config.write().unwrap() = config;
    }

    /// Attaches circuit breakers so snapshots can report breaker state.
    pub fn set_breakers(&self, breakers: HashMap<String, Arc<CircuitBreaker>>) {
        *self.breakers.write().unwrap() = breakers;
    }

    /// Records that live traffic hit a backend, suppressing the next probe
    /// when it lands within the configured window.
    pub fn record_backend_request(&self, backend_id: &str) {
        self.last_request
            .write()
            .unwrap()
            .insert(backend_id.to_string(), Instant::now());
    }

    /// Current snapshots with breaker state refreshed at read time.
    pub fn status_snapshot(&self) -> HashMap<String, HealthStatus> {
        let mut snapshot: HashMap<String, HealthStatus> = {
            let status = self.status.read().unwrap();
            let targets = self.targets.read().unwrap();
            targets
                .keys()
                .map(|id| {
                    (
                        id.clone(),
                        status
                            .get(id)
                            .cloned()
                            .unwrap_or_else(|| HealthStatus::unknown(id)),
                    )
                })
                .collect()
        };

        let breakers = self.breakers.read().unwrap();
        for (id, status) in snapshot.iter_mut() {
            if let Some(breaker) = breakers.get(id) {
                let state = breaker.state();
                status.circuit_breaker_state = state.as_str().to_string();
                status.circuit_breaker_open = breaker.is_open();
                status.circuit_failure_count = breaker.failure_count();
            }
        }
        snapshot
    }

    /// Whether the backend's most recent probe reported healthy. Backends
    /// that were never probed count as healthy.
    pub fn is_healthy(&self, backend_id: &str) -> bool {
        self.status
            .read()
            .unwrap()
            .get(backend_id)
            .map(|s| s.healthy)
            .unwrap_or(true)
    }

    /// Starts the probe loop. The returned handle completes after
    /// [`stop`] is called.
    ///
    /// [`stop`]: HealthChecker::stop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            // Spread the first pass so restarts do not probe in lockstep.
            let jitter = rand::thread_rng().gen_range(0..500);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            let tick = checker.tick_interval();
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!("health checker started (tick {:?})", tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        checker.probe_due_backends().await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("health checker stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Signals the probe loop to exit.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn tick_interval(&self) -> Duration {
        let global = self.config.read().unwrap().interval;
        let targets = self.targets.read().unwrap();
        targets
            .values()
            .map(|t| t.config.interval)
            .chain(std::iter::once(global))
            .min()
            .unwrap_or(global)
            .max(Duration::from_secs(1))
    }

    async fn probe_due_backends(&self) {
        let due: Vec<(String, ProbeTarget)> = {
            let targets = self.targets.read().unwrap();
            let status = self.status.read().unwrap();
            targets
                .iter()
                .filter(|(id, target)| {
                    if !target.config.enabled {
                        return false;
                    }
                    match status.get(*id).and_then(|s| s.last_check) {
                        Some(last) => {
                            let elapsed = now_utc().signed_duration_since(last);
                            elapsed.num_seconds() >= target.config.interval.as_secs() as i64
                        }
                        None => true,
                    }
                })
                .map(|(id, target)| (id.clone(), target.clone()))
                .collect()
        };

        for (backend_id, target) in due {
            self.probe_backend(&backend_id, &target).await;
        }
    }

    async fn probe_backend(&self, backend_id: &str, target: &ProbeTarget) {
        // Recent live traffic makes the probe redundant.
        if !target.config.recent_request_threshold.is_zero() {
            let recent = self
                .last_request
                .read()
                .unwrap()
                .get(backend_id)
                .map(|at| at.elapsed() < target.config.recent_request_threshold)
                .unwrap_or(false);
            if recent {
                debug!("skipping probe for {} (recent traffic)", backend_id);
                let mut status = self.status.write().unwrap();
                let entry = status
                    .entry(backend_id.to_string())
                    .or_insert_with(|| HealthStatus::unknown(backend_id));
                entry.checks_skipped += 1;
                return;
            }
        }

        let started = Instant::now();
        let host_port = host_port_of(&target.url);

        // Step 1: DNS resolution.
        let resolved = match tokio::net::lookup_host(host_port.as_str()).await {
            Ok(addrs) => {
                let ips: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
                if ips.is_empty() {
                    Err("DNS resolution returned no addresses".to_string())
                } else {
                    Ok(ips)
                }
            }
            Err(e) => Err(format!("DNS resolution failed: {}", e)),
        };

        let (dns_resolved, resolved_ips, probe_result) = match resolved {
            Err(error) => (false, Vec::new(), Err(error)),
            Ok(ips) => {
                // Step 2: HTTP probe.
                let endpoint = target.config.endpoint.trim_start_matches('/');
                let url = format!("{}/{}", target.url.trim_end_matches('/'), endpoint);
                let outcome = tokio::time::timeout(
                    target.config.timeout,
                    self.client.get(&url).send(),
                )
                .await;
                let result = match outcome {
                    Ok(Ok(response)) => {
                        let code = response.status().as_u16();
                        if target.config.expected_status_codes.contains(&code) {
                            Ok(())
                        } else {
                            Err(format!("unexpected status {}", code))
                        }
                    }
                    Ok(Err(e)) => Err(format!("probe request failed: {}", e)),
                    Err(_) => Err("probe timed out".to_string()),
                };
                (true, ips, result)
            }
        };

        let response_time = started.elapsed();
        let healthy = probe_result.is_ok();
        let error = probe_result.err();

        let was_healthy = {
            let mut status = self.status.write().unwrap();
            let entry = status
                .entry(backend_id.to_string())
                .or_insert_with(|| HealthStatus::unknown(backend_id));
            let was = entry.healthy;
            entry.healthy = healthy;
            entry.last_check = Some(now_utc());
            entry.response_time_ms = response_time.as_millis() as u64;
            entry.dns_resolved = dns_resolved;
            entry.resolved_ips = resolved_ips;
            entry.total_checks += 1;
            if healthy {
                entry.successful_checks += 1;
                entry.last_success = Some(now_utc());
                entry.last_error = None;
            } else {
                entry.last_error = error.clone();
            }
            was
        };

        if healthy != was_healthy {
            if healthy {
                info!("backend {} is healthy again", backend_id);
                self.emit(GatewayEvent::BackendHealthy {
                    backend_id: backend_id.to_string(),
                    response_time_ms: response_time.as_millis() as u64,
                });
            } else {
                warn!(
                    "backend {} is unhealthy: {}",
                    backend_id,
                    error.as_deref().unwrap_or("unknown")
                );
                self.emit(GatewayEvent::BackendUnhealthy {
                    backend_id: backend_id.to_string(),
                    error: error.unwrap_or_default(),
                    response_time_ms: response_time.as_millis() as u64,
                });
            }
        }
    }

    fn emit(&self, event: GatewayEvent) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(event);
        }
    }
}
