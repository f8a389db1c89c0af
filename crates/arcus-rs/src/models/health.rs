use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time health snapshot for one backend.
///
/// Published by the health checker and served verbatim by the
/// `/health-checks` debug endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthStatus {
    pub backend_id: String,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Duration of the most recent probe in milliseconds.
    pub response_time_ms: u64,
    pub dns_resolved: bool,
    pub resolved_ips: Vec<String>,
    pub total_checks: u64,
    pub successful_checks: u64,
    /// Probes skipped because live traffic recently hit the backend.
    pub checks_skipped: u64,
    pub circuit_breaker_open: bool,
    pub circuit_breaker_state: String,
    pub circuit_failure_count: u64,
}

impl HealthStatus {
    /// A fresh snapshot for a backend that has not been probed yet.
    ///
    /// Unprobed backends count as healthy: only an explicit failed probe or
    /// an open circuit excludes a backend from selection.
    pub fn unknown(backend_id: &str) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            healthy: true,
            last_check: None,
            last_success: None,
            last_error: None,
            response_time_ms: 0,
            dns_resolved: false,
            resolved_ips: Vec::new(),
            total_checks: 0,
            successful_checks: 0,
            checks_skipped: 0,
            circuit_breaker_open: false,
            circuit_breaker_state: "closed".to_string(),
            circuit_failure_count: 0,
        }
    }
}
