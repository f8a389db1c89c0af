use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

/// Typed events emitted by the gateway core.
///
/// The observer bus lives outside this crate; the core only hands fully
/// formed events to an [`EventEmitter`]. Event names are stable string
/// literals in CloudEvents style.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEvent {
    RequestReceived {
        method: String,
        path: String,
        tenant_id: Option<String>,
    },
    RequestProcessed {
        method: String,
        path: String,
        status: u16,
        tenant_id: Option<String>,
        duration_ms: u64,
    },
    RequestFailed {
        method: String,
        path: String,
        status: u16,
        error: String,
        tenant_id: Option<String>,
    },
    BackendAdded {
        backend_id: String,
        url: String,
    },
    BackendRemoved {
        backend_id: String,
    },
    BackendHealthy {
        backend_id: String,
        response_time_ms: u64,
    },
    BackendUnhealthy {
        backend_id: String,
        error: String,
        response_time_ms: u64,
    },
    CircuitBreakerOpen {
        backend_id: String,
        failure_count: u64,
    },
    CircuitBreakerHalfOpen {
        backend_id: String,
    },
    CircuitBreakerClosed {
        backend_id: String,
    },
    LoadBalanceDecision {
        selected_backend: String,
        healthy_candidates: usize,
        strategy: String,
    },
    LoadBalanceRoundRobin {
        backend_group: String,
        current_index: usize,
        selected_backend: String,
    },
    DryRunComparison {
        endpoint: String,
        primary_backend: String,
        secondary_backend: String,
        status_code_match: bool,
        headers_match: bool,
        body_match: bool,
        differences: Vec<String>,
        primary_response_time_ms: u64,
        secondary_response_time_ms: u64,
    },
    FeatureFlagEvaluated {
        flag_id: String,
        tenant_id: Option<String>,
        value: bool,
        source: String,
    },
    CacheHit {
        key: String,
    },
    CacheMiss {
        key: String,
    },
    ConfigLoaded {
        tenant_id: Option<String>,
    },
    TenantRegistered {
        tenant_id: String,
    },
    TenantRemoved {
        tenant_id: String,
    },
    ModuleStarted {
        backends: usize,
        routes: usize,
    },
    ModuleStopped,
}

impl GatewayEvent {
    /// Stable CloudEvents-style name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::RequestReceived { .. } => "request.received",
            GatewayEvent::RequestProcessed { .. } => "request.processed",
            GatewayEvent::RequestFailed { .. } => "request.failed",
            GatewayEvent::BackendAdded { .. } => "backend.added",
            GatewayEvent::BackendRemoved { .. } => "backend.removed",
            GatewayEvent::BackendHealthy { .. } => "backend.healthy",
            GatewayEvent::BackendUnhealthy { .. } => "backend.unhealthy",
            GatewayEvent::CircuitBreakerOpen { .. } => "circuit-breaker.open",
            GatewayEvent::CircuitBreakerHalfOpen { .. } => "circuit-breaker.half-open",
            GatewayEvent::CircuitBreakerClosed { .. } => "circuit-breaker.closed",
            GatewayEvent::LoadBalanceDecision { .. } => "load-balance.decision",
            GatewayEvent::LoadBalanceRoundRobin { .. } => "load-balance.round-robin",
            GatewayEvent::DryRunComparison { .. } => "dry-run.comparison",
            GatewayEvent::FeatureFlagEvaluated { .. } => "feature-flag.evaluated",
            GatewayEvent::CacheHit { .. } => "cache.hit",
            GatewayEvent::CacheMiss { .. } => "cache.miss",
            GatewayEvent::ConfigLoaded { .. } => "config.loaded",
            GatewayEvent::TenantRegistered { .. } => "tenant.registered",
            GatewayEvent::TenantRemoved { .. } => "tenant.removed",
            GatewayEvent::ModuleStarted { .. } => "module.started",
            GatewayEvent::ModuleStopped => "module.stopped",
        }
    }

    /// Wraps the event in an envelope with id and timestamp, serialized as
    /// the data payload the external bus expects.
    pub fn to_envelope(&self) -> serde_json::Value {
        json!({
            "id": Uuid::new_v4().to_string(),
            "type": self.name(),
            "time": Utc::now().to_rfc3339(),
            "data": serde_json::to_value(self).unwrap_or_default(),
        })
    }
}

/// Sink for gateway events. Implementations must be cheap: emission happens
/// on the request path.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

/// Default emitter that writes structured JSON lines through the `log`
/// facade.
#[derive(Debug, Default, Clone)]
pub struct LogEmitter;

impl EventEmitter for LogEmitter {
    fn emit(&self, event: GatewayEvent) {
        info!(
            "event {} {}",
            event.name(),
            serde_json::to_string(&event).unwrap_or_default()
        );
    }
}

/// Test emitter that records events in memory.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: std::sync::Mutex<Vec<GatewayEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<GatewayEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: GatewayEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Timestamp helper shared by health snapshots and events.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
