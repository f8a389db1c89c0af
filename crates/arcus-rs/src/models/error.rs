use actix_web::{http::StatusCode, HttpResponse};
use serde_json::json;

/// Error taxonomy for the gateway core.
///
/// Every user-visible failure maps to exactly one HTTP status through the
/// [`actix_web::ResponseError`] implementation below. Error bodies carry a
/// short textual reason and a stable `type` tag; upstream URLs and internal
/// details stay in the logs.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request deadline elapsed before the upstream answered.
    #[error("Request timeout after {seconds}s")]
    Timeout { seconds: u64 },

    /// The upstream could not be reached or answered with a transport error.
    #[error("Upstream service error for backend '{backend}': {message}")]
    Upstream { backend: String, message: String },

    /// The backend's circuit breaker is open; no outbound call was made.
    #[error("Circuit open for backend '{backend}'")]
    CircuitOpen { backend: String },

    /// A round-robin group had no healthy candidate left.
    #[error("No healthy backend available in group '{group}'")]
    NoHealthyBackend { group: String },

    /// No configured route matched the request path.
    #[error("No route found for path '{path}'")]
    RouteNotFound { path: String },

    /// A feature-flag-gated route is disabled and has no alternative backend.
    #[error("Route '{path}' is not available")]
    RouteDisabled { path: String },

    /// Tenant ID is required by configuration but the header was absent.
    #[error("Missing required tenant header '{header}'")]
    TenantRequired { header: String },

    /// A route referenced a backend ID that is not configured.
    #[error("Backend '{backend}' is not configured")]
    BackendNotFound { backend: String },

    /// Invalid configuration detected at runtime (init-time config errors
    /// are returned as plain `Err` before the server starts).
    #[error("Invalid gateway configuration: {message}")]
    Config { message: String },

    /// Composite or map/reduce merging failed.
    #[error("Response merge failed: {message}")]
    Merge { message: String },

    /// A custom response modifier callback failed.
    #[error("Response modifier failed for backend '{backend}': {message}")]
    ResponseModifier { backend: String, message: String },

    /// Catch-all for internal invariant violations.
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Upstream { .. } => "upstream",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::NoHealthyBackend { .. } => "no_healthy_backend",
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::RouteDisabled { .. } => "route_disabled",
            GatewayError::TenantRequired { .. } => "tenant_required",
            GatewayError::BackendNotFound { .. } => "backend_not_found",
            GatewayError::Config { .. } => "config",
            GatewayError::Merge { .. } => "merge",
            GatewayError::ResponseModifier { .. } => "response_modifier",
            GatewayError::Internal { .. } => "internal",
        }
    }
}

impl actix_web::error::ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoHealthyBackend { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::RouteDisabled { .. } => StatusCode::NOT_FOUND,
            GatewayError::TenantRequired { .. } => StatusCode::BAD_REQUEST,
            GatewayError::BackendNotFound { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Config { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Merge { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ResponseModifier { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.to_string(),
            "type": self.error_type(),
        }))
    }
}
