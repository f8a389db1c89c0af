use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default tenant header name, used when `tenant_id_header` is not set.
pub const DEFAULT_TENANT_HEADER: &str = "X-Tenant-ID";

/// Default global request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default response cache TTL in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Complete configuration for the gateway core.
///
/// The same structure describes the global configuration and each tenant
/// overlay: a tenant entry under [`Settings::tenants`] is a partial
/// `Settings` whose set fields win over the global values (see
/// `config::merge`). "Set" means non-empty for strings and maps, non-zero
/// for durations, and `true` for booleans.
///
/// # Configuration File Format
///
/// ```json
/// {
///   "version": 1,
///   "backend_services": {
///     "users": "http://users.internal:8080",
///     "billing": "http://billing.internal:8080"
///   },
///   "routes": {
///     "/api/users/*": "users",
///     "/api/reports": "users,billing"
///   },
///   "tenant_id_header": "X-Tenant-ID",
///   "require_tenant_id": false,
///   "request_timeout": 30
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Settings {
    /// Configuration schema version for compatibility checking.
    pub version: u8,

    /// Backend ID to origin URL (scheme + host + port).
    pub backend_services: HashMap<String, String>,

    /// Backend used when a request matches no configured route.
    /// Empty string means "no default backend".
    pub default_backend: String,

    /// Route pattern to target. The target is a single backend ID, a
    /// comma-separated backend list (round-robin group), or the name of an
    /// entry in [`Settings::composite_routes`].
    pub routes: HashMap<String, String>,

    /// Per-route extras (timeout, feature flag, dry-run), keyed by pattern.
    pub route_configs: HashMap<String, RouteSettings>,

    /// Composite route definitions, keyed by name.
    pub composite_routes: HashMap<String, CompositeRouteSettings>,

    /// Per-backend configuration (transforms, endpoints, health, breaker),
    /// keyed by backend ID.
    pub backend_configs: HashMap<String, BackendSettings>,

    /// Global path rewriting, lowest rung of the precedence ladder
    /// (endpoint > backend > global).
    pub path_rewriting: PathRewriteSettings,

    /// Global request-header rewriting.
    pub header_rewriting: HeaderRewriteSettings,

    /// Global response-header rewriting.
    pub response_header_rewriting: ResponseHeaderRewriteSettings,

    /// Header carrying the tenant ID. Defaults to `X-Tenant-ID`.
    pub tenant_id_header: String,

    /// When `true`, requests without the tenant header are rejected with 400.
    pub require_tenant_id: bool,

    /// Global request timeout in seconds. `0` means "not set" (the
    /// [`DEFAULT_REQUEST_TIMEOUT_SECS`] default applies).
    pub request_timeout: u64,

    /// Enables the GET response cache.
    pub cache_enabled: bool,

    /// Response cache TTL in seconds. `0` means "not set".
    pub cache_ttl: u64,

    /// Global health-check configuration; per-backend overrides live in
    /// [`BackendSettings::health_check`].
    pub health_check: HealthCheckSettings,

    /// Global circuit-breaker configuration; per-backend overrides live in
    /// [`BackendSettings::circuit_breaker`].
    pub circuit_breaker: CircuitBreakerSettings,

    /// Feature flag defaults consulted by the built-in config evaluator.
    pub feature_flags: FeatureFlagSettings,

    /// Dry-run (shadow traffic comparison) configuration.
    pub dry_run: DryRunSettings,

    /// Retry and error-page behavior.
    pub error_handling: ErrorHandlingSettings,

    /// Debug endpoint exposure.
    pub debug_endpoints: DebugEndpointSettings,

    /// Tenant overlays keyed by tenant ID. Only meaningful in the global
    /// configuration; nested tenant maps inside an overlay are ignored.
    pub tenants: HashMap<String, Settings>,
}

impl Settings {
    /// Effective tenant header name.
    pub fn tenant_header(&self) -> &str {
        if self.tenant_id_header.is_empty() {
            DEFAULT_TENANT_HEADER
        } else {
            &self.tenant_id_header
        }
    }

    /// Effective global request timeout.
    pub fn global_timeout(&self) -> Duration {
        let secs = if self.request_timeout == 0 {
            DEFAULT_REQUEST_TIMEOUT_SECS
        } else {
            self.request_timeout
        };
        Duration::from_secs(secs)
    }

    /// Effective cache TTL.
    pub fn cache_ttl(&self) -> Duration {
        let secs = if self.cache_ttl == 0 {
            DEFAULT_CACHE_TTL_SECS
        } else {
            self.cache_ttl
        };
        Duration::from_secs(secs)
    }

    /// True when caching is enabled globally or by any tenant overlay.
    ///
    /// Tenant-only caching is a supported configuration, so the cache must
    /// be constructed whenever any scope turns it on.
    pub fn cache_required(&self) -> bool {
        self.cache_enabled || self.tenants.values().any(|t| t.cache_enabled)
    }

    /// Resolves the origin URL for a backend ID, preferring a per-backend
    /// `url` override over the `backend_services` entry.
    pub fn backend_url(&self, backend_id: &str) -> Option<&str> {
        if let Some(cfg) = self.backend_configs.get(backend_id) {
            if let Some(url) = &cfg.url {
                if !url.is_empty() {
                    return Some(url);
                }
            }
        }
        self.backend_services.get(backend_id).map(|s| s.as_str())
    }
}

/// Per-route configuration extras.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RouteSettings {
    /// Route-level timeout in seconds. `0` means "use the global timeout".
    pub timeout: u64,

    /// Feature flag gating this route.
    pub feature_flag_id: Option<String>,

    /// Backend served when the feature flag evaluates to `false`.
    pub alternative_backend: Option<String>,

    /// Enables dual dispatch for this route.
    pub dry_run: bool,

    /// Shadow backend for dry-run comparison.
    pub dry_run_backend: Option<String>,
}

/// Strategy for a composite route.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompositeStrategy {
    /// Parallel fan-out with the default (or custom) merge.
    #[default]
    Merge,
    /// Parallel fan-out, explicit.
    Parallel,
    /// One backend at a time in configured order.
    Sequential,
    /// Hand off to the map/reduce engine.
    MapReduce,
}

/// A route whose handler calls several backends and merges the responses.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CompositeRouteSettings {
    /// Request pattern served by this composite route.
    pub pattern: String,

    /// Ordered backend IDs. Order is a determinism contract: the default
    /// merge picks the first configured backend that responded, and the
    /// map/reduce `join` base is the first entry.
    pub backends: Vec<String>,

    /// Fan-out strategy.
    pub strategy: CompositeStrategy,

    /// Map/reduce configuration, required when `strategy` is `map-reduce`.
    pub map_reduce: Option<MapReduceSettings>,

    /// Feature flag gating this composite route.
    pub feature_flag_id: Option<String>,

    /// Backend served when the feature flag evaluates to `false`.
    pub alternative_backend: Option<String>,
}

/// How two JSON documents (or N fan-out responses) are combined.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// `{ "<source_id>": source, "<target_id>": target }`.
    Nested,
    /// Top-level key union; target wins on collisions.
    Flat,
    /// `source[merge_into_field] = target`.
    Enrich,
    /// Row-level join by a shared field (parallel mode only).
    Join,
}

fn default_target_method() -> String {
    "POST".to_string()
}

/// Map/reduce engine configuration, tagged by `type`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapReduceSettings {
    /// Call the source backend, extract values from its JSON response,
    /// issue one dependent request to the target backend, merge.
    Sequential {
        source_backend: String,
        target_backend: String,
        /// Dot-separated path to the collection in the source response.
        extract_path: String,
        /// Field read from each element at `extract_path`.
        extract_field: String,
        /// Path of the dependent request sent to the target backend.
        target_request_path: String,
        /// Method of the dependent request, `POST` by default.
        #[serde(default = "default_target_method")]
        target_request_method: String,
        /// JSON body field carrying the extracted values.
        target_request_field: String,
        merge_strategy: MergeStrategy,
        /// When `true`, an empty extraction or failed dependent call
        /// returns the source response unchanged instead of 204/502.
        #[serde(default)]
        allow_empty_responses: bool,
        /// Field name used by the `enrich` strategy (default
        /// `enriched_data`).
        #[serde(default)]
        merge_into_field: Option<String>,
    },
    /// Query all listed backends concurrently and combine the responses.
    Parallel {
        backends: Vec<String>,
        /// Field joined on when `merge_strategy` is `join`.
        #[serde(default)]
        join_field: Option<String>,
        merge_strategy: MergeStrategy,
        /// Drop base rows that have no match in an ancillary backend.
        #[serde(default)]
        filter_on_empty: bool,
        /// When `true`, zero successful branches yields `{}` with 200.
        #[serde(default)]
        allow_empty_responses: bool,
        #[serde(default)]
        merge_into_field: Option<String>,
    },
}

/// Hostname handling policy for outbound requests.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostnamePolicy {
    /// Forward the client's `Host` header to the backend.
    #[default]
    PreserveOriginal,
    /// Use the backend origin's host.
    UseBackend,
    /// Use the configured `custom_hostname`.
    UseCustom,
}

/// Path rewriting rules applied before proxying.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PathRewriteSettings {
    /// Prefix removed from the incoming path when it matches.
    pub strip_base_path: String,

    /// Prefix prepended after stripping.
    pub base_path_rewrite: String,

    /// Pattern-scoped substitutions applied after the base rewrites.
    pub endpoint_rewrites: Vec<EndpointRewriteRule>,
}

impl PathRewriteSettings {
    pub fn is_empty(&self) -> bool {
        self.strip_base_path.is_empty()
            && self.base_path_rewrite.is_empty()
            && self.endpoint_rewrites.is_empty()
    }
}

/// One endpoint rewrite: exact or trailing-`*` pattern to replacement.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct EndpointRewriteRule {
    pub pattern: String,
    pub replacement: String,
    /// Drop the query string when this rule fires.
    pub strip_query_params: bool,
}

/// Request-header rewriting: set then remove.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HeaderRewriteSettings {
    pub set_headers: HashMap<String, String>,
    pub remove_headers: Vec<String>,
}

impl HeaderRewriteSettings {
    pub fn is_empty(&self) -> bool {
        self.set_headers.is_empty() && self.remove_headers.is_empty()
    }
}

/// Response-header rewriting, same shape as the request side.
pub type ResponseHeaderRewriteSettings = HeaderRewriteSettings;

/// Per-endpoint overrides inside a backend configuration, keyed by pattern.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct EndpointSettings {
    pub path_rewriting: Option<PathRewriteSettings>,
    pub header_rewriting: Option<HeaderRewriteSettings>,
    pub response_header_rewriting: Option<ResponseHeaderRewriteSettings>,
}

/// Per-backend configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct BackendSettings {
    /// Origin URL override; falls back to the `backend_services` entry.
    pub url: Option<String>,

    pub path_rewriting: PathRewriteSettings,
    pub header_rewriting: HeaderRewriteSettings,
    pub response_header_rewriting: ResponseHeaderRewriteSettings,

    pub hostname_handling: HostnamePolicy,
    /// Hostname used when `hostname_handling` is `use_custom`.
    pub custom_hostname: String,

    /// Pattern-scoped overrides, keyed by endpoint pattern.
    pub endpoints: HashMap<String, EndpointSettings>,

    pub health_check: Option<HealthCheckSettings>,
    pub circuit_breaker: Option<CircuitBreakerSettings>,

    /// Feature flag gating this backend (alternative served when off).
    pub feature_flag_id: Option<String>,
    pub alternative_backend: Option<String>,

    /// Retries for idempotent requests after network failures.
    pub max_retries: u32,
    /// Delay between retries in milliseconds.
    pub retry_delay_ms: u64,

    /// Outbound connection timeout in seconds. `0` means client default.
    pub connection_timeout: u64,
    /// Pool idle timeout in seconds. `0` means client default.
    pub idle_timeout: u64,
    /// Upper bound on queued requests for this backend. `0` means unbounded.
    pub queue_size: usize,
}

/// Health-check probe configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    /// Seconds between probes.
    pub interval: u64,
    /// Probe timeout in seconds.
    pub timeout: u64,
    /// Probes are skipped when a live request hit the backend within this
    /// many seconds. `0` disables suppression.
    pub recent_request_threshold: u64,
    /// Probe path, `/` by default.
    pub endpoint: String,
    /// Status codes counted as healthy.
    pub expected_status_codes: Vec<u16>,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 30,
            timeout: 5,
            recent_request_threshold: 0,
            endpoint: "/".to_string(),
            expected_status_codes: vec![200],
        }
    }
}

/// Circuit-breaker thresholds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u64,
    /// Half-open successes that close the circuit.
    pub success_threshold: u64,
    /// Seconds an open circuit waits before probing.
    pub open_timeout: u64,
    /// Concurrent probes admitted while half-open.
    pub half_open_allowed_requests: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: 30,
            half_open_allowed_requests: 1,
        }
    }
}

/// Feature flag defaults for the built-in config evaluator.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct FeatureFlagSettings {
    pub enabled: bool,
    pub flags: HashMap<String, bool>,
}

/// Dry-run (shadow comparison) configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DryRunSettings {
    pub enabled: bool,
    /// Log full response bodies alongside the diff summary.
    pub log_responses: bool,
    /// Bodies are compared up to this many bytes.
    pub max_response_size: usize,
    /// Headers included in the comparison. Empty means "all".
    pub compare_headers: Vec<String>,
    /// Headers excluded from the comparison even when listed above.
    pub ignore_headers: Vec<String>,
    /// Which side is returned to the client, `primary` unless overridden.
    pub default_response_backend: Option<String>,
}

impl Default for DryRunSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            log_responses: false,
            max_response_size: 1024 * 1024,
            compare_headers: Vec::new(),
            ignore_headers: Vec::new(),
            default_response_backend: None,
        }
    }
}

/// Retry / error-surface behavior.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ErrorHandlingSettings {
    pub enable_custom_pages: bool,
    /// Retries for idempotent requests after network-level failures.
    pub retry_attempts: u32,
    /// Delay between retries in milliseconds.
    pub retry_delay_ms: u64,
    /// Connect-phase retries folded into the same budget.
    pub connection_retries: u32,
}

/// Debug endpoint exposure.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DebugEndpointSettings {
    pub enabled: bool,
    /// Base path the debug scope is mounted under.
    pub base_path: String,
    /// Optional bearer token required on every debug request.
    pub bearer_token: Option<String>,
}

impl Default for DebugEndpointSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_path: "/debug".to_string(),
            bearer_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let s = Settings::default();
        assert_eq!(s.tenant_header(), DEFAULT_TENANT_HEADER);
        assert_eq!(s.global_timeout(), Duration::from_secs(30));
        assert_eq!(s.cache_ttl(), Duration::from_secs(300));
        assert!(!s.cache_required());
    }

    #[test]
    fn tenant_only_cache_counts_as_required() {
        let mut s = Settings::default();
        let overlay = Settings {
            cache_enabled: true,
            ..Default::default()
        };
        s.tenants.insert("acme".to_string(), overlay);
        assert!(s.cache_required());
    }

    #[test]
    fn backend_url_prefers_override() {
        let mut s = Settings::default();
        s.backend_services
            .insert("users".to_string(), "http://global:1".to_string());
        s.backend_configs.insert(
            "users".to_string(),
            BackendSettings {
                url: Some("http://override:2".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(s.backend_url("users"), Some("http://override:2"));
        assert_eq!(s.backend_url("missing"), None);
    }

    #[test]
    fn map_reduce_settings_deserialize_tagged() {
        let raw = r#"{
            "type": "sequential",
            "source_backend": "conversations",
            "target_backend": "followups",
            "extract_path": "conversations",
            "extract_field": "id",
            "target_request_path": "/bulk",
            "target_request_field": "conversation_ids",
            "merge_strategy": "enrich",
            "merge_into_field": "followup_data"
        }"#;
        let parsed: MapReduceSettings = serde_json::from_str(raw).unwrap();
        match parsed {
            MapReduceSettings::Sequential {
                target_request_method,
                merge_strategy,
                ..
            } => {
                assert_eq!(target_request_method, "POST");
                assert_eq!(merge_strategy, MergeStrategy::Enrich);
            }
            _ => panic!("expected sequential"),
        }
    }

    #[test]
    fn composite_strategy_kebab_case() {
        let s: CompositeStrategy = serde_json::from_str("\"map-reduce\"").unwrap();
        assert_eq!(s, CompositeStrategy::MapReduce);
    }
}
