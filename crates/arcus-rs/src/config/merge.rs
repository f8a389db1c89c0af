//! Tenant overlay merging.
//!
//! Produces the effective configuration for a tenant by layering the
//! tenant's partial [`Settings`] onto the global one. The merge never
//! mutates either input; callers get a fresh value, which is what keeps
//! tenant configurations from aliasing global state.
//!
//! Rules:
//! - scalar strings and durations: the overlay wins when non-empty/non-zero
//! - booleans: the overlay wins when `true` (`false` means "not set")
//! - maps (`backend_services`, `routes`, `route_configs`,
//!   `composite_routes`, `backend_configs`, `feature_flags.flags`):
//!   key-level merge, overlay entries replace same-key global entries and
//!   non-conflicting global keys are preserved
//! - nested structs: field-by-field with the same non-zero-wins rule

use crate::models::settings::{
    BackendSettings, CircuitBreakerSettings, DebugEndpointSettings, DryRunSettings,
    ErrorHandlingSettings, FeatureFlagSettings, HeaderRewriteSettings, HealthCheckSettings,
    PathRewriteSettings, RouteSettings, Settings,
};
use std::collections::HashMap;

/// Merges a tenant overlay onto the global configuration.
pub fn merge_settings(global: &Settings, overlay: &Settings) -> Settings {
    Settings {
        version: if overlay.version != 0 {
            overlay.version
        } else {
            global.version
        },
        backend_services: merge_map(&global.backend_services, &overlay.backend_services),
        default_backend: pick_string(&global.default_backend, &overlay.default_backend),
        routes: merge_map(&global.routes, &overlay.routes),
        route_configs: merge_map_with(&global.route_configs, &overlay.route_configs, merge_route),
        composite_routes: merge_map(&global.composite_routes, &overlay.composite_routes),
        backend_configs: merge_map_with(
            &global.backend_configs,
            &overlay.backend_configs,
            merge_backend,
        ),
        path_rewriting: merge_path_rewrite(&global.path_rewriting, &overlay.path_rewriting),
        header_rewriting: merge_header_rewrite(&global.header_rewriting, &overlay.header_rewriting),
        response_header_rewriting: merge_header_rewrite(
            &global.response_header_rewriting,
            &overlay.response_header_rewriting,
        ),
        tenant_id_header: pick_string(&global.tenant_id_header, &overlay.tenant_id_header),
        require_tenant_id: global.require_tenant_id || overlay.require_tenant_id,
        request_timeout: pick_u64(global.request_timeout, overlay.request_timeout),
        cache_enabled: global.cache_enabled || overlay.cache_enabled,
        cache_ttl: pick_u64(global.cache_ttl, overlay.cache_ttl),
        health_check: merge_health_check(&global.health_check, &overlay.health_check),
        circuit_breaker: merge_circuit_breaker(&global.circuit_breaker, &overlay.circuit_breaker),
        feature_flags: merge_feature_flags(&global.feature_flags, &overlay.feature_flags),
        dry_run: merge_dry_run(&global.dry_run, &overlay.dry_run),
        error_handling: merge_error_handling(&global.error_handling, &overlay.error_handling),
        debug_endpoints: merge_debug(&global.debug_endpoints, &overlay.debug_endpoints),
        // Tenant maps never nest.
        tenants: HashMap::new(),
    }
}

fn pick_string(global: &str, overlay: &str) -> String {
    if overlay.is_empty() { global } else { overlay }.to_string()
}

fn pick_u64(global: u64, overlay: u64) -> u64 {
    if overlay != 0 {
        overlay
    } else {
        global
    }
}

fn pick_u32(global: u32, overlay: u32) -> u32 {
    if overlay != 0 {
        overlay
    } else {
        global
    }
}

fn pick_usize(global: usize, overlay: usize) -> usize {
    if overlay != 0 {
        overlay
    } else {
        global
    }
}

fn pick_option<T: Clone>(global: &Option<T>, overlay: &Option<T>) -> Option<T> {
    overlay.clone().or_else(|| global.clone())
}

/// Key-level merge where overlay entries replace same-key entries wholesale.
fn merge_map<V: Clone>(
    global: &HashMap<String, V>,
    overlay: &HashMap<String, V>,
) -> HashMap<String, V> {
    let mut merged = global.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Key-level merge where colliding entries are themselves deep-merged.
fn merge_map_with<V: Clone>(
    global: &HashMap<String, V>,
    overlay: &HashMap<String, V>,
    merge: fn(&V, &V) -> V,
) -> HashMap<String, V> {
    let mut merged = global.clone();
    for (key, value) in overlay {
        let combined = match global.get(key) {
            Some(base) => merge(base, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

fn merge_route(global: &RouteSettings, overlay: &RouteSettings) -> RouteSettings {
    RouteSettings {
        timeout: pick_u64(global.timeout, overlay.timeout),
        feature_flag_id: pick_option(&global.feature_flag_id, &overlay.feature_flag_id),
        alternative_backend: pick_option(
            &global.alternative_backend,
            &overlay.alternative_backend,
        ),
        dry_run: global.dry_run || overlay.dry_run,
        dry_run_backend: pick_option(&global.dry_run_backend, &overlay.dry_run_backend),
    }
}

fn merge_path_rewrite(
    global: &PathRewriteSettings,
    overlay: &PathRewriteSettings,
) -> PathRewriteSettings {
    PathRewriteSettings {
        strip_base_path: pick_string(&global.strip_base_path, &overlay.strip_base_path),
        base_path_rewrite: pick_string(&global.base_path_rewrite, &overlay.base_path_rewrite),
        endpoint_rewrites: if overlay.endpoint_rewrites.is_empty() {
            global.endpoint_rewrites.clone()
        } else {
            overlay.endpoint_rewrites.clone()
        },
    }
}

fn merge_header_rewrite(
    global: &HeaderRewriteSettings,
    overlay: &HeaderRewriteSettings,
) -> HeaderRewriteSettings {
    HeaderRewriteSettings {
        set_headers: merge_map(&global.set_headers, &overlay.set_headers),
        remove_headers: if overlay.remove_headers.is_empty() {
            global.remove_headers.clone()
        } else {
            overlay.remove_headers.clone()
        },
    }
}

fn merge_backend(global: &BackendSettings, overlay: &BackendSettings) -> BackendSettings {
    BackendSettings {
        url: pick_option(&global.url, &overlay.url),
        path_rewriting: merge_path_rewrite(&global.path_rewriting, &overlay.path_rewriting),
        header_rewriting: merge_header_rewrite(&global.header_rewriting, &overlay.header_rewriting),
        response_header_rewriting: merge_header_rewrite(
            &global.response_header_rewriting,
            &overlay.response_header_rewriting,
        ),
        hostname_handling: if overlay.hostname_handling != Default::default() {
            overlay.hostname_handling
        } else {
            global.hostname_handling
        },
        custom_hostname: pick_string(&global.custom_hostname, &overlay.custom_hostname),
        endpoints: merge_map(&global.endpoints, &overlay.endpoints),
        health_check: pick_option(&global.health_check, &overlay.health_check),
        circuit_breaker: pick_option(&global.circuit_breaker, &overlay.circuit_breaker),
        feature_flag_id: pick_option(&global.feature_flag_id, &overlay.feature_flag_id),
        alternative_backend: pick_option(
            &global.alternative_backend,
            &overlay.alternative_backend,
        ),
        max_retries: pick_u32(global.max_retries, overlay.max_retries),
        retry_delay_ms: pick_u64(global.retry_delay_ms, overlay.retry_delay_ms),
        connection_timeout: pick_u64(global.connection_timeout, overlay.connection_timeout),
        idle_timeout: pick_u64(global.idle_timeout, overlay.idle_timeout),
        queue_size: pick_usize(global.queue_size, overlay.queue_size),
    }
}

fn merge_health_check(
    global: &HealthCheckSettings,
    overlay: &HealthCheckSettings,
) -> HealthCheckSettings {
    let defaults = HealthCheckSettings::default();
    HealthCheckSettings {
        enabled: global.enabled || overlay.enabled,
        interval: if overlay.interval != defaults.interval {
            overlay.interval
        } else {
            global.interval
        },
        timeout: if overlay.timeout != defaults.timeout {
            overlay.timeout
        } else {
            global.timeout
        },
        recent_request_threshold: pick_u64(
            global.recent_request_threshold,
            overlay.recent_request_threshold,
        ),
        endpoint: if overlay.endpoint != defaults.endpoint {
            overlay.endpoint.clone()
        } else {
            global.endpoint.clone()
        },
        expected_status_codes: if overlay.expected_status_codes != defaults.expected_status_codes {
            overlay.expected_status_codes.clone()
        } else {
            global.expected_status_codes.clone()
        },
    }
}

fn merge_circuit_breaker(
    global: &CircuitBreakerSettings,
    overlay: &CircuitBreakerSettings,
) -> CircuitBreakerSettings {
    let defaults = CircuitBreakerSettings::default();
    let pick = |g: u64, o: u64, d: u64| if o != d { o } else { g };
    CircuitBreakerSettings {
        enabled: global.enabled || overlay.enabled,
        failure_threshold: pick(
            global.failure_threshold,
            overlay.failure_threshold,
            defaults.failure_threshold,
        ),
        success_threshold: pick(
            global.success_threshold,
            overlay.success_threshold,
            defaults.success_threshold,
        ),
        open_timeout: pick(global.open_timeout, overlay.open_timeout, defaults.open_timeout),
        half_open_allowed_requests: pick(
            global.half_open_allowed_requests,
            overlay.half_open_allowed_requests,
            defaults.half_open_allowed_requests,
        ),
    }
}

fn merge_feature_flags(
    global: &FeatureFlagSettings,
    overlay: &FeatureFlagSettings,
) -> FeatureFlagSettings {
    // An overlay that only sets `flags` must not zero out `enabled`.
    FeatureFlagSettings {
        enabled: global.enabled || overlay.enabled,
        flags: merge_map(&global.flags, &overlay.flags),
    }
}

fn merge_dry_run(global: &DryRunSettings, overlay: &DryRunSettings) -> DryRunSettings {
    let defaults = DryRunSettings::default();
    DryRunSettings {
        enabled: global.enabled || overlay.enabled,
        log_responses: global.log_responses || overlay.log_responses,
        max_response_size: if overlay.max_response_size != defaults.max_response_size {
            overlay.max_response_size
        } else {
            global.max_response_size
        },
        compare_headers: if overlay.compare_headers.is_empty() {
            global.compare_headers.clone()
        } else {
            overlay.compare_headers.clone()
        },
        ignore_headers: if overlay.ignore_headers.is_empty() {
            global.ignore_headers.clone()
        } else {
            overlay.ignore_headers.clone()
        },
        default_response_backend: pick_option(
            &global.default_response_backend,
            &overlay.default_response_backend,
        ),
    }
}

fn merge_error_handling(
    global: &ErrorHandlingSettings,
    overlay: &ErrorHandlingSettings,
) -> ErrorHandlingSettings {
    ErrorHandlingSettings {
        enable_custom_pages: global.enable_custom_pages || overlay.enable_custom_pages,
        retry_attempts: pick_u32(global.retry_attempts, overlay.retry_attempts),
        retry_delay_ms: pick_u64(global.retry_delay_ms, overlay.retry_delay_ms),
        connection_retries: pick_u32(global.connection_retries, overlay.connection_retries),
    }
}

fn merge_debug(
    global: &DebugEndpointSettings,
    overlay: &DebugEndpointSettings,
) -> DebugEndpointSettings {
    let defaults = DebugEndpointSettings::default();
    DebugEndpointSettings {
        enabled: global.enabled || overlay.enabled,
        base_path: if overlay.base_path != defaults.base_path {
            overlay.base_path.clone()
        } else {
            global.base_path.clone()
        },
        bearer_token: pick_option(&global.bearer_token, &overlay.bearer_token),
    }
}
