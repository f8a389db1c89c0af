//! Configuration validation with detailed error reporting.
//!
//! Validation runs once at startup, before the module is constructed.
//! Errors are fatal; warnings are logged and startup continues.

use crate::models::settings::{CompositeStrategy, MapReduceSettings, MergeStrategy, Settings};
use log::{info, warn};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-reference validator for the gateway configuration.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Performs comprehensive validation of gateway settings.
    pub fn validate_comprehensive(settings: &Settings) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_backends(settings, &mut result);
        Self::validate_routes(settings, &mut result);
        Self::validate_composite_routes(settings, &mut result);
        Self::validate_route_configs(settings, &mut result);
        Self::validate_tenants(settings, &mut result);
        Self::log_validation_results(&result);

        result
    }

    fn backend_exists(settings: &Settings, id: &str) -> bool {
        settings.backend_services.contains_key(id)
            || settings
                .backend_configs
                .get(id)
                .and_then(|c| c.url.as_ref())
                .is_some()
    }

    fn validate_backends(settings: &Settings, result: &mut ValidationResult) {
        if settings.backend_services.is_empty() && settings.backend_configs.is_empty() {
            result.add_error(
                "No backends configured - gateway will not handle any requests".to_string(),
            );
        }

        for (id, url) in &settings.backend_services {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                result.add_error(format!(
                    "Backend '{}' URL must start with http:// or https://",
                    id
                ));
            }
            if url.starts_with("http://") && !url.contains("localhost") && !url.contains("127.0.0.1")
            {
                result.add_warning(format!(
                    "Backend '{}' uses insecure HTTP - consider HTTPS for production",
                    id
                ));
            }
        }

        if !settings.default_backend.is_empty()
            && !Self::backend_exists(settings, &settings.default_backend)
        {
            result.add_error(format!(
                "Default backend '{}' is not a configured backend",
                settings.default_backend
            ));
        }

        for (id, cfg) in &settings.backend_configs {
            if let Some(alt) = &cfg.alternative_backend {
                if !Self::backend_exists(settings, alt) {
                    result.add_error(format!(
                        "Backend '{}' alternative backend '{}' is not configured",
                        id, alt
                    ));
                }
            }
        }
    }

    fn validate_routes(settings: &Settings, result: &mut ValidationResult) {
        for (pattern, target) in &settings.routes {
            if !pattern.starts_with('/') {
                result.add_error(format!("Route pattern '{}' must start with '/'", pattern));
            }
            if pattern.contains("..") {
                result.add_error(format!("Path traversal in route pattern '{}'", pattern));
            }
            if target.is_empty() {
                result.add_error(format!("Route '{}' has an empty target", pattern));
                continue;
            }
            if settings.composite_routes.contains_key(target) {
                continue;
            }
            for backend_id in target.split(',').map(str::trim) {
                if !Self::backend_exists(settings, backend_id) {
                    result.add_error(format!(
                        "Route '{}' targets unknown backend '{}'",
                        pattern, backend_id
                    ));
                }
            }
        }
    }

    fn validate_composite_routes(settings: &Settings, result: &mut ValidationResult) {
        for (name, composite) in &settings.composite_routes {
            if composite.backends.is_empty() {
                result.add_error(format!("Composite route '{}' lists no backends", name));
            }
            for backend_id in &composite.backends {
                if !Self::backend_exists(settings, backend_id) {
                    result.add_error(format!(
                        "Composite route '{}' references unknown backend '{}'",
                        name, backend_id
                    ));
                }
            }

            match (&composite.strategy, &composite.map_reduce) {
                (CompositeStrategy::MapReduce, None) => {
                    result.add_error(format!(
                        "Composite route '{}' uses map-reduce without a map_reduce config",
                        name
                    ));
                }
                (CompositeStrategy::MapReduce, Some(mr)) => {
                    Self::validate_map_reduce(settings, name, mr, result);
                }
                (_, Some(_)) => {
                    result.add_warning(format!(
                        "Composite route '{}' has a map_reduce config but strategy is not map-reduce",
                        name
                    ));
                }
                _ => {}
            }
        }
    }

    fn validate_map_reduce(
        settings: &Settings,
        name: &str,
        mr: &MapReduceSettings,
        result: &mut ValidationResult,
    ) {
        match mr {
            MapReduceSettings::Sequential {
                source_backend,
                target_backend,
                extract_path,
                extract_field,
                target_request_field,
                merge_strategy,
                ..
            } => {
                for backend in [source_backend, target_backend] {
                    if !Self::backend_exists(settings, backend) {
                        result.add_error(format!(
                            "Map-reduce route '{}' references unknown backend '{}'",
                            name, backend
                        ));
                    }
                }
                for (field, value) in [
                    ("extract_path", extract_path),
                    ("extract_field", extract_field),
                    ("target_request_field", target_request_field),
                ] {
                    if value.is_empty() {
                        result.add_error(format!(
                            "Map-reduce route '{}' is missing {}",
                            name, field
                        ));
                    }
                }
                if *merge_strategy == MergeStrategy::Join {
                    result.add_error(format!(
                        "Map-reduce route '{}': join is not valid in sequential mode",
                        name
                    ));
                }
            }
            MapReduceSettings::Parallel {
                backends,
                join_field,
                merge_strategy,
                ..
            } => {
                if backends.is_empty() {
                    result.add_error(format!(
                        "Map-reduce route '{}' lists no parallel backends",
                        name
                    ));
                }
                for backend in backends {
                    if !Self::backend_exists(settings, backend) {
                        result.add_error(format!(
                            "Map-reduce route '{}' references unknown backend '{}'",
                            name, backend
                        ));
                    }
                }
                if *merge_strategy == MergeStrategy::Join
                    && join_field.as_deref().unwrap_or("").is_empty()
                {
                    result.add_error(format!(
                        "Map-reduce route '{}' uses join without a join_field",
                        name
                    ));
                }
            }
        }
    }

    fn validate_route_configs(settings: &Settings, result: &mut ValidationResult) {
        for (pattern, cfg) in &settings.route_configs {
            if !settings.routes.contains_key(pattern) {
                result.add_warning(format!(
                    "Route config for '{}' has no matching route",
                    pattern
                ));
            }
            if let Some(alt) = &cfg.alternative_backend {
                if !Self::backend_exists(settings, alt) {
                    result.add_error(format!(
                        "Route '{}' alternative backend '{}' is not configured",
                        pattern, alt
                    ));
                }
            }
            if cfg.dry_run {
                match &cfg.dry_run_backend {
                    Some(shadow) if Self::backend_exists(settings, shadow) => {}
                    Some(shadow) => result.add_error(format!(
                        "Route '{}' dry-run backend '{}' is not configured",
                        pattern, shadow
                    )),
                    None => result.add_warning(format!(
                        "Route '{}' enables dry_run without a dry_run_backend",
                        pattern
                    )),
                }
            }
            if cfg.feature_flag_id.is_some()
                && cfg.alternative_backend.is_none()
                && !settings.feature_flags.enabled
            {
                result.add_warning(format!(
                    "Route '{}' is flag-gated but feature flags are disabled globally",
                    pattern
                ));
            }
            if cfg.timeout > 300 {
                result.add_warning(format!(
                    "Route '{}' timeout of {}s is unusually high",
                    pattern, cfg.timeout
                ));
            }
        }
    }

    fn validate_tenants(settings: &Settings, result: &mut ValidationResult) {
        for (tenant_id, overlay) in &settings.tenants {
            if !overlay.tenants.is_empty() {
                result.add_warning(format!(
                    "Tenant '{}' overlay nests a tenants map, which is ignored",
                    tenant_id
                ));
            }
            for (id, url) in &overlay.backend_services {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    result.add_error(format!(
                        "Tenant '{}' backend '{}' URL must start with http:// or https://",
                        tenant_id, id
                    ));
                }
            }
        }
    }

    fn log_validation_results(result: &ValidationResult) {
        for error in &result.errors {
            warn!("config error: {}", error);
        }
        for warning in &result.warnings {
            warn!("config warning: {}", warning);
        }
        if result.is_valid {
            info!(
                "Configuration validated successfully with {} warnings",
                result.warnings.len()
            );
        }
    }
}
