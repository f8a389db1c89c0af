//! Request and response transformation pipeline.
//!
//! Transformations apply in a fixed order on the way in (path rewriting,
//! request headers, hostname) and on the way out (response headers, then
//! the optional custom modifier). Configuration is resolved along the
//! precedence ladder endpoint > backend > global; the tenant overlay is
//! merged into the effective settings before the ladder is walked, so it
//! affects all three levels.

use crate::models::settings::{
    EndpointRewriteRule, HeaderRewriteSettings, HostnamePolicy, PathRewriteSettings, Settings,
};
use crate::services::proxy::UpstreamResponse;
use crate::utils::path::host_of;
use crate::utils::route_matcher::{literal_prefix_len, pattern_matches};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use std::sync::Arc;

/// Custom response modifier, invoked after static response-header rewrites.
///
/// A returned error fails the request with 502, so clients can tell a
/// gateway-side modification failure from a backend 500.
pub trait ResponseModifier: Send + Sync {
    fn modify(
        &self,
        response: &mut UpstreamResponse,
        backend_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<(), String>;
}

/// Transformation pipeline resolved for one (backend, request path) pair.
#[derive(Clone, Default)]
pub struct TransformPipeline {
    strip_base_path: String,
    base_path_rewrite: String,
    /// Endpoint rules in precedence order: endpoint-level first, then
    /// backend, then global; each group sorted most-specific-first.
    endpoint_rewrites: Vec<EndpointRewriteRule>,
    /// Request-header levels in ascending priority (global, backend,
    /// endpoint); later levels override earlier ones.
    request_header_levels: Vec<HeaderRewriteSettings>,
    /// Response-header levels in ascending priority.
    response_header_levels: Vec<HeaderRewriteSettings>,
    hostname_policy: HostnamePolicy,
    custom_hostname: String,
    response_modifier: Option<Arc<dyn ResponseModifier>>,
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("strip_base_path", &self.strip_base_path)
            .field("base_path_rewrite", &self.base_path_rewrite)
            .field("endpoint_rewrites", &self.endpoint_rewrites.len())
            .field("hostname_policy", &self.hostname_policy)
            .finish()
    }
}

fn sort_rules(rules: &mut [EndpointRewriteRule]) {
    rules.sort_by(|a, b| {
        literal_prefix_len(&b.pattern)
            .cmp(&literal_prefix_len(&a.pattern))
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
}

impl TransformPipeline {
    /// Resolves the pipeline for a backend and request path against the
    /// (already tenant-merged) effective settings.
    pub fn build(settings: &Settings, backend_id: &str, request_path: &str) -> Self {
        let backend = settings.backend_configs.get(backend_id);

        // Most specific endpoint override whose pattern matches the path.
        let endpoint = backend.and_then(|b| {
            let mut candidates: Vec<(&String, _)> = b
                .endpoints
                .iter()
                .filter(|(pattern, _)| pattern_matches(pattern, request_path))
                .collect();
            candidates.sort_by(|(a, _), (b, _)| {
                literal_prefix_len(b).cmp(&literal_prefix_len(a)).then_with(|| a.cmp(b))
            });
            candidates.into_iter().next().map(|(_, cfg)| cfg)
        });

        let endpoint_path = endpoint.and_then(|e| e.path_rewriting.as_ref());
        let backend_path = backend.map(|b| &b.path_rewriting);
        let global_path = &settings.path_rewriting;

        let pick = |get: fn(&PathRewriteSettings) -> &String| -> String {
            for level in [endpoint_path, backend_path, Some(global_path)].into_iter().flatten() {
                let value = get(level);
                if !value.is_empty() {
                    return value.clone();
                }
            }
            String::new()
        };

        let mut endpoint_rewrites = Vec::new();
        for level in [endpoint_path, backend_path, Some(global_path)].into_iter().flatten() {
            let mut group = level.endpoint_rewrites.clone();
            sort_rules(&mut group);
            endpoint_rewrites.extend(group);
        }

        let mut request_header_levels = vec![settings.header_rewriting.clone()];
        let mut response_header_levels = vec![settings.response_header_rewriting.clone()];
        if let Some(b) = backend {
            request_header_levels.push(b.header_rewriting.clone());
            response_header_levels.push(b.response_header_rewriting.clone());
        }
        if let Some(e) = endpoint {
            if let Some(h) = &e.header_rewriting {
                request_header_levels.push(h.clone());
            }
            if let Some(h) = &e.response_header_rewriting {
                response_header_levels.push(h.clone());
            }
        }

        Self {
            strip_base_path: pick(|p| &p.strip_base_path),
            base_path_rewrite: pick(|p| &p.base_path_rewrite),
            endpoint_rewrites,
            request_header_levels,
            response_header_levels,
            hostname_policy: backend.map(|b| b.hostname_handling).unwrap_or_default(),
            custom_hostname: backend.map(|b| b.custom_hostname.clone()).unwrap_or_default(),
            response_modifier: None,
        }
    }

    pub fn with_response_modifier(mut self, modifier: Arc<dyn ResponseModifier>) -> Self {
        self.response_modifier = Some(modifier);
        self
    }

    pub fn response_modifier(&self) -> Option<&Arc<dyn ResponseModifier>> {
        self.response_modifier.as_ref()
    }

    /// Rewrites a request path: strip, prepend, then the first matching
    /// endpoint rule. Returns the rewritten path and whether the matching
    /// rule asked for the query string to be dropped.
    pub fn rewrite_path(&self, path: &str) -> (String, bool) {
        let mut current = path.to_string();

        if !self.strip_base_path.is_empty() {
            if let Some(stripped) = current.strip_prefix(&self.strip_base_path) {
                current = if stripped.starts_with('/') {
                    stripped.to_string()
                } else {
                    format!("/{}", stripped)
                };
            }
        }

        if !self.base_path_rewrite.is_empty() {
            let prefix = self.base_path_rewrite.trim_end_matches('/');
            current = format!("{}{}", prefix, current);
        }

        for rule in &self.endpoint_rewrites {
            if let Some(rewritten) = apply_rewrite_rule(rule, &current) {
                return (rewritten, rule.strip_query_params);
            }
        }

        (current, false)
    }

    /// Applies request-header rewrites: per level, sets then removes, levels
    /// in ascending priority.
    pub fn apply_request_headers(&self, headers: &mut HeaderMap) {
        for level in &self.request_header_levels {
            apply_header_level(level, headers);
        }
    }

    /// Applies response-header rewrites along the ladder.
    pub fn apply_response_headers(&self, headers: &mut HeaderMap) {
        for level in &self.response_header_levels {
            apply_header_level(level, headers);
        }
    }

    /// Resolves the outbound `Host` header value, `None` when the client's
    /// host should be dropped and the HTTP client's default used.
    pub fn resolve_host(&self, original_host: Option<&str>, origin: &str) -> Option<String> {
        match self.hostname_policy {
            HostnamePolicy::PreserveOriginal => original_host.map(String::from),
            HostnamePolicy::UseBackend => Some(host_of(origin).to_string()),
            HostnamePolicy::UseCustom => {
                if self.custom_hostname.is_empty() {
                    Some(host_of(origin).to_string())
                } else {
                    Some(self.custom_hostname.clone())
                }
            }
        }
    }
}

/// Applies one rewrite rule, returning the rewritten path on match.
fn apply_rewrite_rule(rule: &EndpointRewriteRule, path: &str) -> Option<String> {
    match rule.pattern.strip_suffix('*') {
        None => {
            if rule.pattern == path {
                Some(rule.replacement.clone())
            } else {
                None
            }
        }
        Some(prefix) => {
            if !path.starts_with(prefix) {
                return None;
            }
            let tail = path[prefix.len()..].trim_start_matches('/');
            let mut out = rule.replacement.trim_end_matches('/').to_string();
            if !tail.is_empty() {
                out.push('/');
                out.push_str(tail);
            }
            if out.is_empty() {
                out.push('/');
            }
            Some(out)
        }
    }
}

/// Sets then removes headers for one level. Removal wins over a set at the
/// same level; header names go through `HeaderName` parsing, which gives
/// case-insensitive HTTP semantics.
fn apply_header_level(level: &HeaderRewriteSettings, headers: &mut HeaderMap) {
    for (name, value) in &level.set_headers {
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
    for name in &level.remove_headers {
        if let Ok(name) = HeaderName::from_str(name) {
            headers.remove(&name);
        }
    }
}
