//! Dry-run dual dispatch.
//!
//! The request is sent to a primary and a shadow backend concurrently. The
//! primary response goes back to the client untouched; the shadow response
//! is diffed against it, the comparison is emitted as an event and a log
//! line, and the shadow body is then discarded. Shadow failures never reach
//! the client.

use crate::models::error::GatewayError;
use crate::models::events::{EventEmitter, GatewayEvent};
use crate::models::settings::DryRunSettings;
use crate::services::proxy::{ProxyRequest, UpstreamResponse};
use crate::services::registry::BackendCaller;
use actix_web::HttpResponse;
use log::{info, warn};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Headers excluded from comparison even when listed in `compare_headers`.
static DEFAULT_IGNORED_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["date", "x-request-id", "server", "set-cookie", "connection"]
        .into_iter()
        .collect()
});

/// Outcome of diffing the primary and shadow responses.
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub endpoint: String,
    pub primary_backend: String,
    pub secondary_backend: String,
    pub status_code_match: bool,
    pub headers_match: bool,
    pub body_match: bool,
    pub differences: Vec<String>,
    pub primary_response_time: Duration,
    pub secondary_response_time: Duration,
}

impl ComparisonResult {
    pub fn matches(&self) -> bool {
        self.status_code_match && self.headers_match && self.body_match
    }
}

/// Dual-dispatch handler.
pub struct DryRunHandler {
    caller: Arc<dyn BackendCaller>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl DryRunHandler {
    pub fn new(caller: Arc<dyn BackendCaller>, emitter: Option<Arc<dyn EventEmitter>>) -> Self {
        Self { caller, emitter }
    }

    /// Sends the buffered request to both backends, returns one response
    /// to the client, and emits the comparison.
    ///
    /// The primary response is returned unless
    /// `default_response_backend` names the shadow backend, in which case
    /// the shadow side is served. A failed shadow never reaches the
    /// client; when the served side fails, the other side is only a
    /// substitute if the operator asked for the shadow.
    pub async fn handle(
        &self,
        endpoint: &str,
        primary_backend: &str,
        shadow_backend: &str,
        config: &DryRunSettings,
        request: &ProxyRequest,
        deadline: Duration,
    ) -> Result<HttpResponse, GatewayError> {
        let (primary, shadow) = tokio::join!(
            self.caller.call(primary_backend, request, deadline),
            self.caller.call(shadow_backend, request, deadline),
        );

        let prefer_shadow = config.default_response_backend.as_deref() == Some(shadow_backend);

        match (primary, shadow) {
            (Ok(primary), Ok(shadow)) => {
                let comparison = compare_responses(endpoint, &primary, &shadow, config);
                self.report(&comparison, config, &primary, &shadow);
                if prefer_shadow {
                    Ok(shadow.to_http_response())
                } else {
                    Ok(primary.to_http_response())
                }
            }
            (Ok(primary), Err(e)) => {
                warn!(
                    "dry-run shadow backend {} failed for {}: {}",
                    shadow_backend, endpoint, e
                );
                self.emit(&branch_failure(
                    endpoint,
                    primary_backend,
                    shadow_backend,
                    format!("shadow request failed: {}", e),
                    primary.response_time,
                    Duration::ZERO,
                ));
                Ok(primary.to_http_response())
            }
            (Err(e), Ok(shadow)) if prefer_shadow => {
                warn!(
                    "dry-run primary backend {} failed for {}: {}",
                    primary_backend, endpoint, e
                );
                self.emit(&branch_failure(
                    endpoint,
                    primary_backend,
                    shadow_backend,
                    format!("primary request failed: {}", e),
                    Duration::ZERO,
                    shadow.response_time,
                ));
                Ok(shadow.to_http_response())
            }
            (Err(e), _) => Err(e),
        }
    }

    fn report(
        &self,
        comparison: &ComparisonResult,
        config: &DryRunSettings,
        primary: &UpstreamResponse,
        shadow: &UpstreamResponse,
    ) {
        if comparison.matches() {
            info!(
                "dry-run {}: {} and {} agree ({}ms / {}ms)",
                comparison.endpoint,
                comparison.primary_backend,
                comparison.secondary_backend,
                comparison.primary_response_time.as_millis(),
                comparison.secondary_response_time.as_millis(),
            );
        } else {
            warn!(
                "dry-run {}: {} and {} diverge: {}",
                comparison.endpoint,
                comparison.primary_backend,
                comparison.secondary_backend,
                comparison.differences.join("; "),
            );
        }

        if config.log_responses {
            let limit = config.max_response_size.min(4096);
            info!(
                "dry-run {} primary body: {}",
                comparison.endpoint,
                String::from_utf8_lossy(&primary.body[..primary.body.len().min(limit)])
            );
            info!(
                "dry-run {} shadow body: {}",
                comparison.endpoint,
                String::from_utf8_lossy(&shadow.body[..shadow.body.len().min(limit)])
            );
        }

        self.emit(comparison);
    }

    fn emit(&self, comparison: &ComparisonResult) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(GatewayEvent::DryRunComparison {
                endpoint: comparison.endpoint.clone(),
                primary_backend: comparison.primary_backend.clone(),
                secondary_backend: comparison.secondary_backend.clone(),
                status_code_match: comparison.status_code_match,
                headers_match: comparison.headers_match,
                body_match: comparison.body_match,
                differences: comparison.differences.clone(),
                primary_response_time_ms: comparison.primary_response_time.as_millis() as u64,
                secondary_response_time_ms: comparison.secondary_response_time.as_millis() as u64,
            });
        }
    }
}

fn branch_failure(
    endpoint: &str,
    primary_backend: &str,
    shadow_backend: &str,
    difference: String,
    primary_time: Duration,
    secondary_time: Duration,
) -> ComparisonResult {
    ComparisonResult {
        endpoint: endpoint.to_string(),
        primary_backend: primary_backend.to_string(),
        secondary_backend: shadow_backend.to_string(),
        status_code_match: false,
        headers_match: false,
        body_match: false,
        differences: vec![difference],
        primary_response_time: primary_time,
        secondary_response_time: secondary_time,
    }
}

/// Diffs two responses: status code, the configured header subset minus the
/// ignore list, and bodies up to `max_response_size` bytes.
pub fn compare_responses(
    endpoint: &str,
    primary: &UpstreamResponse,
    shadow: &UpstreamResponse,
    config: &DryRunSettings,
) -> ComparisonResult {
    let mut differences = Vec::new();

    let status_code_match = primary.status == shadow.status;
    if !status_code_match {
        differences.push(format!(
            "status: {} vs {}",
            primary.status.as_u16(),
            shadow.status.as_u16()
        ));
    }

    let ignored: HashSet<String> = config
        .ignore_headers
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect();
    let is_ignored = |name: &str| {
        DEFAULT_IGNORED_HEADERS.contains(name) || ignored.contains(name)
    };

    // With no explicit subset, every header present on either side is
    // compared.
    let compared: Vec<String> = if config.compare_headers.is_empty() {
        let mut names: Vec<String> = primary
            .headers
            .iter()
            .chain(shadow.headers.iter())
            .map(|(name, _)| name.as_str().to_ascii_lowercase())
            .collect();
        names.sort();
        names.dedup();
        names
    } else {
        config
            .compare_headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect()
    };

    let mut headers_match = true;
    for name in compared {
        if is_ignored(&name) {
            continue;
        }
        let left = primary.headers.get(name.as_str()).and_then(|v| v.to_str().ok());
        let right = shadow.headers.get(name.as_str()).and_then(|v| v.to_str().ok());
        if left != right {
            headers_match = false;
            differences.push(format!(
                "header {}: {:?} vs {:?}",
                name,
                left.unwrap_or("<absent>"),
                right.unwrap_or("<absent>")
            ));
        }
    }

    let limit = config.max_response_size;
    let left_body = &primary.body[..primary.body.len().min(limit)];
    let right_body = &shadow.body[..shadow.body.len().min(limit)];
    let body_match = left_body == right_body;
    if !body_match {
        differences.push(format!(
            "body: {} vs {} bytes differ",
            left_body.len(),
            right_body.len()
        ));
    }

    ComparisonResult {
        endpoint: endpoint.to_string(),
        primary_backend: primary.backend_id.clone(),
        secondary_backend: shadow.backend_id.clone(),
        status_code_match,
        headers_match,
        body_match,
        differences,
        primary_response_time: primary.response_time,
        secondary_response_time: shadow.response_time,
    }
}
