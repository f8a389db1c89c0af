//! Reverse-proxy handles for single backends.
//!
//! One [`BackendProxy`] exists per configured backend, plus one per
//! (backend, tenant) pair when the tenant overrides the backend URL. The
//! origin URL is captured at construction and never re-resolved per
//! request, which is what keeps one tenant's override from leaking into
//! another's traffic.

use crate::models::error::GatewayError;
use crate::models::settings::Settings;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::health_checker::HealthChecker;
use crate::services::transform::{ResponseModifier, TransformPipeline};
use crate::utils::path::{format_target, host_of};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::http::{Method as ActixMethod, StatusCode};
use actix_web::web::Bytes;
use actix_web::{HttpRequest, HttpResponse};
use log::{debug, info, warn};
use reqwest::{
    header::HeaderMap as ReqwestHeaderMap, header::HeaderName as ReqwestHeaderName,
    header::HeaderValue as ReqwestHeaderValue, Client, Method as ReqwestMethod,
};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Module-wide response modifier slot, shared by every proxy handle so a
/// late registration takes effect on the next request.
pub type SharedResponseModifier = Arc<RwLock<Option<Arc<dyn ResponseModifier>>>>;

// Hop-by-hop headers never forwarded in either direction.
const SKIP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
];

/// A buffered, transport-agnostic copy of the incoming request.
///
/// The body is read fully into memory once, so fan-out handlers can hand
/// every branch identical bytes without racing the client's body reader.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: ActixMethod,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub tenant_id: Option<String>,
    pub original_host: Option<String>,
}

impl ProxyRequest {
    pub fn from_http(req: &HttpRequest, body: Bytes, tenant_id: Option<String>) -> Self {
        let original_host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Self {
            method: req.method().clone(),
            path: req.path().to_string(),
            query: req.query_string().to_string(),
            headers: req.headers().clone(),
            body,
            tenant_id,
            original_host,
        }
    }

    /// Whether the request method is safe to retry after a network failure.
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, ActixMethod::GET | ActixMethod::HEAD)
    }

    /// Derived request with a different method, path, and body, used by the
    /// map/reduce engine for dependent calls.
    pub fn derived(&self, method: ActixMethod, path: &str, body: Bytes) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: String::new(),
            headers: self.headers.clone(),
            body,
            tenant_id: self.tenant_id.clone(),
            original_host: self.original_host.clone(),
        }
    }
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub backend_id: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_time: Duration,
}

impl UpstreamResponse {
    pub fn to_http_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status);
        for (name, value) in self.headers.iter() {
            builder.insert_header((name.clone(), value.clone()));
        }
        builder.body(self.body.clone())
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value, GatewayError> {
        serde_json::from_slice(&self.body).map_err(|e| GatewayError::Merge {
            message: format!("backend '{}' returned invalid JSON: {}", self.backend_id, e),
        })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Reverse-proxy handle for one backend origin.
pub struct BackendProxy {
    backend_id: String,
    origin: String,
    client: Client,
    breaker: Arc<CircuitBreaker>,
    health: Option<Arc<HealthChecker>>,
    retry_attempts: u32,
    retry_delay: Duration,
    modifier: SharedResponseModifier,
}

impl BackendProxy {
    /// Builds the shared outbound client with pooled connections.
    pub fn build_client(connection_timeout: Duration, idle_timeout: Duration) -> Client {
        Client::builder()
            .connect_timeout(connection_timeout)
            .pool_idle_timeout(idle_timeout)
            .pool_max_idle_per_host(32)
            .build()
            .expect("Failed to create HTTP client")
    }

    pub fn new(
        backend_id: String,
        origin: String,
        client: Client,
        breaker: Arc<CircuitBreaker>,
        health: Option<Arc<HealthChecker>>,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            backend_id,
            origin,
            client,
            breaker,
            health,
            retry_attempts,
            retry_delay,
            modifier: Arc::new(RwLock::new(None)),
        }
    }

    /// Shares the module's response-modifier slot with this handle.
    pub fn with_modifier_slot(mut self, modifier: SharedResponseModifier) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// The origin URL this handle was constructed with.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Forwards a request to this backend.
    ///
    /// `settings` is the tenant-merged effective configuration for this
    /// request; transforms are resolved from it on every call, while the
    /// origin URL stays fixed. The deadline covers the whole exchange
    /// including retries.
    pub async fn forward(
        &self,
        settings: &Settings,
        request: &ProxyRequest,
        deadline: Duration,
    ) -> Result<UpstreamResponse, GatewayError> {
        if !self.breaker.try_acquire() {
            debug!("circuit open for backend {}", self.backend_id);
            return Err(GatewayError::CircuitOpen {
                backend: self.backend_id.clone(),
            });
        }

        if let Some(health) = &self.health {
            health.record_backend_request(&self.backend_id);
        }

        let mut pipeline = TransformPipeline::build(settings, &self.backend_id, &request.path);
        if let Some(modifier) = self.modifier.read().unwrap().clone() {
            pipeline = pipeline.with_response_modifier(modifier);
        }
        let started = Instant::now();

        let result = timeout(deadline, self.send_with_retries(&pipeline, request)).await;

        match result {
            Ok(Ok(response)) => {
                if self.breaker.is_failure_status(response.status().as_u16()) {
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
                self.convert_response(&pipeline, request, response, started.elapsed())
                    .await
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                warn!(
                    "upstream error for backend {}: {} ({}ms)",
                    self.backend_id,
                    e,
                    started.elapsed().as_millis()
                );
                Err(GatewayError::Upstream {
                    backend: self.backend_id.clone(),
                    message: sanitize_reqwest_error(&e),
                })
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(GatewayError::Timeout {
                    seconds: deadline.as_secs(),
                })
            }
        }
    }

    /// Issues the outbound call, retrying network-level failures for
    /// idempotent methods. Retries share one circuit-breaker failure: the
    /// breaker is informed once by the caller, after the budget is spent.
    async fn send_with_retries(
        &self,
        pipeline: &TransformPipeline,
        request: &ProxyRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let max_attempts = if request.is_idempotent() {
            1 + self.retry_attempts
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(pipeline, request).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < max_attempts && e.status().is_none() => {
                    debug!(
                        "retrying backend {} after network failure (attempt {}/{})",
                        self.backend_id, attempt, max_attempts
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        pipeline: &TransformPipeline,
        request: &ProxyRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let (path, strip_query) = pipeline.rewrite_path(&request.path);
        let query = if strip_query { "" } else { request.query.as_str() };
        let target_url = format_target(&self.origin, &path, query);

        let mut headers = request.headers.clone();
        pipeline.apply_request_headers(&mut headers);

        let mut outbound = build_outbound_headers(&headers);
        if let Some(host) = pipeline.resolve_host(request.original_host.as_deref(), &self.origin) {
            if let Ok(value) = ReqwestHeaderValue::from_str(&host) {
                outbound.insert(reqwest::header::HOST, value);
            }
        }
        // Record where the request entered, unless the client Host is being
        // passed through untouched.
        if let Some(original) = &request.original_host {
            if host_of(&self.origin) != original.as_str() {
                if let Ok(value) = ReqwestHeaderValue::from_str(original) {
                    outbound
                        .entry("x-forwarded-host")
                        .or_insert(value);
                }
            }
        }

        info!("Forwarding request to: {}", target_url);

        self.client
            .request(convert_method(&request.method), &target_url)
            .headers(outbound)
            .body(request.body.to_vec())
            .send()
            .await
    }

    async fn convert_response(
        &self,
        pipeline: &TransformPipeline,
        request: &ProxyRequest,
        response: reqwest::Response,
        response_time: Duration,
    ) -> Result<UpstreamResponse, GatewayError> {
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if SKIP_HEADERS.iter().any(|skip| lowered.starts_with(skip)) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_ref()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }

        let body = response.bytes().await.map_err(|e| GatewayError::Upstream {
            backend: self.backend_id.clone(),
            message: format!("failed reading response body: {}", e),
        })?;

        pipeline.apply_response_headers(&mut headers);

        let mut upstream = UpstreamResponse {
            backend_id: self.backend_id.clone(),
            status,
            headers,
            body,
            response_time,
        };

        if let Some(modifier) = pipeline.response_modifier() {
            modifier
                .modify(&mut upstream, &self.backend_id, request.tenant_id.as_deref())
                .map_err(|message| GatewayError::ResponseModifier {
                    backend: self.backend_id.clone(),
                    message,
                })?;
        }

        debug!(
            "backend {} answered {} in {}ms",
            self.backend_id,
            upstream.status,
            response_time.as_millis()
        );

        Ok(upstream)
    }
}

/// Converts inbound headers to the outbound map, dropping hop-by-hop
/// headers and defaulting the user agent.
fn build_outbound_headers(headers: &HeaderMap) -> ReqwestHeaderMap {
    let mut outbound = ReqwestHeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lowered = name.as_str().to_ascii_lowercase();
        if SKIP_HEADERS.iter().any(|skip| lowered.starts_with(skip)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            ReqwestHeaderName::from_bytes(name.as_ref()),
            ReqwestHeaderValue::from_bytes(value.as_bytes()),
        ) {
            outbound.insert(name, value);
        }
    }
    outbound
        .entry("user-agent")
        .or_insert_with(|| ReqwestHeaderValue::from_static("arcus-rs/0.3"));
    outbound
}

fn convert_method(method: &ActixMethod) -> ReqwestMethod {
    match *method {
        ActixMethod::GET => ReqwestMethod::GET,
        ActixMethod::POST => ReqwestMethod::POST,
        ActixMethod::PUT => ReqwestMethod::PUT,
        ActixMethod::DELETE => ReqwestMethod::DELETE,
        ActixMethod::HEAD => ReqwestMethod::HEAD,
        ActixMethod::OPTIONS => ReqwestMethod::OPTIONS,
        ActixMethod::CONNECT => ReqwestMethod::CONNECT,
        ActixMethod::PATCH => ReqwestMethod::PATCH,
        ActixMethod::TRACE => ReqwestMethod::TRACE,
        _ => ReqwestMethod::GET,
    }
}

/// Strips target URLs out of reqwest error strings before they can reach a
/// client-facing error body.
fn sanitize_reqwest_error(error: &reqwest::Error) -> String {
    if error.is_connect() {
        "connection failed".to_string()
    } else if error.is_timeout() {
        "upstream timeout".to_string()
    } else if error.is_body() || error.is_decode() {
        "invalid upstream response".to_string()
    } else {
        "request failed".to_string()
    }
}
