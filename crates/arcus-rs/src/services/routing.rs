//! Request routing: tenant resolution, pattern matching, feature-flag
//! gating, target classification, and dispatch.
//!
//! Round-robin groups select among healthy candidates only (last probe
//! healthy, circuit not open) with a monotonically increasing per-group
//! counter, so distribution stays fair under concurrency.

use crate::models::error::GatewayError;
use crate::models::events::{EventEmitter, GatewayEvent};
use crate::models::settings::{
    CompositeRouteSettings, CompositeStrategy, RouteSettings, Settings,
};
use crate::services::cache::ResponseCache;
use crate::services::composite::CompositeHandler;
use crate::services::config_store::ConfigStore;
use crate::services::dry_run::DryRunHandler;
use crate::services::feature_flags::{FeatureFlagAggregator, FlagContext};
use crate::services::health_checker::HealthChecker;
use crate::services::map_reduce::MapReduceEngine;
use crate::services::proxy::{ProxyRequest, UpstreamResponse};
use crate::services::registry::{BackendCaller, ProxyRegistry};
use crate::utils::route_matcher::RouteMatcher;
use actix_web::error::ResponseError;
use actix_web::http::Method;
use actix_web::web::Bytes;
use actix_web::{HttpRequest, HttpResponse};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// What a matched route points at.
#[derive(Debug, Clone, PartialEq)]
enum RouteTarget {
    Single(String),
    Group(Vec<String>),
    Composite(String),
}

fn classify_target(settings: &Settings, target: &str) -> RouteTarget {
    if settings.composite_routes.contains_key(target) {
        RouteTarget::Composite(target.to_string())
    } else if target.contains(',') {
        RouteTarget::Group(
            target
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    } else {
        RouteTarget::Single(target.to_string())
    }
}

/// The routing engine. One instance per module.
pub struct RoutingEngine {
    store: Arc<ConfigStore>,
    registry: Arc<ProxyRegistry>,
    composite: Arc<CompositeHandler>,
    map_reduce: Arc<MapReduceEngine>,
    dry_run: Arc<DryRunHandler>,
    flags: Arc<FeatureFlagAggregator>,
    health: Arc<HealthChecker>,
    cache: Option<Arc<ResponseCache>>,
    emitter: Arc<dyn EventEmitter>,
    /// Compiled route tables, keyed by tenant ID ("" = global).
    matchers: RwLock<HashMap<String, Arc<RouteMatcher<String>>>>,
    /// Round-robin counters, keyed by group target string.
    counters: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl RoutingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<ProxyRegistry>,
        composite: Arc<CompositeHandler>,
        map_reduce: Arc<MapReduceEngine>,
        dry_run: Arc<DryRunHandler>,
        flags: Arc<FeatureFlagAggregator>,
        health: Arc<HealthChecker>,
        cache: Option<Arc<ResponseCache>>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            store,
            registry,
            composite,
            map_reduce,
            dry_run,
            flags,
            health,
            cache,
            emitter,
            matchers: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Drops the compiled route table for a tenant (or the global table when
    /// `None`), forcing a rebuild on the next request.
    pub fn invalidate_matcher(&self, tenant_id: Option<&str>) {
        self.matchers
            .write()
            .unwrap()
            .remove(tenant_id.unwrap_or(""));
    }

    /// Entry point from the HTTP layer. Emits request lifecycle events and
    /// converts errors into responses.
    pub async fn handle_http(&self, req: &HttpRequest, body: Bytes) -> HttpResponse {
        let started = Instant::now();
        let global = self.store.global();

        // Step 1: tenant resolution.
        let tenant_id = req
            .headers()
            .get(global.tenant_header())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from);

        self.emitter.emit(GatewayEvent::RequestReceived {
            method: req.method().to_string(),
            path: req.path().to_string(),
            tenant_id: tenant_id.clone(),
        });

        if global.require_tenant_id && tenant_id.is_none() {
            let err = GatewayError::TenantRequired {
                header: global.tenant_header().to_string(),
            };
            return self.fail(req, &err, tenant_id);
        }

        let request = ProxyRequest::from_http(req, body, tenant_id.clone());

        match self.dispatch(&request).await {
            Ok(response) => {
                self.emitter.emit(GatewayEvent::RequestProcessed {
                    method: request.method.to_string(),
                    path: request.path.clone(),
                    status: response.status().as_u16(),
                    tenant_id,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                response
            }
            Err(err) => self.fail(req, &err, tenant_id),
        }
    }

    fn fail(&self, req: &HttpRequest, err: &GatewayError, tenant_id: Option<String>) -> HttpResponse {
        self.emitter.emit(GatewayEvent::RequestFailed {
            method: req.method().to_string(),
            path: req.path().to_string(),
            status: err.status_code().as_u16(),
            error: err.to_string(),
            tenant_id,
        });
        err.error_response()
    }

    async fn dispatch(&self, request: &ProxyRequest) -> Result<HttpResponse, GatewayError> {
        let settings = self.store.effective(request.tenant_id.as_deref());

        // Response cache short-circuits GETs before any routing work.
        let cache_key = self.cache_lookup_key(&settings, request);
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(entry) = cache.get(key) {
                self.emitter.emit(GatewayEvent::CacheHit { key: key.clone() });
                let mut builder = HttpResponse::build(
                    actix_web::http::StatusCode::from_u16(entry.status)
                        .unwrap_or(actix_web::http::StatusCode::OK),
                );
                for (name, value) in &entry.headers {
                    builder.insert_header((name.as_str(), value.as_str()));
                }
                return Ok(builder.body(entry.body.clone()));
            }
            self.emitter.emit(GatewayEvent::CacheMiss { key: key.clone() });
        }

        // Step 2: pattern match.
        let matched = self
            .matcher_for(&settings, request.tenant_id.as_deref())
            .find_match(&request.path)
            .map(|(pattern, target)| (pattern.to_string(), target.clone()));

        let (pattern, target) = match matched {
            Some(found) => found,
            None if !settings.default_backend.is_empty() => {
                (request.path.clone(), settings.default_backend.clone())
            }
            None => {
                return Err(GatewayError::RouteNotFound {
                    path: request.path.clone(),
                })
            }
        };
        debug!("route {} matched pattern {}", request.path, pattern);

        let route_config = settings.route_configs.get(&pattern).cloned().unwrap_or_default();
        let deadline = route_deadline(&settings, &route_config);
        let target = classify_target(&settings, &target);

        match target {
            RouteTarget::Composite(name) => {
                let composite_route = settings
                    .composite_routes
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| GatewayError::Config {
                        message: format!("composite route '{}' disappeared", name),
                    })?;
                self.dispatch_composite(&settings, &pattern, &composite_route, request, deadline)
                    .await
            }
            RouteTarget::Group(backends) => {
                self.dispatch_group(
                    &settings,
                    &pattern,
                    &route_config,
                    &backends,
                    request,
                    deadline,
                    cache_key,
                )
                .await
            }
            RouteTarget::Single(backend) => {
                self.dispatch_single(
                    &settings,
                    &pattern,
                    &route_config,
                    &backend,
                    request,
                    deadline,
                    cache_key,
                )
                .await
            }
        }
    }

    fn cache_lookup_key(&self, settings: &Settings, request: &ProxyRequest) -> Option<String> {
        if !settings.cache_enabled || request.method != Method::GET {
            return None;
        }
        self.cache.as_ref()?;
        Some(ResponseCache::key(
            request.method.as_str(),
            request.tenant_id.as_deref(),
            &request.path,
            &request.query,
        ))
    }

    fn matcher_for(&self, settings: &Settings, tenant_id: Option<&str>) -> Arc<RouteMatcher<String>> {
        // Unknown tenants share the global table; caching under arbitrary
        // header values would let clients grow the map without bound.
        let key = tenant_id
            .filter(|id| self.store.has_tenant(id))
            .unwrap_or("");
        if let Some(matcher) = self.matchers.read().unwrap().get(key) {
            return Arc::clone(matcher);
        }

        let matcher = Arc::new(
            RouteMatcher::new(settings.routes.clone())
                .unwrap_or_else(|_| RouteMatcher::new(Vec::<(String, String)>::new()).unwrap()),
        );
        self.matchers
            .write()
            .unwrap()
            .insert(key.to_string(), Arc::clone(&matcher));
        matcher
    }

    /// Step 3: feature-flag gate. Returns the backend to serve instead, or
    /// `None` to continue with the configured target.
    async fn flag_gate(
        &self,
        settings: &Settings,
        request: &ProxyRequest,
        flag_id: Option<&str>,
        alternative: Option<&str>,
        path: &str,
    ) -> Result<Option<String>, GatewayError> {
        let Some(flag_id) = flag_id.filter(|f| !f.is_empty()) else {
            return Ok(None);
        };
        if !settings.feature_flags.enabled {
            return Ok(None);
        }

        let ctx = FlagContext {
            method: request.method.as_str(),
            path: &request.path,
        };
        // An unset flag counts as enabled.
        let enabled = self
            .flags
            .evaluate_flag_with_default(flag_id, request.tenant_id.as_deref(), &ctx, true)
            .await;

        if enabled {
            Ok(None)
        } else {
            match alternative.filter(|a| !a.is_empty()) {
                Some(alt) => Ok(Some(alt.to_string())),
                None => Err(GatewayError::RouteDisabled {
                    path: path.to_string(),
                }),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_single(
        &self,
        settings: &Settings,
        pattern: &str,
        route_config: &RouteSettings,
        backend: &str,
        request: &ProxyRequest,
        deadline: Duration,
        cache_key: Option<String>,
    ) -> Result<HttpResponse, GatewayError> {
        let gated = self
            .flag_gate(
                settings,
                request,
                route_config.feature_flag_id.as_deref(),
                route_config.alternative_backend.as_deref(),
                pattern,
            )
            .await?;

        let (primary, shadow_for_dry_run) = match gated {
            // Flag off: the alternative becomes the primary; the original
            // target becomes the shadow candidate.
            Some(alternative) => (alternative, Some(backend.to_string())),
            None => (backend.to_string(), None),
        };

        self.emitter.emit(GatewayEvent::LoadBalanceDecision {
            selected_backend: primary.clone(),
            healthy_candidates: 1,
            strategy: "single".into(),
        });

        if route_config.dry_run {
            let shadow = route_config
                .dry_run_backend
                .clone()
                .or(shadow_for_dry_run)
                .filter(|s| !s.is_empty() && s != &primary);
            if let Some(shadow) = shadow {
                return self
                    .dry_run
                    .handle(pattern, &primary, &shadow, &settings.dry_run, request, deadline)
                    .await;
            }
        }

        let response = self.registry.call(&primary, request, deadline).await?;
        self.cache_fill(cache_key, &response);
        Ok(response.to_http_response())
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_group(
        &self,
        settings: &Settings,
        pattern: &str,
        route_config: &RouteSettings,
        backends: &[String],
        request: &ProxyRequest,
        deadline: Duration,
        cache_key: Option<String>,
    ) -> Result<HttpResponse, GatewayError> {
        let gated = self
            .flag_gate(
                settings,
                request,
                route_config.feature_flag_id.as_deref(),
                route_config.alternative_backend.as_deref(),
                pattern,
            )
            .await?;
        let selected = match gated {
            Some(alternative) => alternative,
            None => self.select_round_robin(backends, request.tenant_id.as_deref())?,
        };

        // Dry-run wraps the chosen backend, group routes included.
        if route_config.dry_run {
            let shadow = route_config
                .dry_run_backend
                .clone()
                .filter(|s| !s.is_empty() && s != &selected);
            if let Some(shadow) = shadow {
                return self
                    .dry_run
                    .handle(pattern, &selected, &shadow, &settings.dry_run, request, deadline)
                    .await;
            }
        }

        let response = self.registry.call(&selected, request, deadline).await?;
        self.cache_fill(cache_key, &response);
        Ok(response.to_http_response())
    }

    fn cache_fill(&self, cache_key: Option<String>, response: &UpstreamResponse) {
        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            if response.is_success() {
                cache.store(
                    key,
                    response.status.as_u16(),
                    &response.headers,
                    response.body.clone(),
                );
            }
        }
    }

    async fn dispatch_composite(
        &self,
        settings: &Settings,
        pattern: &str,
        route: &CompositeRouteSettings,
        request: &ProxyRequest,
        deadline: Duration,
    ) -> Result<HttpResponse, GatewayError> {
        let gated = self
            .flag_gate(
                settings,
                request,
                route.feature_flag_id.as_deref(),
                route.alternative_backend.as_deref(),
                pattern,
            )
            .await?;
        if let Some(alternative) = gated {
            let response = self.registry.call(&alternative, request, deadline).await?;
            return Ok(response.to_http_response());
        }

        if route.strategy == CompositeStrategy::MapReduce {
            let config = route.map_reduce.as_ref().ok_or_else(|| GatewayError::Config {
                message: format!("composite route '{}' lacks a map_reduce config", pattern),
            })?;
            return self.map_reduce.handle(config, request, deadline).await;
        }

        self.composite.handle(pattern, route, request, deadline).await
    }

    /// Round-robin selection among healthy candidates. Healthy means the
    /// last probe reported healthy and the circuit admits traffic.
    fn select_round_robin(
        &self,
        backends: &[String],
        tenant_id: Option<&str>,
    ) -> Result<String, GatewayError> {
        let healthy: Vec<&String> = backends
            .iter()
            .filter(|backend_id| {
                let circuit_ok = self
                    .registry
                    .proxy_for(backend_id, tenant_id)
                    .map(|proxy| !proxy.breaker().is_open())
                    .unwrap_or(false);
                circuit_ok && self.health.is_healthy(backend_id)
            })
            .collect();

        let group_key = backends.join(",");
        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyBackend { group: group_key });
        }

        let counter = {
            let mut counters = self.counters.write().unwrap();
            Arc::clone(
                counters
                    .entry(group_key.clone())
                    .or_insert_with(|| Arc::new(AtomicUsize::new(0))),
            )
        };
        let index = counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        let selected = healthy[index].clone();

        self.emitter.emit(GatewayEvent::LoadBalanceRoundRobin {
            backend_group: group_key,
            current_index: index,
            selected_backend: selected.clone(),
        });
        self.emitter.emit(GatewayEvent::LoadBalanceDecision {
            selected_backend: selected.clone(),
            healthy_candidates: healthy.len(),
            strategy: "round_robin".into(),
        });

        Ok(selected)
    }
}

fn route_deadline(settings: &Settings, route_config: &RouteSettings) -> Duration {
    let global = settings.global_timeout();
    if route_config.timeout > 0 {
        global.min(Duration::from_secs(route_config.timeout))
    } else {
        global
    }
}
