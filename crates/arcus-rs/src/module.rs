//! Module lifecycle: construction, start/stop, and the tenant registry.
//!
//! `init` builds every subsystem and the global proxy handles, including
//! per-tenant handles for tenants already present in the configuration.
//! `start` picks up tenants registered between init and start, then starts
//! the health loop and cache sweeper. `stop` drains both loops.

use crate::config::validation::ConfigValidator;
use crate::models::error::GatewayError;
use crate::models::events::{EventEmitter, GatewayEvent, LogEmitter};
use crate::models::health::HealthStatus;
use crate::models::settings::Settings;
use crate::services::cache::ResponseCache;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::services::composite::{CompositeHandler, ResponseTransformer};
use crate::services::config_store::ConfigStore;
use crate::services::dry_run::DryRunHandler;
use crate::services::feature_flags::{FeatureFlagAggregator, FeatureFlagEvaluator};
use crate::services::health_checker::{HealthCheckConfig, HealthChecker};
use crate::services::map_reduce::MapReduceEngine;
use crate::services::proxy::{BackendProxy, SharedResponseModifier};
use crate::services::registry::ProxyRegistry;
use crate::services::routing::RoutingEngine;
use crate::services::transform::ResponseModifier;
use actix_web::web::Bytes;
use actix_web::{HttpRequest, HttpResponse};
use log::{info, warn};
use reqwest::Client;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// The reverse-proxy module: owns every subsystem and all shared state.
pub struct ProxyModule {
    store: Arc<ConfigStore>,
    registry: Arc<ProxyRegistry>,
    engine: Arc<RoutingEngine>,
    health: Arc<HealthChecker>,
    cache: Option<Arc<ResponseCache>>,
    flags: Arc<FeatureFlagAggregator>,
    composite: Arc<CompositeHandler>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    emitter: Arc<dyn EventEmitter>,
    client: Client,
    modifier: SharedResponseModifier,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyModule {
    /// Validates the configuration and builds every subsystem.
    ///
    /// Configuration errors are fatal here; nothing is constructed when
    /// validation fails.
    pub fn init(
        settings: Settings,
        emitter: Option<Arc<dyn EventEmitter>>,
    ) -> Result<Arc<Self>, GatewayError> {
        let emitter: Arc<dyn EventEmitter> = emitter.unwrap_or_else(|| Arc::new(LogEmitter));

        let validation = ConfigValidator::validate_comprehensive(&settings);
        if !validation.is_valid {
            return Err(GatewayError::Config {
                message: validation.errors.join("; "),
            });
        }

        // The cache exists whenever any scope enables caching; the TTL is
        // the global one (tenant TTL overrides shorten lookups, not
        // storage).
        let cache = settings
            .cache_required()
            .then(|| Arc::new(ResponseCache::new(settings.cache_ttl())));

        let store = Arc::new(ConfigStore::new(settings));
        let global = store.global();

        let client = BackendProxy::build_client(
            Duration::from_secs(10),
            Duration::from_secs(30),
        );

        // One breaker per backend, shared by every proxy handle for it.
        let mut breakers = HashMap::new();
        for backend_id in backend_ids(&global) {
            let cb_settings = global
                .backend_configs
                .get(&backend_id)
                .and_then(|c| c.circuit_breaker.as_ref())
                .unwrap_or(&global.circuit_breaker);
            let breaker = CircuitBreaker::with_emitter(
                backend_id.clone(),
                CircuitBreakerConfig::from(cb_settings),
                Some(Arc::clone(&emitter)),
            );
            breakers.insert(backend_id, breaker);
        }

        let health = HealthChecker::new(
            HealthCheckConfig::from(&global.health_check),
            Some(Arc::clone(&emitter)),
        );
        health.set_breakers(breakers.clone());
        let mut probe_targets = HashMap::new();
        for backend_id in backend_ids(&global) {
            if let Some(url) = global.backend_url(&backend_id) {
                let config = global
                    .backend_configs
                    .get(&backend_id)
                    .and_then(|c| c.health_check.as_ref())
                    .map(HealthCheckConfig::from);
                probe_targets.insert(backend_id.clone(), (url.to_string(), config));
            }
        }
        health.update_backends(probe_targets);

        let modifier: SharedResponseModifier = Arc::new(RwLock::new(None));
        let registry = Arc::new(ProxyRegistry::new(Arc::clone(&store)));

        let flags = Arc::new(FeatureFlagAggregator::new(
            Arc::clone(&store),
            Some(Arc::clone(&emitter)),
        ));
        let composite = Arc::new(CompositeHandler::new(
            Arc::clone(&registry) as Arc<dyn crate::services::registry::BackendCaller>
        ));
        let map_reduce = Arc::new(MapReduceEngine::new(
            Arc::clone(&registry) as Arc<dyn crate::services::registry::BackendCaller>
        ));
        let dry_run = Arc::new(DryRunHandler::new(
            Arc::clone(&registry) as Arc<dyn crate::services::registry::BackendCaller>,
            Some(Arc::clone(&emitter)),
        ));

        let engine = Arc::new(RoutingEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&composite),
            map_reduce,
            dry_run,
            Arc::clone(&flags),
            Arc::clone(&health),
            cache.clone(),
            Arc::clone(&emitter),
        ));

        let module = Arc::new(Self {
            store,
            registry,
            engine,
            health,
            cache,
            flags,
            composite,
            breakers,
            emitter,
            client,
            modifier,
            health_handle: Mutex::new(None),
            sweeper_handle: Mutex::new(None),
        });

        // Global proxy handles, one per backend.
        for backend_id in backend_ids(&global) {
            if let Some(url) = global.backend_url(&backend_id) {
                let proxy = module.build_proxy(&backend_id, url, &global);
                module.registry.insert_global(&backend_id, proxy);
                module.emitter.emit(GatewayEvent::BackendAdded {
                    backend_id: backend_id.clone(),
                    url: url.to_string(),
                });
            }
        }

        // Tenants known at init already get their proxy handles; tenants
        // arriving between init and start are handled again in `start`.
        for tenant_id in module.store.tenant_ids() {
            module.create_tenant_proxies(&tenant_id);
        }

        module.emitter.emit(GatewayEvent::ConfigLoaded { tenant_id: None });
        info!(
            "proxy module initialized: {} backends, {} routes, {} tenants",
            global.backend_services.len(),
            global.routes.len(),
            module.store.tenant_ids().len()
        );

        Ok(module)
    }

    fn build_proxy(&self, backend_id: &str, url: &str, settings: &Settings) -> Arc<BackendProxy> {
        let backend_config = settings.backend_configs.get(backend_id);
        let retry_attempts = backend_config
            .map(|c| c.max_retries)
            .filter(|r| *r > 0)
            .unwrap_or(settings.error_handling.retry_attempts);
        let retry_delay = Duration::from_millis(
            backend_config
                .map(|c| c.retry_delay_ms)
                .filter(|d| *d > 0)
                .unwrap_or(settings.error_handling.retry_delay_ms),
        );
        let breaker = self
            .breakers
            .get(backend_id)
            .cloned()
            .unwrap_or_else(|| {
                CircuitBreaker::with_emitter(
                    backend_id.to_string(),
                    CircuitBreakerConfig::from(&settings.circuit_breaker),
                    Some(Arc::clone(&self.emitter)),
                )
            });

        Arc::new(
            BackendProxy::new(
                backend_id.to_string(),
                url.to_string(),
                self.client.clone(),
                breaker,
                Some(Arc::clone(&self.health)),
                retry_attempts,
                retry_delay,
            )
            .with_modifier_slot(Arc::clone(&self.modifier)),
        )
    }

    /// Rebuilds the per-tenant proxy set for one tenant.
    ///
    /// A handle is created only for backends whose effective URL differs
    /// from the global one. Each iteration binds its own `origin` value, so
    /// two tenants overriding the same backend end up with two handles
    /// pointing at two different origins.
    fn create_tenant_proxies(&self, tenant_id: &str) {
        let global = self.store.global();
        let merged = self.store.effective(Some(tenant_id));

        let mut proxies = HashMap::new();
        for backend_id in backend_ids(&merged) {
            let Some(tenant_url) = merged.backend_url(&backend_id) else {
                continue;
            };
            let global_url = global.backend_url(&backend_id);
            if global_url == Some(tenant_url) {
                continue;
            }
            // Fresh binding per iteration; the handle owns its origin.
            let origin = tenant_url.to_string();
            let proxy = self.build_proxy(&backend_id, &origin, &merged);
            proxies.insert(backend_id.clone(), proxy);
        }

        if proxies.is_empty() {
            self.registry.remove_tenant(tenant_id);
        } else {
            self.registry.replace_tenant(tenant_id, proxies);
        }
    }

    /// Starts background work and creates proxies for tenants registered
    /// after init.
    pub fn start(&self) {
        for tenant_id in self.store.tenant_ids() {
            self.create_tenant_proxies(&tenant_id);
        }

        let global = self.store.global();
        if global.health_check.enabled {
            let handle = self.health.start();
            *self.health_handle.lock().unwrap() = Some(handle);
        }

        if let Some(cache) = &self.cache {
            let cache = Arc::clone(cache);
            let period = cache.ttl().max(Duration::from_secs(30));
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let removed = cache.sweep();
                    if removed > 0 {
                        info!("cache sweeper removed {} expired entries", removed);
                    }
                }
            });
            *self.sweeper_handle.lock().unwrap() = Some(handle);
        }

        self.emitter.emit(GatewayEvent::ModuleStarted {
            backends: self.registry.global_backend_ids().len(),
            routes: global.routes.len(),
        });
        info!("proxy module started");
    }

    /// Stops the health loop and the cache sweeper.
    pub async fn stop(&self) {
        self.health.stop();
        let handle = self.health_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("health checker task ended abnormally: {}", e);
            }
        }
        if let Some(handle) = self.sweeper_handle.lock().unwrap().take() {
            handle.abort();
        }
        for backend_id in self.registry.global_backend_ids() {
            self.emitter.emit(GatewayEvent::BackendRemoved { backend_id });
        }
        self.emitter.emit(GatewayEvent::ModuleStopped);
        info!("proxy module stopped");
    }

    /// Tenant lifecycle callback: merge the overlay, rebuild tenant proxies,
    /// refresh the route table.
    pub fn on_tenant_registered(&self, tenant_id: &str, overlay: Settings) {
        self.store.register_tenant(tenant_id, overlay);
        self.create_tenant_proxies(tenant_id);
        self.engine.invalidate_matcher(Some(tenant_id));
        self.emitter.emit(GatewayEvent::TenantRegistered {
            tenant_id: tenant_id.to_string(),
        });
        self.emitter.emit(GatewayEvent::ConfigLoaded {
            tenant_id: Some(tenant_id.to_string()),
        });
        info!("tenant {} registered", tenant_id);
    }

    /// Tenant lifecycle callback: drop the overlay and its proxy handles.
    pub fn on_tenant_removed(&self, tenant_id: &str) {
        self.registry.remove_tenant(tenant_id);
        self.store.remove_tenant(tenant_id);
        self.engine.invalidate_matcher(Some(tenant_id));
        self.emitter.emit(GatewayEvent::TenantRemoved {
            tenant_id: tenant_id.to_string(),
        });
        info!("tenant {} removed", tenant_id);
    }

    /// Entry point for the HTTP layer.
    pub async fn handle_request(&self, req: &HttpRequest, body: Bytes) -> HttpResponse {
        self.engine.handle_http(req, body).await
    }

    /// Registers a composite merge callback for a route pattern.
    pub fn register_transformer(&self, pattern: &str, transformer: Arc<dyn ResponseTransformer>) {
        self.composite.register_transformer(pattern, transformer);
    }

    /// Registers an external feature-flag evaluator. The evaluator goes
    /// through the aggregator, never around it, so its abstentions fall
    /// through to the config evaluator.
    pub fn register_flag_evaluator(
        &self,
        name: &str,
        weight: i32,
        evaluator: Arc<dyn FeatureFlagEvaluator>,
    ) {
        self.flags.register_evaluator(name, weight, evaluator);
    }

    /// Installs the custom response modifier applied after static rewrites.
    pub fn set_response_modifier(&self, modifier: Arc<dyn ResponseModifier>) {
        *self.modifier.write().unwrap() = Some(modifier);
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    // Snapshot accessors backing the debug endpoints.

    pub fn info_snapshot(&self) -> serde_json::Value {
        let global = self.store.global();
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "backends": global.backend_services.len(),
            "routes": global.routes.len(),
            "composite_routes": global.composite_routes.len(),
            "tenants": self.store.tenant_ids(),
            "cache_enabled": self.cache.is_some(),
            "health_check_enabled": global.health_check.enabled,
        })
    }

    pub fn backends_snapshot(&self) -> serde_json::Value {
        let global = self.store.global();
        let mut backends = serde_json::Map::new();
        for backend_id in backend_ids(&global) {
            let url = global.backend_url(&backend_id).unwrap_or_default();
            let circuit = self
                .breakers
                .get(&backend_id)
                .map(|b| b.state().as_str())
                .unwrap_or("closed");
            backends.insert(
                backend_id.clone(),
                json!({
                    "url": url,
                    "circuit_breaker_state": circuit,
                    "tenant_overrides": self
                        .store
                        .tenant_ids()
                        .iter()
                        .filter(|t| {
                            self.registry
                                .tenant_backend_ids(t)
                                .contains(&backend_id)
                        })
                        .collect::<Vec<_>>(),
                }),
            );
        }
        serde_json::Value::Object(backends)
    }

    pub fn flags_snapshot(&self) -> serde_json::Value {
        let global = self.store.global();
        json!({
            "enabled": global.feature_flags.enabled,
            "flags": global.feature_flags.flags,
            "evaluators": self
                .flags
                .evaluator_names()
                .into_iter()
                .map(|(name, weight)| json!({"name": name, "weight": weight}))
                .collect::<Vec<_>>(),
        })
    }

    pub fn circuit_breakers_snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (backend_id, breaker) in &self.breakers {
            map.insert(
                backend_id.clone(),
                json!({
                    "state": breaker.state().as_str(),
                    "failure_count": breaker.failure_count(),
                    "success_count": breaker.success_count(),
                }),
            );
        }
        serde_json::Value::Object(map)
    }

    pub fn health_snapshot(&self) -> HashMap<String, HealthStatus> {
        self.health.status_snapshot()
    }
}

/// Union of backend IDs declared in `backend_services` and in
/// `backend_configs` entries carrying their own URL.
fn backend_ids(settings: &Settings) -> Vec<String> {
    let mut ids: HashSet<String> = settings.backend_services.keys().cloned().collect();
    for (id, config) in &settings.backend_configs {
        if config.url.as_deref().map(|u| !u.is_empty()).unwrap_or(false) {
            ids.insert(id.clone());
        }
    }
    let mut ids: Vec<String> = ids.into_iter().collect();
    ids.sort();
    ids
}
