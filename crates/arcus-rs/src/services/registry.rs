//! Proxy handle registry and the backend-calling seam.
//!
//! The registry owns one global [`BackendProxy`] per backend plus one
//! per-tenant handle for each backend whose URL the tenant overrides.
//! Handlers that fan out (composite, map/reduce, dry-run) depend on the
//! [`BackendCaller`] trait instead of the registry itself, which keeps them
//! testable against scripted backends.

use crate::models::error::GatewayError;
use crate::services::config_store::ConfigStore;
use crate::services::proxy::{BackendProxy, ProxyRequest, UpstreamResponse};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Dispatches one request to one backend, honoring the tenant's proxy
/// handle when it exists.
pub trait BackendCaller: Send + Sync {
    fn call<'a>(
        &'a self,
        backend_id: &'a str,
        request: &'a ProxyRequest,
        deadline: Duration,
    ) -> BoxFuture<'a, Result<UpstreamResponse, GatewayError>>;
}

/// Registry of proxy handles, global and per-tenant.
pub struct ProxyRegistry {
    store: Arc<ConfigStore>,
    global: RwLock<HashMap<String, Arc<BackendProxy>>>,
    tenants: RwLock<HashMap<String, HashMap<String, Arc<BackendProxy>>>>,
}

impl ProxyRegistry {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            global: RwLock::new(HashMap::new()),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert_global(&self, backend_id: &str, proxy: Arc<BackendProxy>) {
        self.global
            .write()
            .unwrap()
            .insert(backend_id.to_string(), proxy);
    }

    pub fn insert_tenant(&self, tenant_id: &str, backend_id: &str, proxy: Arc<BackendProxy>) {
        self.tenants
            .write()
            .unwrap()
            .entry(tenant_id.to_string())
            .or_default()
            .insert(backend_id.to_string(), proxy);
    }

    /// Drops every proxy handle belonging to a tenant.
    pub fn remove_tenant(&self, tenant_id: &str) {
        self.tenants.write().unwrap().remove(tenant_id);
    }

    /// Replaces a tenant's handle set wholesale (used on re-registration).
    pub fn replace_tenant(&self, tenant_id: &str, proxies: HashMap<String, Arc<BackendProxy>>) {
        self.tenants
            .write()
            .unwrap()
            .insert(tenant_id.to_string(), proxies);
    }

    /// Resolves the proxy for a backend: the tenant-specific handle when the
    /// tenant overrides this backend's URL, the global handle otherwise.
    pub fn proxy_for(&self, backend_id: &str, tenant_id: Option<&str>) -> Option<Arc<BackendProxy>> {
        if let Some(tenant) = tenant_id {
            if let Some(proxies) = self.tenants.read().unwrap().get(tenant) {
                if let Some(proxy) = proxies.get(backend_id) {
                    return Some(Arc::clone(proxy));
                }
            }
        }
        self.global.read().unwrap().get(backend_id).cloned()
    }

    pub fn global_backend_ids(&self) -> Vec<String> {
        self.global.read().unwrap().keys().cloned().collect()
    }

    pub fn tenant_backend_ids(&self, tenant_id: &str) -> Vec<String> {
        self.tenants
            .read()
            .unwrap()
            .get(tenant_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }
}

impl BackendCaller for ProxyRegistry {
    fn call<'a>(
        &'a self,
        backend_id: &'a str,
        request: &'a ProxyRequest,
        deadline: Duration,
    ) -> BoxFuture<'a, Result<UpstreamResponse, GatewayError>> {
        Box::pin(async move {
            let proxy = self
                .proxy_for(backend_id, request.tenant_id.as_deref())
                .ok_or_else(|| GatewayError::BackendNotFound {
                    backend: backend_id.to_string(),
                })?;
            let settings = self.store.effective(request.tenant_id.as_deref());
            proxy.forward(&settings, request, deadline).await
        })
    }
}
