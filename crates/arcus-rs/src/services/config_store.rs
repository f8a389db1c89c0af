//! Runtime configuration store.
//!
//! Holds the immutable global [`Settings`] and the merged effective
//! configuration per tenant. Registration merges a fresh value; nothing
//! ever mutates the global in place, so tenant overlays cannot alias global
//! state.

use crate::config::merge::merge_settings;
use crate::models::settings::Settings;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct ConfigStore {
    global: Arc<Settings>,
    overlays: RwLock<HashMap<String, Settings>>,
    effective: RwLock<HashMap<String, Arc<Settings>>>,
}

impl ConfigStore {
    pub fn new(global: Settings) -> Self {
        let overlays: HashMap<String, Settings> = global.tenants.clone();
        let effective = overlays
            .iter()
            .map(|(id, overlay)| (id.clone(), Arc::new(merge_settings(&global, overlay))))
            .collect();
        Self {
            global: Arc::new(global),
            overlays: RwLock::new(overlays),
            effective: RwLock::new(effective),
        }
    }

    pub fn global(&self) -> Arc<Settings> {
        Arc::clone(&self.global)
    }

    /// Effective configuration for a request: the merged tenant settings
    /// when the tenant is known, the global settings otherwise.
    pub fn effective(&self, tenant_id: Option<&str>) -> Arc<Settings> {
        if let Some(id) = tenant_id {
            if let Some(settings) = self.effective.read().unwrap().get(id) {
                return Arc::clone(settings);
            }
        }
        Arc::clone(&self.global)
    }

    /// Registers (or replaces) a tenant overlay and recomputes its merged
    /// configuration.
    pub fn register_tenant(&self, tenant_id: &str, overlay: Settings) -> Arc<Settings> {
        let merged = Arc::new(merge_settings(&self.global, &overlay));
        self.overlays
            .write()
            .unwrap()
            .insert(tenant_id.to_string(), overlay);
        self.effective
            .write()
            .unwrap()
            .insert(tenant_id.to_string(), Arc::clone(&merged));
        merged
    }

    pub fn remove_tenant(&self, tenant_id: &str) {
        self.overlays.write().unwrap().remove(tenant_id);
        self.effective.write().unwrap().remove(tenant_id);
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.effective.read().unwrap().keys().cloned().collect()
    }

    pub fn has_tenant(&self, tenant_id: &str) -> bool {
        self.effective.read().unwrap().contains_key(tenant_id)
    }
}
