//! Debug endpoints exposing module state as JSON.
//!
//! Mounted under the configured base path when `debug_endpoints.enabled`
//! is set. When a bearer token is configured, every request must carry it.

use crate::module::ProxyModule;
use actix_web::{web, HttpRequest, HttpResponse, Result};
use serde_json::json;
use std::sync::Arc;

fn authorized(req: &HttpRequest, module: &ProxyModule) -> bool {
    let settings = module.store().global();
    let Some(token) = &settings.debug_endpoints.bearer_token else {
        return true;
    };
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|presented| presented == token)
        .unwrap_or(false)
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(json!({
        "error": "missing or invalid bearer token",
        "type": "unauthorized",
    }))
}

async fn info(req: HttpRequest, module: web::Data<Arc<ProxyModule>>) -> Result<HttpResponse> {
    if !authorized(&req, &module) {
        return Ok(unauthorized());
    }
    Ok(HttpResponse::Ok().json(module.info_snapshot()))
}

async fn backends(req: HttpRequest, module: web::Data<Arc<ProxyModule>>) -> Result<HttpResponse> {
    if !authorized(&req, &module) {
        return Ok(unauthorized());
    }
    Ok(HttpResponse::Ok().json(module.backends_snapshot()))
}

async fn flags(req: HttpRequest, module: web::Data<Arc<ProxyModule>>) -> Result<HttpResponse> {
    if !authorized(&req, &module) {
        return Ok(unauthorized());
    }
    Ok(HttpResponse::Ok().json(module.flags_snapshot()))
}

async fn circuit_breakers(
    req: HttpRequest,
    module: web::Data<Arc<ProxyModule>>,
) -> Result<HttpResponse> {
    if !authorized(&req, &module) {
        return Ok(unauthorized());
    }
    Ok(HttpResponse::Ok().json(module.circuit_breakers_snapshot()))
}

async fn health_checks(
    req: HttpRequest,
    module: web::Data<Arc<ProxyModule>>,
) -> Result<HttpResponse> {
    if !authorized(&req, &module) {
        return Ok(unauthorized());
    }
    Ok(HttpResponse::Ok().json(module.health_snapshot()))
}

/// Mounts the debug scope when enabled.
pub fn configure_debug(cfg: &mut web::ServiceConfig, module: Arc<ProxyModule>) {
    let settings = module.store().global();
    if !settings.debug_endpoints.enabled {
        return;
    }
    let base = settings.debug_endpoints.base_path.clone();
    cfg.app_data(web::Data::new(Arc::clone(&module))).service(
        web::scope(&base)
            .route("/info", web::get().to(info))
            .route("/backends", web::get().to(backends))
            .route("/flags", web::get().to(flags))
            .route("/circuit-breakers", web::get().to(circuit_breakers))
            .route("/health-checks", web::get().to(health_checks)),
    );
}
