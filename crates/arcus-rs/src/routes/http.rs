use crate::module::ProxyModule;
use actix_web::{web, HttpRequest};
use std::sync::Arc;

/// Configures the main proxy route.
///
/// A catch-all `/{tail:.*}` resource hands every request to the module;
/// route matching happens inside the routing engine, not in actix. Payload
/// limits guard the request-buffering fan-out paths.
pub fn configure_proxy(cfg: &mut web::ServiceConfig, module: Arc<ProxyModule>) {
    cfg.app_data(web::PayloadConfig::new(1024 * 1024)) // 1MB payload limit
        .app_data(web::JsonConfig::default().limit(1024 * 1024))
        .service(
            web::resource("/{tail:.*}").to(move |req: HttpRequest, body: web::Bytes| {
                let module = Arc::clone(&module);
                async move { module.handle_request(&req, body).await }
            }),
        );
}
