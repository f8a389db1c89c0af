//! End-to-end tests for the gateway core.
//!
//! These spin up real upstream servers on loopback ports and drive the
//! proxy module directly with constructed requests, verifying routing,
//! transformation, caching, and the service endpoints.

use arcus_rs::models::settings::{PathRewriteSettings, EndpointRewriteRule, BackendSettings, Settings};
use arcus_rs::module::ProxyModule;
use arcus_rs::routes::{debug, health};

use actix_web::body::to_bytes;
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::{test, web, App, HttpRequest, HttpResponse, HttpServer};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Binds an upstream app on an ephemeral loopback port and returns its
/// origin URL. The listener is live as soon as `bind` returns.
async fn spawn_upstream<F>(configure: F) -> String
where
    F: Fn(&mut web::ServiceConfig) + Clone + Send + 'static,
{
    let server = HttpServer::new(move || App::new().configure(configure.clone()))
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    format!("http://{}", addr)
}

async fn body_json(response: HttpResponse) -> Value {
    let bytes = to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[actix_web::test]
async fn test_health_endpoints() {
    let app = test::init_service(App::new().configure(health::configure_health)).await;

    for path in ["/health", "/ready", "/live"] {
        let req = test::TestRequest::get().uri(path).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200, "endpoint {}", path);
    }
}

#[actix_web::test]
async fn test_basic_proxy_forwarding() {
    let origin = spawn_upstream(|cfg: &mut web::ServiceConfig| {
        cfg.route(
            "/v1/users",
            web::get().to(|| async {
                HttpResponse::Ok().json(json!({"users": ["ada", "grace"]}))
            }),
        );
    })
    .await;

    let mut settings = Settings::default();
    settings.backend_services.insert("users".into(), origin);
    settings.routes.insert("/v1/users".into(), "users".into());

    let module = ProxyModule::init(settings, None).unwrap();
    module.start();

    let req = test::TestRequest::get().uri("/v1/users").to_http_request();
    let response = module.handle_request(&req, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"users": ["ada", "grace"]}));

    module.stop().await;
}

#[actix_web::test]
async fn test_unmatched_route_is_404() {
    let module = {
        let mut settings = Settings::default();
        settings
            .backend_services
            .insert("users".into(), "http://127.0.0.1:1".into());
        settings.routes.insert("/v1/users".into(), "users".into());
        ProxyModule::init(settings, None).unwrap()
    };

    let req = test::TestRequest::get().uri("/nope").to_http_request();
    let response = module.handle_request(&req, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_default_backend_catches_unmatched_routes() {
    let origin = spawn_upstream(|cfg: &mut web::ServiceConfig| {
        cfg.service(web::resource("/{tail:.*}").to(|| async {
            HttpResponse::Ok().json(json!({"served_by": "default"}))
        }));
    })
    .await;

    let mut settings = Settings::default();
    settings.backend_services.insert("fallback".into(), origin);
    settings.default_backend = "fallback".into();

    let module = ProxyModule::init(settings, None).unwrap();
    let req = test::TestRequest::get().uri("/anything").to_http_request();
    let response = module.handle_request(&req, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["served_by"], "default");
}

#[actix_web::test]
async fn test_path_rewrite_reaches_backend_rewritten() {
    // The upstream echoes the path it received.
    let origin = spawn_upstream(|cfg: &mut web::ServiceConfig| {
        cfg.service(web::resource("/{tail:.*}").to(|req: HttpRequest| async move {
            HttpResponse::Ok().json(json!({"path": req.path()}))
        }));
    })
    .await;

    let mut settings = Settings::default();
    settings.backend_services.insert("users".into(), origin);
    settings
        .routes
        .insert("/api/v1/users/*".into(), "users".into());
    settings.backend_configs.insert(
        "users".into(),
        BackendSettings {
            path_rewriting: PathRewriteSettings {
                strip_base_path: "/api/v1".into(),
                base_path_rewrite: "/internal/api".into(),
                endpoint_rewrites: vec![EndpointRewriteRule {
                    pattern: "/internal/api/users/*".into(),
                    replacement: "/users".into(),
                    strip_query_params: false,
                }],
            },
            ..Default::default()
        },
    );

    let module = ProxyModule::init(settings, None).unwrap();
    let req = test::TestRequest::get()
        .uri("/api/v1/users/42/profile")
        .to_http_request();
    let response = module.handle_request(&req, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["path"], "/users/42/profile");
}

#[actix_web::test]
async fn test_tenant_required_yields_400() {
    let mut settings = Settings::default();
    settings
        .backend_services
        .insert("users".into(), "http://127.0.0.1:1".into());
    settings.routes.insert("/v1/users".into(), "users".into());
    settings.require_tenant_id = true;

    let module = ProxyModule::init(settings, None).unwrap();

    let req = test::TestRequest::get().uri("/v1/users").to_http_request();
    let response = module.handle_request(&req, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // With the header present the request proceeds (and fails upstream,
    // which is a different status).
    let req = test::TestRequest::get()
        .uri("/v1/users")
        .insert_header(("X-Tenant-ID", "acme"))
        .to_http_request();
    let response = module.handle_request(&req, Bytes::new()).await;
    assert_ne!(response.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_cache_serves_second_get_without_backend_hit() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_upstream = Arc::clone(&hits);
    let origin = spawn_upstream(move |cfg: &mut web::ServiceConfig| {
        let hits = Arc::clone(&hits_for_upstream);
        cfg.service(web::resource("/v1/users").to(move || {
            let hits = Arc::clone(&hits);
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                HttpResponse::Ok().json(json!({"hit": n}))
            }
        }));
    })
    .await;

    let mut settings = Settings::default();
    settings.backend_services.insert("users".into(), origin);
    settings.routes.insert("/v1/users".into(), "users".into());
    settings.cache_enabled = true;
    settings.cache_ttl = 60;

    let module = ProxyModule::init(settings, None).unwrap();

    let req = test::TestRequest::get().uri("/v1/users").to_http_request();
    let first = module.handle_request(&req, Bytes::new()).await;
    assert_eq!(body_json(first).await["hit"], 1);

    let req = test::TestRequest::get().uri("/v1/users").to_http_request();
    let second = module.handle_request(&req, Bytes::new()).await;
    assert_eq!(body_json(second).await["hit"], 1);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[actix_web::test]
async fn test_post_is_never_cached() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_upstream = Arc::clone(&hits);
    let origin = spawn_upstream(move |cfg: &mut web::ServiceConfig| {
        let hits = Arc::clone(&hits_for_upstream);
        cfg.service(web::resource("/v1/users").to(move || {
            let hits = Arc::clone(&hits);
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                HttpResponse::Ok().json(json!({"hit": n}))
            }
        }));
    })
    .await;

    let mut settings = Settings::default();
    settings.backend_services.insert("users".into(), origin);
    settings.routes.insert("/v1/users".into(), "users".into());
    settings.cache_enabled = true;

    let module = ProxyModule::init(settings, None).unwrap();
    for _ in 0..2 {
        let req = test::TestRequest::post().uri("/v1/users").to_http_request();
        let _ = module.handle_request(&req, Bytes::new()).await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[actix_web::test]
async fn test_debug_endpoints_with_bearer_token() {
    let mut settings = Settings::default();
    settings
        .backend_services
        .insert("users".into(), "http://127.0.0.1:1".into());
    settings.routes.insert("/v1/users".into(), "users".into());
    settings.debug_endpoints.enabled = true;
    settings.debug_endpoints.bearer_token = Some("secret-token".into());

    let module = ProxyModule::init(settings, None).unwrap();
    let app = test::init_service(
        App::new().configure(|cfg| debug::configure_debug(cfg, Arc::clone(&module))),
    )
    .await;

    // No token: refused.
    let req = test::TestRequest::get().uri("/debug/info").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Valid token: full snapshot set.
    for path in [
        "/debug/info",
        "/debug/backends",
        "/debug/flags",
        "/debug/circuit-breakers",
        "/debug/health-checks",
    ] {
        let req = test::TestRequest::get()
            .uri(path)
            .insert_header(("Authorization", "Bearer secret-token"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK, "endpoint {}", path);
    }
}

#[actix_web::test]
async fn test_request_headers_are_rewritten_on_the_way_out() {
    let origin = spawn_upstream(|cfg: &mut web::ServiceConfig| {
        cfg.service(web::resource("/v1/echo").to(|req: HttpRequest| async move {
            let tier = req
                .headers()
                .get("X-Tier")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            let auth = req.headers().contains_key("Authorization");
            HttpResponse::Ok().json(json!({"tier": tier, "auth_forwarded": auth}))
        }));
    })
    .await;

    let mut settings = Settings::default();
    settings.backend_services.insert("echo".into(), origin);
    settings.routes.insert("/v1/echo".into(), "echo".into());
    settings.backend_configs.insert(
        "echo".into(),
        BackendSettings {
            header_rewriting: arcus_rs::models::settings::HeaderRewriteSettings {
                set_headers: [("X-Tier".to_string(), "internal".to_string())]
                    .into_iter()
                    .collect(),
                remove_headers: vec!["Authorization".into()],
            },
            ..Default::default()
        },
    );

    let module = ProxyModule::init(settings, None).unwrap();
    let req = test::TestRequest::get()
        .uri("/v1/echo")
        .insert_header(("Authorization", "Bearer client-token"))
        .to_http_request();
    let response = module.handle_request(&req, Bytes::new()).await;
    let body = body_json(response).await;
    assert_eq!(body["tier"], "internal");
    assert_eq!(body["auth_forwarded"], false);
}
