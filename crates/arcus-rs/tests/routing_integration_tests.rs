//! End-to-end routing scenarios: round-robin with circuit breakers,
//! feature-flag fallback with dry-run, tenant isolation, tenant timeout
//! overrides, and map/reduce routes driven through the module.

use arcus_rs::models::events::{GatewayEvent, RecordingEmitter};
use arcus_rs::models::settings::{
    CircuitBreakerSettings, CompositeRouteSettings, CompositeStrategy, FeatureFlagSettings,
    MapReduceSettings, MergeStrategy, RouteSettings, Settings,
};
use arcus_rs::module::ProxyModule;

use actix_web::body::to_bytes;
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::{test, web, App, HttpResponse, HttpServer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

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

/// Upstream that answers every path with a fixed JSON document.
async fn spawn_static_upstream(body: Value) -> String {
    spawn_upstream(move |cfg: &mut web::ServiceConfig| {
        let body = body.clone();
        cfg.service(web::resource("/{tail:.*}").to(move || {
            let body = body.clone();
            async move { HttpResponse::Ok().json(body) }
        }));
    })
    .await
}

async fn body_json(response: HttpResponse) -> Value {
    let bytes = to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn send(module: &ProxyModule, uri: &str) -> HttpResponse {
    let req = test::TestRequest::get().uri(uri).to_http_request();
    module.handle_request(&req, Bytes::new()).await
}

async fn send_with_tenant(module: &ProxyModule, uri: &str, tenant: &str) -> HttpResponse {
    let req = test::TestRequest::get()
        .uri(uri)
        .insert_header(("X-Tenant-ID", tenant))
        .to_http_request();
    module.handle_request(&req, Bytes::new()).await
}

#[actix_web::test]
async fn test_round_robin_skips_open_circuit() {
    let b1 = spawn_static_upstream(json!({"backend": "b1"})).await;
    let b3 = spawn_static_upstream(json!({"backend": "b3"})).await;

    let mut settings = Settings::default();
    settings.backend_services.insert("b1".into(), b1);
    // b2 resolves but refuses connections
    settings
        .backend_services
        .insert("b2".into(), "http://127.0.0.1:1".into());
    settings.backend_services.insert("b3".into(), b3);
    settings
        .routes
        .insert("/api/group/*".into(), "b1,b2,b3".into());
    settings.routes.insert("/api/only-b2".into(), "b2".into());
    settings.circuit_breaker = CircuitBreakerSettings {
        enabled: true,
        failure_threshold: 1,
        success_threshold: 1,
        open_timeout: 60,
        half_open_allowed_requests: 1,
    };

    let module = ProxyModule::init(settings, None).unwrap();

    // Open b2's circuit with one direct failure.
    let response = send(&module, "/api/only-b2").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // Six group requests distribute 3/3 across the remaining backends.
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..6 {
        let response = send(&module, "/api/group/items").await;
        assert_eq!(response.status(), StatusCode::OK);
        let backend = body_json(response).await["backend"]
            .as_str()
            .unwrap()
            .to_string();
        *counts.entry(backend).or_default() += 1;
    }
    assert_eq!(counts.get("b1"), Some(&3));
    assert_eq!(counts.get("b3"), Some(&3));
    assert_eq!(counts.get("b2"), None);
}

#[actix_web::test]
async fn test_round_robin_all_unhealthy_is_503() {
    let mut settings = Settings::default();
    settings
        .backend_services
        .insert("b1".into(), "http://127.0.0.1:1".into());
    settings
        .backend_services
        .insert("b2".into(), "http://127.0.0.1:1".into());
    settings.routes.insert("/api/group".into(), "b1,b2".into());
    settings.routes.insert("/api/b1".into(), "b1".into());
    settings.routes.insert("/api/b2".into(), "b2".into());
    settings.circuit_breaker.failure_threshold = 1;

    let module = ProxyModule::init(settings, None).unwrap();
    let _ = send(&module, "/api/b1").await;
    let _ = send(&module, "/api/b2").await;

    let response = send(&module, "/api/group").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[actix_web::test]
async fn test_flag_disabled_serves_alternative_with_dry_run_comparison() {
    let legacy = spawn_static_upstream(json!({"source": "legacy"})).await;
    let v2 = spawn_static_upstream(json!({"source": "v2"})).await;

    let mut settings = Settings::default();
    settings.backend_services.insert("legacy".into(), legacy);
    settings.backend_services.insert("v2".into(), v2);
    settings.routes.insert("/api/composite".into(), "v2".into());
    settings.route_configs.insert(
        "/api/composite".into(),
        RouteSettings {
            feature_flag_id: Some("v2-enabled".into()),
            alternative_backend: Some("legacy".into()),
            dry_run: true,
            dry_run_backend: Some("v2".into()),
            ..Default::default()
        },
    );
    settings.feature_flags = FeatureFlagSettings {
        enabled: true,
        flags: [("v2-enabled".to_string(), false)].into_iter().collect(),
    };

    let emitter = Arc::new(RecordingEmitter::new());
    let module = ProxyModule::init(settings, Some(emitter.clone())).unwrap();

    let response = send(&module, "/api/composite").await;
    assert_eq!(response.status(), StatusCode::OK);
    // The client always sees the alternative (primary) response.
    assert_eq!(body_json(response).await["source"], "legacy");

    let comparison = emitter
        .recorded()
        .into_iter()
        .find_map(|event| match event {
            GatewayEvent::DryRunComparison {
                primary_backend,
                secondary_backend,
                body_match,
                ..
            } => Some((primary_backend, secondary_backend, body_match)),
            _ => None,
        })
        .expect("dry-run comparison event");
    assert_eq!(comparison.0, "legacy");
    assert_eq!(comparison.1, "v2");
    assert!(!comparison.2);
}

#[actix_web::test]
async fn test_flag_disabled_without_alternative_is_404() {
    let v2 = spawn_static_upstream(json!({"source": "v2"})).await;

    let mut settings = Settings::default();
    settings.backend_services.insert("v2".into(), v2);
    settings.routes.insert("/api/new".into(), "v2".into());
    settings.route_configs.insert(
        "/api/new".into(),
        RouteSettings {
            feature_flag_id: Some("v2-enabled".into()),
            ..Default::default()
        },
    );
    settings.feature_flags = FeatureFlagSettings {
        enabled: true,
        flags: [("v2-enabled".to_string(), false)].into_iter().collect(),
    };

    let module = ProxyModule::init(settings, None).unwrap();
    let response = send(&module, "/api/new").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_unset_flag_counts_as_enabled() {
    let v2 = spawn_static_upstream(json!({"source": "v2"})).await;

    let mut settings = Settings::default();
    settings.backend_services.insert("v2".into(), v2);
    settings.routes.insert("/api/new".into(), "v2".into());
    settings.route_configs.insert(
        "/api/new".into(),
        RouteSettings {
            feature_flag_id: Some("not-configured".into()),
            alternative_backend: None,
            ..Default::default()
        },
    );
    settings.feature_flags.enabled = true;

    let module = ProxyModule::init(settings, None).unwrap();
    let response = send(&module, "/api/new").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["source"], "v2");
}

#[actix_web::test]
async fn test_tenant_url_overrides_are_isolated() {
    let global_upstream = spawn_static_upstream(json!({"origin": "global"})).await;
    let t1_upstream = spawn_static_upstream(json!({"origin": "tenant-one"})).await;
    let t2_upstream = spawn_static_upstream(json!({"origin": "tenant-two"})).await;

    let mut settings = Settings::default();
    settings
        .backend_services
        .insert("users".into(), global_upstream);
    settings.routes.insert("/api/users".into(), "users".into());

    let mut t1 = Settings::default();
    t1.backend_services.insert("users".into(), t1_upstream);
    let mut t2 = Settings::default();
    t2.backend_services.insert("users".into(), t2_upstream);
    settings.tenants.insert("t1".into(), t1);
    settings.tenants.insert("t2".into(), t2);

    let module = ProxyModule::init(settings, None).unwrap();
    module.start();

    // Interleave tenants; each must only ever reach its own origin.
    for _ in 0..3 {
        let response = send_with_tenant(&module, "/api/users", "t1").await;
        assert_eq!(body_json(response).await["origin"], "tenant-one");

        let response = send_with_tenant(&module, "/api/users", "t2").await;
        assert_eq!(body_json(response).await["origin"], "tenant-two");

        let response = send(&module, "/api/users").await;
        assert_eq!(body_json(response).await["origin"], "global");
    }

    module.stop().await;
}

#[actix_web::test]
async fn test_tenant_timeout_override() {
    // The upstream sleeps 2.5s on every request.
    let origin = spawn_upstream(|cfg: &mut web::ServiceConfig| {
        cfg.service(web::resource("/{tail:.*}").to(|| async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            HttpResponse::Ok().json(json!({"slow": true}))
        }));
    })
    .await;

    let mut settings = Settings::default();
    settings.backend_services.insert("slow".into(), origin);
    settings.routes.insert("/api/slow".into(), "slow".into());
    settings.request_timeout = 30;
    settings.tenants.insert(
        "impatient".into(),
        Settings {
            request_timeout: 1,
            ..Default::default()
        },
    );

    let module = ProxyModule::init(settings, None).unwrap();

    // Tenant request times out quickly.
    let started = Instant::now();
    let response = send_with_tenant(&module, "/api/slow", "impatient").await;
    assert!(matches!(
        response.status(),
        StatusCode::GATEWAY_TIMEOUT | StatusCode::BAD_GATEWAY
    ));
    assert!(started.elapsed() < Duration::from_secs(2));

    // Without the tenant header the global timeout applies and the request
    // completes.
    let response = send(&module, "/api/slow").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_map_reduce_sequential_enrich_route() {
    let conversations = spawn_static_upstream(
        json!({"conversations": [{"id": "c1"}, {"id": "c2"}, {"id": "c3"}]}),
    )
    .await;
    let followups = spawn_static_upstream(
        json!({"followups": [{"conversation_id": "c1", "is_followup": true}]}),
    )
    .await;

    let mut settings = Settings::default();
    settings
        .backend_services
        .insert("conversations".into(), conversations);
    settings
        .backend_services
        .insert("followups".into(), followups);
    settings
        .routes
        .insert("/api/conversations".into(), "enriched".into());
    settings.composite_routes.insert(
        "enriched".into(),
        CompositeRouteSettings {
            pattern: "/api/conversations".into(),
            backends: vec!["conversations".into(), "followups".into()],
            strategy: CompositeStrategy::MapReduce,
            map_reduce: Some(MapReduceSettings::Sequential {
                source_backend: "conversations".into(),
                target_backend: "followups".into(),
                extract_path: "conversations".into(),
                extract_field: "id".into(),
                target_request_path: "/bulk".into(),
                target_request_method: "POST".into(),
                target_request_field: "conversation_ids".into(),
                merge_strategy: MergeStrategy::Enrich,
                allow_empty_responses: false,
                merge_into_field: Some("followup_data".into()),
            }),
            ..Default::default()
        },
    );

    let module = ProxyModule::init(settings, None).unwrap();
    let response = send(&module, "/api/conversations").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({
            "conversations": [{"id": "c1"}, {"id": "c2"}, {"id": "c3"}],
            "followup_data": {"followups": [{"conversation_id": "c1", "is_followup": true}]}
        })
    );
}

#[actix_web::test]
async fn test_map_reduce_parallel_join_route() {
    let base = spawn_static_upstream(json!([{"id": "1"}, {"id": "2"}, {"id": "3"}])).await;
    let extras =
        spawn_static_upstream(json!([{"id": "1", "extra": "a"}, {"id": "3", "extra": "c"}]))
            .await;

    let mut settings = Settings::default();
    settings.backend_services.insert("base".into(), base);
    settings.backend_services.insert("extras".into(), extras);
    settings.routes.insert("/api/joined".into(), "joined".into());
    settings.composite_routes.insert(
        "joined".into(),
        CompositeRouteSettings {
            pattern: "/api/joined".into(),
            backends: vec!["base".into(), "extras".into()],
            strategy: CompositeStrategy::MapReduce,
            map_reduce: Some(MapReduceSettings::Parallel {
                backends: vec!["base".into(), "extras".into()],
                join_field: Some("id".into()),
                merge_strategy: MergeStrategy::Join,
                filter_on_empty: true,
                allow_empty_responses: false,
                merge_into_field: None,
            }),
            ..Default::default()
        },
    );

    let module = ProxyModule::init(settings, None).unwrap();
    let response = send(&module, "/api/joined").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!([{"id": "1", "extra": "a"}, {"id": "3", "extra": "c"}])
    );
}

#[actix_web::test]
async fn test_composite_merge_returns_first_configured_backend() {
    let alpha = spawn_static_upstream(json!({"from": "alpha"})).await;
    let beta = spawn_static_upstream(json!({"from": "beta"})).await;

    let mut settings = Settings::default();
    settings.backend_services.insert("alpha".into(), alpha);
    settings.backend_services.insert("beta".into(), beta);
    settings
        .routes
        .insert("/api/combined".into(), "combined".into());
    settings.composite_routes.insert(
        "combined".into(),
        CompositeRouteSettings {
            pattern: "/api/combined".into(),
            backends: vec!["alpha".into(), "beta".into()],
            strategy: CompositeStrategy::Parallel,
            ..Default::default()
        },
    );

    let module = ProxyModule::init(settings, None).unwrap();
    for _ in 0..4 {
        let response = send(&module, "/api/combined").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["from"], "alpha");
    }
}

#[actix_web::test]
async fn test_group_route_dry_run_wraps_selected_backend() {
    let b1 = spawn_static_upstream(json!({"backend": "b1"})).await;
    let b2 = spawn_static_upstream(json!({"backend": "b2"})).await;
    let shadow = spawn_static_upstream(json!({"backend": "shadow"})).await;

    let mut settings = Settings::default();
    settings.backend_services.insert("b1".into(), b1);
    settings.backend_services.insert("b2".into(), b2);
    settings.backend_services.insert("shadow".into(), shadow);
    settings.routes.insert("/api/group".into(), "b1,b2".into());
    settings.route_configs.insert(
        "/api/group".into(),
        RouteSettings {
            dry_run: true,
            dry_run_backend: Some("shadow".into()),
            ..Default::default()
        },
    );

    let emitter = Arc::new(RecordingEmitter::new());
    let module = ProxyModule::init(settings, Some(emitter.clone())).unwrap();

    let response = send(&module, "/api/group").await;
    assert_eq!(response.status(), StatusCode::OK);
    // The client sees a group member, never the shadow.
    let backend = body_json(response).await["backend"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(backend == "b1" || backend == "b2");

    let comparison = emitter
        .recorded()
        .into_iter()
        .find_map(|event| match event {
            GatewayEvent::DryRunComparison {
                primary_backend,
                secondary_backend,
                ..
            } => Some((primary_backend, secondary_backend)),
            _ => None,
        })
        .expect("dry-run comparison event for the group route");
    assert_eq!(comparison.0, backend);
    assert_eq!(comparison.1, "shadow");
}

#[actix_web::test]
async fn test_round_robin_fairness_over_many_requests() {
    let b1 = spawn_static_upstream(json!({"backend": "b1"})).await;
    let b2 = spawn_static_upstream(json!({"backend": "b2"})).await;
    let b3 = spawn_static_upstream(json!({"backend": "b3"})).await;

    let mut settings = Settings::default();
    settings.backend_services.insert("b1".into(), b1);
    settings.backend_services.insert("b2".into(), b2);
    settings.backend_services.insert("b3".into(), b3);
    settings
        .routes
        .insert("/api/group".into(), "b1,b2,b3".into());

    let module = ProxyModule::init(settings, None).unwrap();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..12 {
        let response = send(&module, "/api/group").await;
        let backend = body_json(response).await["backend"]
            .as_str()
            .unwrap()
            .to_string();
        *counts.entry(backend).or_default() += 1;
    }
    for backend in ["b1", "b2", "b3"] {
        let count = *counts.get(backend).unwrap_or(&0);
        assert!(
            (3..=5).contains(&count),
            "backend {} got {} of 12 selections",
            backend,
            count
        );
    }
}
