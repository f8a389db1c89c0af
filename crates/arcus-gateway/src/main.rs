//! Arcus API Gateway Server
//!
//! Loads and validates the configuration, constructs the proxy module,
//! and serves the proxy surface plus health and debug endpoints until a
//! shutdown signal arrives.

use arcus_rs::config::settings::load_settings;
use arcus_rs::logs::logger::configure_logger;
use arcus_rs::models::settings::Settings;
use arcus_rs::module::ProxyModule;
use arcus_rs::routes::{debug, health, http as proxy_routes};

use actix_web::{middleware::Logger, App, HttpServer};
use log::{error, info};
use std::sync::Arc;
use tokio::signal;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize the logger
    configure_logger();

    // Parse configuration
    let config: Settings = load_settings().expect("Failed to load settings");

    info!("Starting Arcus API Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Init validates and constructs everything; configuration errors are
    // fatal here.
    let module = match ProxyModule::init(config, None) {
        Ok(module) => module,
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            std::process::exit(1);
        }
    };

    module.start();

    // Get server configuration from environment
    let host = std::env::var("ARCUS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("ARCUS_PORT")
        .unwrap_or_else(|_| "5900".to_string())
        .parse::<u16>()
        .unwrap_or(5900);

    info!("Starting server on {}:{}", host, port);

    let app_module = Arc::clone(&module);
    let server = HttpServer::new(move || {
        let module = Arc::clone(&app_module);
        App::new()
            .wrap(Logger::new(
                r#"%a "%r" %s %b "%{Referer}i" "%{User-Agent}i" %T"#,
            ))
            .wrap(actix_web::middleware::Compress::default())
            .configure(health::configure_health)
            .configure(|cfg| debug::configure_debug(cfg, Arc::clone(&module)))
            .configure(|cfg| proxy_routes::configure_proxy(cfg, module))
    })
    .bind((host.as_str(), port))?
    .run();

    info!("Server started successfully");

    // Graceful shutdown handling
    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("Server stopped gracefully"),
                Err(e) => error!("Server error: {}", e),
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
        }
    }

    module.stop().await;

    Ok(())
}
