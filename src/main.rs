//! # Partner Live - Main Application Entry Point
//!
//! Sets up the Actix-web server that exposes the live voice session:
//!
//! ## Application Architecture:
//! - **config**: configuration from config.toml, `.env` and environment variables
//! - **audio / live**: the voice session itself (built once, shared by all handlers)
//! - **handlers**: `/api/v1/session/*` and `/api/v1/config`
//! - **websocket**: `/ws/session` status feed and commands
//! - **health**: `/health`, `/api/v1/health`, `/api/v1/metrics`
//! - **middleware**: request metrics (request logging comes from `TracingLogger`)
//!
//! ## Key Rust Concepts:
//! - `#[actix_web::main]`: sets up the async runtime
//! - `Arc<dyn Trait>`: the controller receives its device provider and
//!   transport as trait objects, so tests can substitute in-memory versions

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use partner_live::audio::ConfiguredDeviceProvider;
use partner_live::config::{AppConfig, DeviceBackend};
use partner_live::live::{GeminiLiveTransport, LiveSessionController};
use partner_live::state::AppState;
use partner_live::{handlers, health, middleware, websocket};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting partner-live v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.live.api_key.is_empty() {
        warn!("No API key configured; sessions will fail to connect until GEMINI_API_KEY is set");
    }
    match config.devices.backend {
        DeviceBackend::File if config.devices.input_wav.is_none() => {
            warn!("File devices selected but no microphone configured; set devices.input_wav to a WAV file");
        }
        backend => info!(?backend, "Audio device backend"),
    }

    let controller = Arc::new(LiveSessionController::new(
        Arc::new(ConfiguredDeviceProvider),
        Arc::new(GeminiLiveTransport::new()),
    ));
    let app_state = AppState::new(config.clone(), controller.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/stop", web::post().to(handlers::stop_session)),
            )
            .route("/ws/session", web::get().to(websocket::session_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Release the microphone, output device and connection before exiting
    controller.stop();

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, defaulting to
/// `partner_live=debug,actix_web=info`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "partner_live=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
