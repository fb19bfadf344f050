//! # Transcription Jobs - Main Application Entry Point
//!
//! HTTP service that accepts audio uploads, runs them as jobs on a managed
//! transcription service and keeps the job rows clients see consistent with
//! what the service actually did.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc**: Shared ownership of the engine across worker threads
//! - **CancellationToken**: One shutdown signal observed by every background task
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **stores**: Object store, metadata store and managed service adapters
//! - **jobs**: Submission, polling, reconciliation and client sessions
//! - **state**: Shared application state and metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and per-endpoint metrics
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: HTTP error responses

mod config;
mod error;
mod handlers;
mod health;
mod jobs;
mod middleware;
mod state;
mod stores;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::{AppConfig, StartMode};
use jobs::session::SessionRegistry;
use jobs::{EngineSettings, JobEngine};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use stores::{Backends, ObjectStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sessions with no request and no active wait for this long are dropped.
const SESSION_IDLE_TTL: Duration = Duration::from_secs(3600);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Opens the backends** (object store, metadata store, managed service)
/// 4. **Builds the job engine** and, in storage-trigger mode, starts the trigger
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
///
/// `--print-config` prints the effective configuration as TOML and exits.
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    let config = AppConfig::load()?;
    config.validate()?;

    if std::env::args().any(|arg| arg == "--print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let backends = Backends::from_config(&config).await?;
    let engine = Arc::new(JobEngine::new(&backends, EngineSettings::from_config(&config)));
    let sessions = Arc::new(SessionRegistry::new(
        Duration::from_millis(config.polling.refresh_interval_ms),
        SESSION_IDLE_TTL,
    ));

    let shutdown = CancellationToken::new();

    let trigger_task = match config.service.start_mode {
        StartMode::StorageTrigger => {
            let trigger = Arc::new(engine.storage_trigger());
            Some(trigger.spawn(backends.objects.subscribe(), shutdown.clone()))
        }
        StartMode::Explicit => None,
    };

    let app_state = AppState::new(config.clone(), engine, sessions, backends.simulator.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let mut api = web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(handlers::get_config))
            .route("/config", web::put().to(handlers::update_config))
            .route("/history", web::get().to(handlers::get_history))
            .route("/reconcile", web::post().to(handlers::reconcile))
            .route("/callbacks/job-state", web::post().to(handlers::job_state_callback))
            .configure(handlers::configure_job_routes);

        if app_state.simulator.is_some() {
            api = api.configure(handlers::configure_debug_routes);
        }

        // Middleware executes in reverse order of registration for requests
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(api)
            .route("/health", web::get().to(health::health_check))
    })
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
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    shutdown.cancel();
    if let Some(task) = trigger_task {
        if let Err(e) = task.await {
            error!("Storage trigger task error: {}", e);
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "transcription_jobs=trace")
/// - If not set, defaults to "transcription_jobs=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcription_jobs=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT (Ctrl+C).
///
/// Handlers that cannot be installed are logged and skipped; Ctrl+C through
/// `tokio::signal::ctrl_c` still works on every platform.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received SIGINT");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT");
            }
        }

        shutdown.cancel();
    });
}
