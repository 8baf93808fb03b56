//! Cinder Core
//!
//! Block storage lifecycle service: loads the backend configuration, sets up
//! the lifecycle manager and serves the REST API, health and metrics
//! endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │   REST API (:8776)        Health (:8081)           Metrics (:8080)           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                           Lifecycle Manager                                  │
//! │        stats refresh / message expiry task (CancellationToken)               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                 Volume drivers            Backup drivers                     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cinder_core::{
    ApiServer, ApiServerConfig, DriverRegistry, Error, LifecycleManager, Result, ServiceConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cinder Core - block storage volume lifecycle orchestration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; built-in defaults when absent
    #[arg(long, env = "CINDER_CONFIG")]
    config: Option<String>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8776")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Service host name, overrides the configuration file
    #[arg(long, env = "CINDER_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Cinder Core");
    info!("  Version: {}", cinder_core::VERSION);
    info!("  REST API: {}", args.api_addr);

    let mut config = match args.config {
        Some(ref path) => {
            info!("  Config: {}", path);
            ServiceConfig::load(path)?
        }
        None => ServiceConfig::default(),
    };
    if let Some(ref host) = args.host {
        config.host = host.clone();
    }

    let manager = LifecycleManager::from_config(&config, &DriverRegistry::with_builtin()).await?;
    let refreshed = manager.refresh_backend_stats().await;
    info!("Initial stats collected from {} backends", refreshed);

    let cancel = CancellationToken::new();
    let background = tokio::spawn(run_periodic_tasks(
        manager.clone(),
        config.stats_interval(),
        cancel.clone(),
    ));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_manager).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_manager).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid REST API address: {}", e))
        })?,
        ..Default::default()
    };
    let api_server = ApiServer::new(api_config, manager.clone());

    let shutdown = api_server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown.send(());
        }
    });

    let result = api_server.run().await;

    cancel.cancel();
    if let Err(e) = background.await {
        warn!("Background task ended abnormally: {}", e);
    }

    result?;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Background Tasks
// =============================================================================

/// Refresh backend stats and expire old messages until cancelled
async fn run_periodic_tasks(
    manager: Arc<LifecycleManager>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Periodic tasks stopped");
                return;
            }
            _ = ticker.tick() => {
                let refreshed = manager.refresh_backend_stats().await;
                let expired = manager.messages().cleanup_expired(Utc::now());
                debug!("Refreshed {} backends, expired {} messages", refreshed, expired);
            }
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, manager: Arc<LifecycleManager>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let manager = manager.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => plain_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            let backends = manager.backends().await;
                            if backends.iter().any(|b| b.driver.is_initialized()) {
                                plain_response(StatusCode::OK, "ok")
                            } else {
                                plain_response(
                                    StatusCode::SERVICE_UNAVAILABLE,
                                    "no initialized backend",
                                )
                            }
                        }
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, manager: Arc<LifecycleManager>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let manager = manager.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match manager.metrics().encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = plain_response(StatusCode::OK, buffer);
                                if let Ok(value) = header::HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
                            }
                        },
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
