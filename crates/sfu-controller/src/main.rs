//! SFU Controller
//!
//! WebSocket signaling broker for a selective forwarding unit.
//!
//! # Servers
//!
//! - WebSocket signaling server at `/ws` (default: 0.0.0.0:3000)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start the mediasoup worker pool
//! 4. Initialize actor system (`RoomRegistryHandle`)
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start WebSocket signaling server and mark ready
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sfu_controller::actors::{ActorMetrics, RoomRegistryHandle};
use sfu_controller::config::Config;
use sfu_controller::engine::mediasoup_engine::{MediasoupEngine, MediasoupSettings};
use sfu_controller::engine::MediaEngine;
use sfu_controller::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_controller::signaling::{ConnectionLimits, SignalingGateway, SignalingServer};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for rooms to release their media resources at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Wait after requesting shutdown before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sfu_id = %config.sfu_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        engine_timeout_ms = u64::try_from(config.engine_timeout.as_millis()).unwrap_or(u64::MAX),
        empty_room_ttl_ms = u64::try_from(config.empty_room_ttl.as_millis()).unwrap_or(u64::MAX),
        max_connections = config.max_connections,
        workers = config.workers,
        rtc_listen_ip = %config.rtc_listen_ip,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new(config.sfu_id.clone()));

    info!(workers = config.workers, "Starting mediasoup workers...");
    let engine = MediasoupEngine::start(MediasoupSettings {
        workers: config.workers,
        listen_ip: config.rtc_listen_ip,
        announced_address: config.rtc_announced_address.clone(),
        rtc_min_port: config.rtc_min_port,
        rtc_max_port: config.rtc_max_port,
    })
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start media engine");
        e
    })?;
    let engine: Arc<dyn MediaEngine> = Arc::new(engine);
    info!("Media engine started");

    // Initialize actor system
    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::with_empty_room_ttl(
        config.sfu_id.clone(),
        engine,
        config.engine_timeout,
        config.empty_room_ttl,
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Cancelled together with the registry
    let shutdown_token = registry.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start WebSocket signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = SignalingServer::new(
        SignalingGateway::new(registry.clone(), Arc::clone(&actor_metrics)),
        ConnectionLimits {
            max_connections: config.max_connections,
            max_message_size: config.max_message_size,
            outbound_buffer: config.outbound_buffer,
        },
    )
    .router()
    .layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("SFU Controller running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Readiness drops before rooms are torn down
    health_state.set_draining();

    // Registry shutdown cancels the listeners through their child tokens
    if let Err(e) = registry.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    // Give rooms time to release their routers before the workers exit
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("SFU Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
