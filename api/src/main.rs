use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use crm_gateway_core::clock::SystemClock;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod middleware;
mod push;
mod routes;
mod state;

use config::GatewayConfig;
use routes::RouterOptions;

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    let config = GatewayConfig::parse();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "crm_gateway_api=debug,crm_gateway_mcp_runtime=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Err(err) = config.validate() {
        tracing::error!(event = "config_invalid", error = %err, "invalid configuration");
        std::process::exit(2);
    }

    let dispatcher = match config.runtime_config().build_dispatcher(Arc::new(SystemClock)) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            tracing::error!(event = "config_invalid", error = %err, "failed to build the dispatcher");
            std::process::exit(2);
        }
    };

    let shutdown = CancellationToken::new();
    let sweeper = dispatcher
        .sessions()
        .spawn_sweeper(config.sweep_interval(), shutdown.child_token());

    let app_state = state::AppState::new(dispatcher, config.transport(), shutdown.clone());
    let app = routes::build_app(
        app_state,
        &RouterOptions {
            cors_origins: config.cors_origin_list(),
            rate_limit: !config.disable_rate_limit,
        },
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(event = "bind_failed", %addr, error = %err, "failed to bind listener");
            std::process::exit(1);
        }
    };
    tracing::info!(
        event = "gateway_started",
        %addr,
        crm_base_url = %config.crm_base_url,
        session_ttl_secs = config.session_ttl_secs,
        rate_limit = !config.disable_rate_limit,
        "CRM gateway listening on {}",
        addr
    );

    let signal = shutdown.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!(event = "shutdown_requested", "shutting down");
        signal.cancel();
    })
    .await;

    shutdown.cancel();
    let _ = sweeper.await;

    if let Err(err) = served {
        tracing::error!(event = "server_error", error = %err, "server exited with an error");
        std::process::exit(1);
    }
}
