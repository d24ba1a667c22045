use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod events;
mod metrics;
mod middleware;
mod relay;
mod sdk;
mod sse;
mod store;
mod utils;

use api::AppState;
use config::Config;
use relay::Relay;
use sdk::PollingClientFactory;
use sdk::eval::FallthroughEvaluator;

/// Cadence of the built-in polling engine's dataset refresh.
const UPSTREAM_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing. Per-environment log levels widen the crate-level
    // directive; RUST_LOG always wins.
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("invalid configuration: {}", e);
        std::process::exit(1);
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(&config)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    // One process-wide upstream HTTP client, shared by the SDK engine, the
    // event forwarders, and the goals proxy.
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let factory = Arc::new(PollingClientFactory::new(
        http.clone(),
        UPSTREAM_POLL_INTERVAL,
    ));

    let relay = match Relay::new(config.clone(), factory, http).await {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!("failed to start relay: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "relay configured with {} environment(s)",
        config.environments.len()
    );

    if config.main.exit_on_error {
        // Startup is gated on every environment coming up cleanly.
        let startup_window = config.init_timeout() + Duration::from_secs(5);
        if let Err(e) = relay.wait_for_all(startup_window).await {
            tracing::error!("environment initialization failed: {}", e);
            relay.close().await;
            std::process::exit(1);
        }
        tracing::info!("all environments initialized");
    }

    // Build router
    let state = AppState::new(relay.clone(), Arc::new(FallthroughEvaluator));
    let app = api::routes::router(state).layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.main.host, config.main.port).parse()?;
    tracing::info!("Starting relay on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay.close().await;
    tracing::info!("Relay shutdown complete");
    Ok(())
}

/// Default tracing filter: crate at info (or the most verbose configured
/// per-environment level), quiet HTTP internals.
fn default_filter(config: &Config) -> String {
    let mut level = "info";
    for env in config.environments.values() {
        if let Some(env_level) = env.log_level.as_deref() {
            if ["trace", "debug"].contains(&env_level) {
                level = if env_level == "trace" { "trace" } else { "debug" };
            }
        }
    }
    format!("flagrelay={},tower_http=info", level)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
