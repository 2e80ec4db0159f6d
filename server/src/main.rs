//! Ferry Server binary.

use ferry_server::config::Config;
use ferry_server::monitor::spawn_monitor;
use ferry_server::orchestrator::OrchestrationStatus;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_server=debug,ferry_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Ferry Server on {}:{}", config.host, config.port);

    let addr = format!("{}:{}", config.host, config.port);
    let monitor_interval = config.monitor_interval;
    let state = ferry_server::bootstrap(config).await?;
    let orchestrator = state.orchestrator.clone();

    orchestrator.start()?;
    let monitor = spawn_monitor(orchestrator.clone(), monitor_interval);

    let app = ferry_server::build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if orchestrator.status() != OrchestrationStatus::Stopped {
        let finished = orchestrator.stop().await?;
        if !finished {
            tracing::warn!("exiting with sessions still running");
        }
    }
    monitor.abort();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
