//! Ferry Server - runs a session group and exposes it to operators.
//!
//! The server loads a session group document, wires each session to its
//! adapters, and runs the sessions with [`ferry_engine`]. Operators watch
//! progress and resolve conflicts over HTTP and a WebSocket status stream.

pub mod adapters;
pub mod auth;
pub mod config;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod routes;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use ferry_engine::SessionGroupConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::adapters::AdapterCatalog;
use crate::config::Config;
use crate::error::Result;
use crate::monitor::StatusBoard;
use crate::orchestrator::{ErrorManagerRegistry, OrchestratorSettings, SyncOrchestrator};

/// Application state shared across handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub board: Arc<StatusBoard>,
    pub adapters: Arc<AdapterCatalog>,
}

/// Load the configured session group and bring it to `Initialized`.
pub async fn bootstrap(config: Config) -> Result<AppState> {
    let raw = tokio::fs::read_to_string(&config.group_config_path).await?;
    let group = SessionGroupConfig::from_json(&raw)?;
    bootstrap_group(config, group).await
}

/// Construct and initialize the orchestrator of `group`, restoring progress
/// from the state file when there is one.
pub async fn bootstrap_group(config: Config, group: SessionGroupConfig) -> Result<AppState> {
    let snapshot = match &config.state_path {
        Some(path) => SyncOrchestrator::load_snapshot(path).await?,
        None => None,
    };

    let board = Arc::new(StatusBoard::new());
    let adapters = Arc::new(AdapterCatalog::new());
    tracing::info!(group = %group.group_id, name = %group.name, sessions = group.sessions.len(), "loading session group");

    let orchestrator = SyncOrchestrator::new(
        group,
        OrchestratorSettings::from(&config),
        Arc::new(ErrorManagerRegistry::new()),
        Arc::clone(&board),
    )?;
    orchestrator.construct_pipelines(&adapters)?;
    orchestrator.initialize_pipelines(snapshot)?;

    Ok(AppState {
        config: Arc::new(config),
        orchestrator: Arc::new(orchestrator),
        board,
        adapters,
    })
}

/// Build the HTTP application.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
