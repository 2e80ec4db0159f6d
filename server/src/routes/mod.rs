//! HTTP route definitions.

mod conflicts;
mod health;
mod rules;
mod sessions;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sessions::routes())
        .merge(conflicts::routes())
        .merge(rules::routes())
        .merge(crate::websocket::routes())
}
