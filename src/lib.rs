pub mod appresult;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{debug_handler, extract::{FromRef, State}, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
pub use config::Config;
pub use error::{ChatError, ChatResult};

use db::SqliteStore;
use gateway::Gateway;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway: Arc::new(gateway) }
    }
}

/// Connects the store and assembles the coordinator.
pub async fn build(config: &Config) -> anyhow::Result<AppState> {
    let store = SqliteStore::connect(&config.database_url, config.db_max_connections, config.store_timeout).await?;
    let gateway = Gateway::new(Arc::new(store), config.join_policy, config.broadcast_capacity);
    Ok(AppState::new(gateway))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(rooms::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[debug_handler(state = AppState)]
async fn health(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    Json(json!({ "status": "ok", "sessions": gateway.sessions.online_count() }))
}
