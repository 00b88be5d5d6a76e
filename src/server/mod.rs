//! Management API: axum router exposing model CRUD, a manual cycle
//! trigger and read-only portfolio queries.

mod error;
mod routes;

pub use error::ApiError;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::engine::EngineService;
use crate::oracle::PriceProvider;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub service: Arc<EngineService>,
    pub prices: Arc<dyn PriceProvider>,
    pub config: Arc<Config>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/models",
            get(routes::list_models).post(routes::create_model),
        )
        .route(
            "/api/models/:id",
            axum::routing::put(routes::update_model).delete(routes::delete_model),
        )
        .route("/api/models/:id/execute", axum::routing::post(routes::execute_model))
        .route("/api/models/:id/portfolio", get(routes::get_portfolio))
        .route("/api/models/:id/trades", get(routes::get_trades))
        .route("/api/models/:id/conversations", get(routes::get_conversations))
        .route("/api/market/prices", get(routes::get_prices))
        .route("/api/leaderboard", get(routes::get_leaderboard))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until ctrl-c.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let app = router(state);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(addr = %addr, "Management API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")
}
