//! Management API handlers: model CRUD, manual triggers and read-only
//! portfolio/history queries.

use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::db::ModelPatch;
use crate::engine::{CycleReport, PortfolioValuer};
use crate::models::TradingModel;
use crate::oracle::PriceProvider;

use super::error::ApiError;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateModelRequest {
    pub name: String,
    pub api_key: String,
    pub api_url: String,
    pub model_name: String,
    pub initial_capital: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateModelRequest {
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub model_name: Option<String>,
    pub initial_capital: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub model_id: i64,
    pub model_name: String,
    pub account_value: Decimal,
    pub returns: Decimal,
    pub initial_capital: f64,
}

/// Reject empty or whitespace-only values; trims accepted ones.
fn required(field: &str, value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{field} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

fn optional(field: &str, value: Option<String>) -> Result<Option<String>, ApiError> {
    value.map(|v| required(field, &v)).transpose()
}

// ==================== Models ====================

pub async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<TradingModel>>, ApiError> {
    Ok(Json(state.db.list_models().await?))
}

pub async fn create_model(
    State(state): State<AppState>,
    Json(request): Json<CreateModelRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = required("name", &request.name)?;
    let api_key = required("api_key", &request.api_key)?;
    let api_url = required("api_url", &request.api_url)?;
    let model_name = required("model_name", &request.model_name)?;

    let initial_capital = request.initial_capital.unwrap_or(100000.0);
    if initial_capital <= 0.0 {
        return Err(ApiError::BadRequest(
            "initial_capital must be positive".to_string(),
        ));
    }

    let id = state
        .db
        .insert_model(&name, &api_key, &api_url, &model_name, initial_capital)
        .await?;

    if let Some(model) = state.db.get_model(id).await? {
        state.service.register(&model).await;
        info!(model_id = id, name = %model.name, "Model added");
    }

    Ok(Json(json!({ "id": id, "message": "Model added successfully" })))
}

pub async fn update_model(
    State(state): State<AppState>,
    Path(model_id): Path<i64>,
    Json(request): Json<UpdateModelRequest>,
) -> Result<Json<Value>, ApiError> {
    let patch = ModelPatch {
        name: optional("name", request.name)?,
        api_key: optional("api_key", request.api_key)?,
        api_url: optional("api_url", request.api_url)?,
        model_name: optional("model_name", request.model_name)?,
        initial_capital: request.initial_capital,
    };

    if patch.is_empty() {
        return Err(ApiError::BadRequest(
            "No fields provided to update".to_string(),
        ));
    }
    if matches!(patch.initial_capital, Some(c) if c <= 0.0) {
        return Err(ApiError::BadRequest(
            "initial_capital must be positive".to_string(),
        ));
    }

    if !state.db.update_model(model_id, &patch).await? {
        return Err(ApiError::NotFound(format!("model {model_id}")));
    }

    // Reload the engine's decision client with the new credentials.
    if let Some(model) = state.db.get_model(model_id).await? {
        state.service.register(&model).await;
        info!(model_id, name = %model.name, "Model updated and engine reloaded");
    }

    Ok(Json(json!({ "message": "Model updated successfully" })))
}

pub async fn delete_model(
    State(state): State<AppState>,
    Path(model_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.service.deregister(model_id).await;
    state.db.delete_model(model_id).await?;

    info!(model_id, "Model deleted");
    Ok(Json(json!({ "message": "Model deleted successfully" })))
}

// ==================== Trading ====================

/// Manual trigger: runs one cycle synchronously and returns the report
/// verbatim. Racing the background sweep yields 409.
pub async fn execute_model(
    State(state): State<AppState>,
    Path(model_id): Path<i64>,
) -> Result<Json<CycleReport>, ApiError> {
    let engine = state.service.ensure_engine(model_id).await?;
    let report = engine.run_cycle().await?;
    Ok(Json(report))
}

pub async fn get_portfolio(
    State(state): State<AppState>,
    Path(model_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let prices = state.prices.current_prices(&state.config.coins).await?;

    let valuer = PortfolioValuer::new(state.db.clone());
    let portfolio = valuer.valuate(model_id, &prices).await?;
    let history = state.db.list_snapshots(model_id, 100).await?;

    Ok(Json(json!({
        "portfolio": portfolio,
        "account_value_history": history,
    })))
}

pub async fn get_trades(
    State(state): State<AppState>,
    Path(model_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let trades = state
        .db
        .list_trades(model_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(json!(trades)))
}

pub async fn get_conversations(
    State(state): State<AppState>,
    Path(model_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let conversations = state
        .db
        .list_conversations(model_id, query.limit.unwrap_or(20))
        .await?;
    Ok(Json(json!(conversations)))
}

// ==================== Market ====================

pub async fn get_prices(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let prices = state.prices.current_prices(&state.config.coins).await?;
    Ok(Json(json!(prices)))
}

pub async fn get_leaderboard(
    State(state): State<AppState>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let models = state.db.list_models().await?;
    let prices = state.prices.current_prices(&state.config.coins).await?;
    let valuer = PortfolioValuer::new(state.db.clone());

    let mut leaderboard = Vec::with_capacity(models.len());
    for model in models {
        let snapshot = valuer.valuate(model.id, &prices).await?;
        let capital = model.capital();

        let returns = if capital.is_zero() {
            Decimal::ZERO
        } else {
            (snapshot.total_value - capital) / capital * Decimal::from(100)
        };

        leaderboard.push(LeaderboardEntry {
            model_id: model.id,
            model_name: model.name,
            account_value: snapshot.total_value,
            returns,
            initial_capital: model.initial_capital,
        });
    }

    leaderboard.sort_by(|a, b| b.returns.cmp(&a.returns));
    Ok(Json(leaderboard))
}
