//! REST routes for the staking engine

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use rust_decimal::Decimal;
use serde::Deserialize;
use stakeflow_common::{StakeflowError, WalletError};
use stakeflow_engine::StakingEngine;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;
use uuid::Uuid;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StakingEngine>,
    pub registry: Registry,
}

impl AppState {
    /// Wrap an engine and register its metrics
    pub fn new(engine: Arc<StakingEngine>) -> anyhow::Result<Self> {
        let registry = Registry::new();
        engine.metrics().register(&registry)?;
        Ok(Self { engine, registry })
    }
}

/// Engine error rendered as a JSON response
#[derive(Debug)]
pub struct ApiError(pub StakeflowError);

impl From<StakeflowError> for ApiError {
    fn from(err: StakeflowError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            StakeflowError::Validation(_) => StatusCode::BAD_REQUEST,
            StakeflowError::NotFound(_) => StatusCode::NOT_FOUND,
            StakeflowError::Wallet(WalletError::InsufficientBalance { .. }) => StatusCode::CONFLICT,
            StakeflowError::Wallet(WalletError::VersionConflict { .. }) => StatusCode::CONFLICT,
            StakeflowError::Wallet(WalletError::InvalidAmount) => StatusCode::BAD_REQUEST,
            StakeflowError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, kind = self.0.kind(), "Request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub user_id: String,
    pub referred_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub user_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct OpenStakeRequest {
    pub owner_id: String,
    pub principal: Decimal,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    Router::new()
        // Health & metadata
        .route("/health", get(health_check))
        .route("/api/v1/version", get(version))
        .route("/metrics", get(metrics))
        // Wallets
        .route("/api/v1/users", post(register_user))
        .route("/api/v1/users/:user_id", get(get_user))
        .route("/api/v1/deposits", post(deposit))
        .route("/api/v1/withdrawals", post(withdraw))
        // Stakes
        .route("/api/v1/stakes", post(open_stake))
        .route("/api/v1/stakes/:stake_id", get(get_stake))
        .route("/api/v1/sweeps", post(run_sweep))
        // Referrals
        .route("/api/v1/investments", post(record_investment))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "stakeflow-server",
        "version": stakeflow_common::VERSION,
        "description": "Staking accrual and referral commission engine",
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

async fn register_user(
    State(state): State<AppState>,
    Json(req): Json<RegisterUserRequest>,
) -> ApiResult<impl IntoResponse> {
    let account = state
        .engine
        .register_user(&req.user_id, req.referred_by.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_user(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.user(&user_id).await?))
}

async fn deposit(State(state): State<AppState>, Json(req): Json<AmountRequest>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.deposit(&req.user_id, req.amount).await?))
}

async fn withdraw(State(state): State<AppState>, Json(req): Json<AmountRequest>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.withdraw(&req.user_id, req.amount).await?))
}

async fn open_stake(
    State(state): State<AppState>,
    Json(req): Json<OpenStakeRequest>,
) -> ApiResult<impl IntoResponse> {
    let opened = state.engine.open_stake(&req.owner_id, req.principal).await?;
    Ok((StatusCode::CREATED, Json(opened)))
}

async fn get_stake(State(state): State<AppState>, Path(stake_id): Path<String>) -> Response {
    let stake_id = match Uuid::parse_str(&stake_id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid stake_id", "kind": "validation"})),
            )
                .into_response()
        }
    };

    match state.engine.stake_view(&stake_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn run_sweep(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.run_sweep().await?))
}

async fn record_investment(
    State(state): State<AppState>,
    Json(req): Json<AmountRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.record_investment(&req.user_id, req.amount).await?))
}
