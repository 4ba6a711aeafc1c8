use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use thiserror::Error;

use ledgerd_core::{AccountId, CreateAccountCommand, LedgerError, TransactionInput, TransactionRequest};

use crate::service::LedgerService;

#[derive(Clone)]
pub struct AppState {
    pub service: LedgerService,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Ledger(LedgerError::AccountNotFound(id)) => {
                json_error(StatusCode::NOT_FOUND, format!("account not found: {}", id))
            }
            ApiError::Ledger(e) if e.is_client_error() => json_error(StatusCode::BAD_REQUEST, e.to_string()),
            other => {
                // Storage details stay in the logs.
                tracing::error!(error = %other, "Request failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
            }
        }
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/account", post(create_account))
        .route("/api/v1/account/:id", get(get_account))
        .route("/api/v1/transaction", post(create_transaction))
        .route("/api/v1/transaction/all", get(list_transactions))
        .route("/api/v1/transaction/account/:id", get(list_account_transactions))
        .with_state(state)
}

/// Runs a storage call on the blocking pool; every backend is synchronous.
async fn blocking<T, F>(state: &AppState, work: F) -> Result<T, ApiError>
where
    F: FnOnce(&LedgerService) -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    let service = state.service.clone();
    Ok(tokio::task::spawn_blocking(move || work(&service)).await??)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => json_error(StatusCode::NOT_FOUND, "metrics are disabled"),
    }
}

async fn create_account(
    State(state): State<AppState>,
    Json(command): Json<CreateAccountCommand>,
) -> Result<impl IntoResponse, ApiError> {
    let account = blocking(&state, move |service| service.create_account(command)).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(State(state): State<AppState>, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    let details = blocking(&state, move |service| service.get_account(AccountId(id))).await?;
    Ok(Json(details))
}

async fn create_transaction(
    State(state): State<AppState>,
    Json(input): Json<TransactionInput>,
) -> Result<impl IntoResponse, ApiError> {
    let request = TransactionRequest::try_from(input)?;
    let transaction = blocking(&state, move |service| service.execute(request)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "transaction": transaction }))))
}

async fn list_transactions(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let transactions = blocking(&state, |service| service.list_transactions()).await?;
    Ok(Json(json!({ "transactions": transactions })))
}

async fn list_account_transactions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let transactions = blocking(&state, move |service| service.list_transactions_for_account(AccountId(id))).await?;
    Ok(Json(json!({ "transactions": transactions })))
}
