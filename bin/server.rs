// BNPL Contract Reconstruction - Web Server
// Trigger surface and contract reads as JSON over Axum

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bnpl_reconstruct::{
    get_events_for_entity, setup_database, store, BnplEngine, Contract, EngineConfig,
    EngineError, TtlCache, UserEdit,
};

const CONTRACT_CACHE_TTL: Duration = Duration::from_secs(30);
const CONTRACT_CACHE_ENTRIES: usize = 256;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    engine: Arc<BnplEngine>,
    contracts: Arc<Mutex<TtlCache<String, Vec<Contract>>>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

/// Domain errors map to client statuses; everything else is a 500
fn failure(err: anyhow::Error) -> Response {
    let status = match err.downcast_ref::<EngineError>() {
        Some(EngineError::ContractNotFound(_))
        | Some(EngineError::InstallmentNotFound(_))
        | Some(EngineError::TransactionNotFound(_))
        | Some(EngineError::LinkNotFound(_)) => StatusCode::NOT_FOUND,
        Some(EngineError::ContractClosed(_)) | Some(EngineError::FundsExhausted { .. }) => {
            StatusCode::CONFLICT
        }
        Some(EngineError::NotAnOutflow(_)) | Some(EngineError::InvalidValue { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        None => {
            error!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    error_response(status, err.to_string())
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, Response> {
        self.db.lock().map_err(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database lock poisoned".to_string(),
            )
        })
    }

    fn invalidate_user(&self, user_id: &str) {
        if let Ok(mut cache) = self.contracts.lock() {
            cache.invalidate(&user_id.to_string());
        }
    }

    /// Invalidate the cached listing of whoever owns a contract
    fn invalidate_owner(&self, conn: &Connection, contract_id: &str) {
        if let Ok(Some(contract)) = store::get_contract(conn, contract_id) {
            self.invalidate_user(&contract.user_id);
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize, Default)]
struct RunRequest {
    #[serde(default)]
    account_id: Option<String>,

    /// Evaluate statuses as of this date (default: today, UTC)
    #[serde(default)]
    today: Option<NaiveDate>,
}

#[derive(Deserialize)]
struct LinkRequest {
    installment_id: String,
    txn_id: String,
    #[serde(default)]
    amount_cents: Option<i64>,
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// POST /api/users/:user/reconstruct
async fn reconstruct(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    body: Option<Json<RunRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let today = req.today.unwrap_or_else(today);

    let mut conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let result = match req.account_id.as_deref() {
        Some(account) => state.engine.reconstruct(&mut conn, &user_id, account, today),
        None => state.engine.reconstruct_user(&mut conn, &user_id, today),
    };
    state.invalidate_user(&user_id);

    match result {
        Ok(report) => ApiResponse::ok(report),
        Err(e) => failure(e),
    }
}

/// POST /api/users/:user/reconcile
async fn reconcile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    body: Option<Json<RunRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let today = req.today.unwrap_or_else(today);

    let mut conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let result = state.engine.reconcile(&mut conn, &user_id, today);
    state.invalidate_user(&user_id);

    match result {
        Ok(outcomes) => ApiResponse::ok(outcomes),
        Err(e) => failure(e),
    }
}

/// GET /api/users/:user/contracts - Cached contract listing
async fn list_contracts(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    if let Ok(mut cache) = state.contracts.lock() {
        if let Some(hit) = cache.get(&user_id) {
            return ApiResponse::ok(hit);
        }
    }

    let conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match store::get_contracts_for_user(&conn, &user_id) {
        Ok(contracts) => {
            if let Ok(mut cache) = state.contracts.lock() {
                cache.insert(user_id, contracts.clone());
            }
            ApiResponse::ok(contracts)
        }
        Err(e) => failure(e),
    }
}

/// GET /api/contracts/:id - Contract with installments and links
async fn contract_detail(State(state): State<AppState>, Path(contract_id): Path<String>) -> Response {
    let conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match state.engine.contract_detail(&conn, &contract_id) {
        Ok(detail) => ApiResponse::ok(detail),
        Err(e) => failure(e),
    }
}

/// GET /api/contracts/:id/events - Audit trail
async fn contract_events(State(state): State<AppState>, Path(contract_id): Path<String>) -> Response {
    let conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match get_events_for_entity(&conn, "contract", &contract_id) {
        Ok(events) => ApiResponse::ok(events),
        Err(e) => failure(e),
    }
}

/// POST /api/contracts/:id/close
async fn close_plan(State(state): State<AppState>, Path(contract_id): Path<String>) -> Response {
    let mut conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let result = state.engine.close_plan(&mut conn, &contract_id, today());
    state.invalidate_owner(&conn, &contract_id);

    match result {
        Ok(contract) => ApiResponse::ok(contract),
        Err(e) => failure(e),
    }
}

/// POST /api/contracts/:id/edit
async fn edit_contract(
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
    Json(edit): Json<UserEdit>,
) -> Response {
    let mut conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let result = state.engine.user_edit(&mut conn, &contract_id, &edit, today());
    state.invalidate_owner(&conn, &contract_id);

    match result {
        Ok(contract) => ApiResponse::ok(contract),
        Err(e) => failure(e),
    }
}

/// POST /api/contracts/:id/links - Manual payment link
async fn link_payment(
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
    Json(req): Json<LinkRequest>,
) -> Response {
    let mut conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let result = state.engine.link_payment(
        &mut conn,
        &contract_id,
        &req.installment_id,
        &req.txn_id,
        req.amount_cents,
        today(),
    );
    state.invalidate_owner(&conn, &contract_id);

    match result {
        Ok(link) => ApiResponse::ok(link),
        Err(e) => failure(e),
    }
}

/// DELETE /api/links/:id
async fn unlink_payment(State(state): State<AppState>, Path(link_id): Path<String>) -> Response {
    let mut conn = match state.conn() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match state.engine.unlink_payment(&mut conn, &link_id, today()) {
        Ok(link) => {
            state.invalidate_owner(&conn, &link.contract_id);
            ApiResponse::ok(link)
        }
        Err(e) => failure(e),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let db_path = std::env::var("BNPL_DB").unwrap_or_else(|_| "bnpl.db".to_string());
    let conn = Connection::open(&db_path)?;
    setup_database(&conn)?;
    info!(db = %db_path, "Database opened");

    let config = EngineConfig::from_env()?;

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        engine: Arc::new(BnplEngine::new(config)),
        contracts: Arc::new(Mutex::new(TtlCache::new(
            CONTRACT_CACHE_TTL,
            CONTRACT_CACHE_ENTRIES,
        ))),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/users/:user/reconstruct", post(reconstruct))
        .route("/users/:user/reconcile", post(reconcile))
        .route("/users/:user/contracts", get(list_contracts))
        .route("/contracts/:id", get(contract_detail))
        .route("/contracts/:id/events", get(contract_events))
        .route("/contracts/:id/close", post(close_plan))
        .route("/contracts/:id/edit", post(edit_contract))
        .route("/contracts/:id/links", post(link_payment))
        .route("/links/:id", delete(unlink_payment))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = std::env::var("BNPL_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Server running");

    axum::serve(listener, app).await?;

    Ok(())
}
