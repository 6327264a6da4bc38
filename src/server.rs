//! HTTP server.
//!
//! Exposes ingestion, leak queries and customer management as a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Ingest a raw `email,password` CSV body |
//! | `GET`  | `/query?email=...` | Leaks recorded for one email |
//! | `GET`  | `/customers` | List customers |
//! | `POST` | `/customers` | Create a customer |
//! | `GET`  | `/customers/{id}` | Fetch one customer |
//! | `PUT`  | `/customers/{id}` | Rename a customer and replace its domains |
//! | `DELETE` | `/customers/{id}` | Delete a customer |
//! | `GET`  | `/customers/{id}/query` | Leaks in the customer's domains (links new ones) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "customer with ID ... not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{Config, IngestConfig};
use crate::credential::{scheme_from_config, CredentialScheme};
use crate::customers::{self, CustomerInput};
use crate::db;
use crate::error::{IngestError, QueryError};
use crate::ingest::{IngestReport, Ingestor};
use crate::migrate;
use crate::models::{CustomerRecord, LeakSummary};
use crate::query;
use crate::store::{SqliteStore, Store};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    ingestor: Arc<Ingestor>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        scheme: Arc<dyn CredentialScheme>,
        ingest: IngestConfig,
    ) -> Self {
        let ingestor = Ingestor::new(store.clone(), scheme, ingest);
        Self {
            store,
            ingestor: Arc::new(ingestor),
        }
    }
}

/// Build the router. Upload bodies above `max_upload_bytes` are rejected.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/query", get(handle_query))
        .route(
            "/customers",
            get(handle_list_customers).post(handle_create_customer),
        )
        .route(
            "/customers/{id}",
            get(handle_get_customer)
                .put(handle_update_customer)
                .delete(handle_delete_customer),
        )
        .route("/customers/{id}/query", get(handle_customer_query))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;

    let scheme = scheme_from_config(&config.credentials)?;
    let state = AppState::new(
        Arc::new(SqliteStore::new(pool)),
        scheme,
        config.ingest.clone(),
    );
    let app = router(state, config.server.max_upload_bytes);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("leakmon listening on http://{}", bind_addr);
    info!(bind = %bind_addr, "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        let message = err.to_string();
        match err {
            QueryError::InvalidInput(_) => bad_request(message),
            QueryError::NotFound { .. } => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found".to_string(),
                message,
            },
            QueryError::Conflict(_) => AppError {
                status: StatusCode::CONFLICT,
                code: "conflict".to_string(),
                message,
            },
            QueryError::Store(e) => {
                error!(error = %e, "store error");
                internal(message)
            }
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        error!(error = %err, "ingestion failed");
        internal(err.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid customer id: {}", raw)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ingest ============

/// Runs ingestion on its own task so a dropped connection cannot abort
/// chunks halfway through.
async fn handle_ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestReport>, AppError> {
    if body.is_empty() {
        return Err(bad_request("request body must not be empty"));
    }

    let ingestor = state.ingestor.clone();
    let report = tokio::spawn(async move { ingestor.ingest(&body[..]).await })
        .await
        .map_err(|e| internal(format!("ingestion task failed: {}", e)))??;

    Ok(Json(report))
}

// ============ GET /query ============

#[derive(Deserialize)]
struct EmailQuery {
    email: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    Query(params): Query<EmailQuery>,
) -> Result<Json<Vec<LeakSummary>>, AppError> {
    let email = params.email.unwrap_or_default();
    let leaks = query::search_by_email(state.store.as_ref(), &email).await?;
    Ok(Json(leaks))
}

// ============ /customers ============

async fn handle_list_customers(
    State(state): State<AppState>,
) -> Result<Json<Vec<CustomerRecord>>, AppError> {
    Ok(Json(customers::list_customers(state.store.as_ref()).await?))
}

async fn handle_create_customer(
    State(state): State<AppState>,
    payload: Result<Json<CustomerInput>, JsonRejection>,
) -> Result<(StatusCode, Json<CustomerRecord>), AppError> {
    let Json(input) = payload?;
    let customer = customers::create_customer(state.store.as_ref(), &input).await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

async fn handle_get_customer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CustomerRecord>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(customers::get_customer(state.store.as_ref(), id).await?))
}

async fn handle_update_customer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CustomerInput>, JsonRejection>,
) -> Result<Json<CustomerRecord>, AppError> {
    let id = parse_id(&id)?;
    let Json(input) = payload?;
    Ok(Json(
        customers::update_customer(state.store.as_ref(), id, &input).await?,
    ))
}

async fn handle_delete_customer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_id(&id)?;
    customers::delete_customer(state.store.as_ref(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_customer_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LeakSummary>>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(query::search_by_customer(state.store.as_ref(), id).await?))
}
