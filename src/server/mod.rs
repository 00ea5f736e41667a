//! Axum-based REST server.
//!
//! Thin HTTP layer over [`ServerStore`]: bearer-token authentication,
//! the `{status, error, …payload}` envelope, body limits, timeouts, CORS.
//! Record ciphertext passes through opaque; nothing here decrypts.

pub mod records;
pub mod store;
pub mod sync;

use crate::config::ServerConfig;
use crate::error::Error;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use store::ServerStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Body ceiling: binary records go up to 100 MiB, plus envelope slack.
const MAX_BODY_SIZE: usize = 128 * 1024 * 1024;

/// Per-request deadline.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// How often expired sessions are swept.
const SESSION_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ServerStore>,
    pub batch_size: u32,
    pub max_batch_size: u32,
}

/// Run the server until the listener fails or the process is stopped.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let store = Arc::new(ServerStore::open(
        &config.database_path,
        config.session_ttl_secs,
        config.storage_quota_bytes,
    )?);

    // Periodic session sweep
    let sweep_store = Arc::clone(&store);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match sweep_store.cleanup_expired_sessions() {
                Ok(0) => {}
                Ok(n) => tracing::debug!(removed = n, "swept expired sessions"),
                Err(e) => tracing::warn!("session sweep failed: {e}"),
            }
        }
    });

    let state = AppState {
        store,
        batch_size: config.batch_size,
        max_batch_size: config.max_batch_size,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.run_address).await?;
    tracing::info!(
        addr = %config.run_address,
        db = %config.database_path.display(),
        env = ?config.app_env,
        "keepr server listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/auth/register", post(handle_register))
        .route("/api/v1/auth/login", post(handle_login))
        .route("/api/v1/auth/change-password", post(handle_change_password))
        .route(
            "/api/records",
            get(records::handle_list).post(records::handle_create),
        )
        .route(
            "/api/records/{id}",
            get(records::handle_get)
                .put(records::handle_update)
                .delete(records::handle_delete),
        )
        .route("/api/records/login", post(records::handle_create_login))
        .route("/api/records/text", post(records::handle_create_text))
        .route("/api/records/card", post(records::handle_create_card))
        .route("/api/records/binary", post(records::handle_create_binary))
        .route("/api/sync/changes", post(sync::handle_changes))
        .route("/api/sync/batch", post(sync::handle_batch))
        .route("/api/sync/status", get(sync::handle_status))
        .route("/api/sync/conflicts", get(sync::handle_conflicts))
        .route(
            "/api/sync/conflicts/{id}/resolve",
            post(sync::handle_resolve),
        )
        .route("/api/sync/devices", get(sync::handle_devices))
        .route(
            "/api/sync/devices/{id}",
            axum::routing::delete(sync::handle_device_remove),
        )
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

// ── Envelope & auth helpers ─────────────────────────────────────────

/// Wrap a payload in the `{status: "Ok", …}` envelope.
pub(crate) fn ok(payload: impl Serialize) -> Response {
    let mut value = serde_json::to_value(payload).unwrap_or_else(|_| json!({}));
    if let Value::Object(ref mut map) = value {
        map.insert("status".into(), json!(crate::protocol::STATUS_OK));
    }
    (StatusCode::OK, Json(value)).into_response()
}

/// Map a taxonomy error onto an HTTP status + error envelope.
pub(crate) fn fail(err: Error) -> Response {
    let mut body = json!({
        "status": crate::protocol::STATUS_ERROR,
        "error": err.to_string(),
    });
    let status = match &err {
        Error::Unauthenticated | Error::BadCredentials | Error::TokenExpired => {
            StatusCode::UNAUTHORIZED
        }
        Error::NotFound | Error::Deleted => StatusCode::NOT_FOUND,
        Error::VersionMismatch { expected, stored } => {
            body["expected"] = json!(expected);
            body["stored"] = json!(stored);
            StatusCode::CONFLICT
        }
        Error::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::QuotaExceeded => {
            body["code"] = json!("quota_exceeded");
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("request failed: {err}");
    }
    (status, Json(body)).into_response()
}

/// Resolve the bearer token to a user id.
pub(crate) fn bearer_user(state: &AppState, headers: &HeaderMap) -> crate::error::Result<i64> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or("");
    if token.is_empty() {
        return Err(Error::Unauthenticated);
    }
    state.store.validate_token(token)
}

/// Optional device identity headers sent by sync-aware clients.
pub(crate) fn device_id_from(headers: &HeaderMap) -> String {
    headers
        .get("X-Device-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

// ── Auth handlers ───────────────────────────────────────────────────

/// GET /api/v1/health: liveness, always public.
async fn handle_health() -> Response {
    ok(json!({}))
}

/// POST /api/v1/auth/register: `{login, password} → {user_id}`.
async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<crate::protocol::RegisterRequest>,
) -> Response {
    match state.store.register(&req.login, &req.password) {
        Ok(user_id) => {
            tracing::info!(user_id, "user registered");
            ok(crate::protocol::RegisterResponse { user_id })
        }
        Err(e) => fail(e),
    }
}

/// POST /api/v1/auth/login: `{login, password} → {token}`.
async fn handle_login(
    State(state): State<AppState>,
    Json(req): Json<crate::protocol::LoginRequest>,
) -> Response {
    let user = match state.store.authenticate(&req.login, &req.password) {
        Ok(user) => user,
        Err(e) => return fail(e),
    };
    match state.store.create_session(user.id) {
        Ok((token, expires_at)) => {
            tracing::info!(user_id = user.id, "login ok");
            ok(crate::protocol::LoginResponse { token, expires_at })
        }
        Err(e) => fail(e),
    }
}

/// POST /api/v1/auth/change-password (authenticated).
async fn handle_change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<crate::protocol::ChangePasswordRequest>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    match state
        .store
        .change_password(user_id, &req.old_password, &req.new_password)
    {
        Ok(()) => ok(json!({})),
        Err(e) => fail(e),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
