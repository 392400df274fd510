/**
 * API REST PPPWATCH - Lecture des snapshots et pilotage des routeurs supervisés
 *
 * ROUTES :
 * - GET    /health                          liveness, sans clé
 * - GET    /system/health                   état du kernel
 * - GET    /routers                         routeurs supervisés (état, séquence, intervalle)
 * - GET    /routers/{id}/snapshot           lignes + stats du dernier cycle publié
 * - GET    /routers/{id}/subscribers/{key}  une ligne (clé brute ou normalisée)
 * - POST   /routers/{id}/refresh            cycle manuel
 * - PUT    /routers/{id}/interval           {"seconds": n}, 0 = timer coupé
 * - DELETE /routers/{id}                    arrêt du contexte du routeur
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sauf /health
 * - Sans PPPWATCH_API_KEY configurée, tout accès protégé est refusé
 */

use crate::error::MonitorError;
use crate::health::{HealthTracker, KernelHealth};
use crate::normalize::normalize;
use crate::registry::{RouterInfo, SharedRegistry};
use crate::views::{RowView, SnapshotView};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub health_tracker: HealthTracker,
    /// Clé attendue dans x-api-key ; None = accès protégé refusé
    pub api_key: Option<String>,
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("PPPWATCH_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request with missing or wrong API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn status_for(e: &MonitorError) -> StatusCode {
    match e {
        MonitorError::UnknownRouter(_) => StatusCode::NOT_FOUND,
        MonitorError::Stopped(_) => StatusCode::CONFLICT,
        MonitorError::Upstream(_) => StatusCode::BAD_GATEWAY,
    }
}

fn api_error(e: MonitorError) -> (StatusCode, Json<serde_json::Value>) {
    (status_for(&e), Json(serde_json::json!({ "error": e.to_string() })))
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<serde_json::Value>)>;

#[derive(Debug, Deserialize)]
struct IntervalBody {
    seconds: u64,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/routers", get(list_routers))
        .route("/routers/{id}", axum::routing::delete(detach_router))
        .route("/routers/{id}/snapshot", get(get_snapshot))
        .route("/routers/{id}/subscribers/{key}", get(get_subscriber))
        .route("/routers/{id}/refresh", post(refresh_router))
        .route("/routers/{id}/interval", put(set_interval))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.registry))
}

// GET /routers
async fn list_routers(State(app): State<AppState>) -> Json<Vec<RouterInfo>> {
    Json(app.registry.list())
}

// GET /routers/{id}/snapshot
async fn get_snapshot(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<SnapshotView> {
    let snapshot = app.registry.snapshot(&id).map_err(api_error)?;
    Ok(Json(SnapshotView::from(snapshot.as_ref())))
}

// GET /routers/{id}/subscribers/{key}
async fn get_subscriber(
    State(app): State<AppState>,
    Path((id, key)): Path<(String, String)>,
) -> ApiResult<RowView> {
    let snapshot = app.registry.snapshot(&id).map_err(api_error)?;
    let key = normalize(&key);
    match snapshot.row(key.as_str()) {
        Some(row) => Ok(Json(RowView::from(row))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown subscriber: {key}") })),
        )),
    }
}

// POST /routers/{id}/refresh
async fn refresh_router(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    app.registry.refresh_now(&id).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "status": "scheduled" })))
}

// PUT /routers/{id}/interval
async fn set_interval(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<IntervalBody>,
) -> ApiResult<serde_json::Value> {
    app.registry.set_refresh_interval(&id, body.seconds).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "status": "ok", "seconds": body.seconds })))
}

// DELETE /routers/{id}
async fn detach_router(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    app.registry.detach(&id).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "status": "detached" })))
}
