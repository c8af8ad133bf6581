// rest/routes/dashboard.rs — read-only registry views for the admin UI.
//
// All views are JSON, memoized behind the dashboard cache keys, and yield
// empty lists (never errors) for scopes that do not exist.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::{api_error, require_publisher, ApiError};
use crate::store::UpdateLocator;
use crate::AppContext;

pub async fn branches(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_publisher(&ctx, &headers).await?;
    let branches = ctx
        .registry
        .branches()
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!({ "branches": branches })))
}

pub async fn runtime_versions(
    State(ctx): State<Arc<AppContext>>,
    Path(branch): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_publisher(&ctx, &headers).await?;
    let versions = ctx
        .registry
        .runtime_versions(&branch)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!({ "runtimeVersions": versions })))
}

pub async fn updates(
    State(ctx): State<Arc<AppContext>>,
    Path((branch, runtime_version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_publisher(&ctx, &headers).await?;
    let updates = ctx
        .registry
        .annotated_updates(&branch, &runtime_version)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!({ "updates": updates })))
}

#[derive(Debug, Deserialize)]
pub struct StateBody {
    pub active: bool,
}

pub async fn set_update_state(
    State(ctx): State<Arc<AppContext>>,
    Path((branch, runtime_version, update_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<StateBody>,
) -> Result<Json<Value>, ApiError> {
    require_publisher(&ctx, &headers).await?;
    let locator = UpdateLocator::new(&branch, &runtime_version, &update_id);
    ctx.registry
        .set_update_state(&locator, body.active)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!({ "status": "ok", "active": body.active })))
}

pub async fn downloads(
    State(ctx): State<Arc<AppContext>>,
    Path((branch, runtime_version, update_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_publisher(&ctx, &headers).await?;
    let locator = UpdateLocator::new(&branch, &runtime_version, &update_id);
    let downloads = ctx
        .store
        .list_downloads(&locator)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!({ "downloads": downloads })))
}
