// rest/mod.rs — Public HTTP surface.
//
// Axum server exposing the update protocol and the publish API.
//
// Endpoints:
//   GET  /health
//   GET  /api/update/manifest/{branch}/{runtimeVersion}
//   GET  /api/update/assets            (query form)
//   GET  /api/update/assets/{*path}    (positional form)
//   POST /requestUploadUrl/{branch}
//   POST /markUploadedUpdate/{branch}
//   POST /uploadLocalFile
//   GET  /api/dashboard/...            (read-only registry views)

pub mod routes;

use anyhow::Result;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::auth::AuthUser;
use crate::AppContext;

pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", ctx.config.port).parse()?;
    let router = build_router(ctx);

    info!("update server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Liveness (no auth)
        .route("/health", get(routes::health::health))
        // Update protocol
        .route(
            "/api/update/manifest/{branch}/{runtime_version}",
            get(routes::manifest::manifest),
        )
        .route("/api/update/assets", get(routes::assets::asset_by_query))
        .route(
            "/api/update/assets/{*path}",
            get(routes::assets::asset_by_path),
        )
        // Publishing
        .route(
            "/requestUploadUrl/{branch}",
            post(routes::publish::request_upload_url),
        )
        .route(
            "/markUploadedUpdate/{branch}",
            post(routes::publish::mark_uploaded_update),
        )
        .route("/uploadLocalFile", post(routes::publish::upload_local_file))
        // Dashboard reads + state toggling
        .route("/api/dashboard/branches", get(routes::dashboard::branches))
        .route(
            "/api/dashboard/branches/{branch}/runtime-versions",
            get(routes::dashboard::runtime_versions),
        )
        .route(
            "/api/dashboard/branches/{branch}/runtime-versions/{runtime_version}/updates",
            get(routes::dashboard::updates),
        )
        .route(
            "/api/dashboard/branches/{branch}/runtime-versions/{runtime_version}/updates/{update_id}/state",
            put(routes::dashboard::set_update_state),
        )
        .route(
            "/api/dashboard/branches/{branch}/runtime-versions/{runtime_version}/updates/{update_id}/downloads",
            get(routes::dashboard::downloads),
        )
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// The uniform 4xx/5xx body shape.
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

/// Authenticate a publisher or dashboard request.
///
/// Requests arriving via localhost skip the verifier (dev mode); everything
/// else needs a bearer token the identity verifier accepts.
pub async fn require_publisher(
    ctx: &AppContext,
    headers: &HeaderMap,
) -> Result<AuthUser, ApiError> {
    if let Some(host) = headers.get(axum::http::header::HOST).and_then(|h| h.to_str().ok()) {
        if crate::auth::is_localhost_host(host) {
            return Ok(AuthUser {
                uid: "dev".to_string(),
                claims: json!({}),
            });
        }
    }

    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

    ctx.verifier
        .verify_bearer_token(token)
        .await
        .map_err(|_| api_error(StatusCode::UNAUTHORIZED, "invalid bearer token"))
}
