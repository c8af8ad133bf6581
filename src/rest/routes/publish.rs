// rest/routes/publish.rs — the publishing surface.
//
// A publisher obtains signed upload URLs, PUTs every file, then finalizes.
// Local and cloud-bucket deployments additionally receive their PUTs here,
// through the token-gated /uploadLocalFile sink.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::metadata::Platform;
use crate::rest::{api_error, require_publisher, ApiError};
use crate::upload::{BeginUploadBody, BeginUploadResponse, PublishError};
use crate::AppContext;

fn publish_error(error: PublishError) -> ApiError {
    match &error {
        PublishError::Validation(_) => api_error(StatusCode::BAD_REQUEST, error),
        PublishError::Auth(_) => api_error(StatusCode::UNAUTHORIZED, error),
        PublishError::BadUpdate(_) => api_error(StatusCode::BAD_REQUEST, error),
        PublishError::Duplicate => api_error(StatusCode::NOT_ACCEPTABLE, error),
        PublishError::Other(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, error),
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, format!("missing {name} parameter")))
}

// ─── Begin upload ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BeginUploadQuery {
    pub platform: Option<String>,
    #[serde(rename = "runtimeVersion")]
    pub runtime_version: Option<String>,
    #[serde(rename = "buildNumber")]
    pub build_number: Option<String>,
    #[serde(rename = "commitHash")]
    pub commit_hash: Option<String>,
}

pub async fn request_upload_url(
    State(ctx): State<Arc<AppContext>>,
    Path(branch): Path<String>,
    Query(query): Query<BeginUploadQuery>,
    headers: HeaderMap,
    Json(body): Json<BeginUploadBody>,
) -> Result<Json<BeginUploadResponse>, ApiError> {
    require_publisher(&ctx, &headers).await?;

    let runtime_version = required(&query.runtime_version, "runtimeVersion")?;
    if let Some(platform) = query.platform.as_deref() {
        if Platform::parse(platform).is_none() {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("unsupported platform '{platform}'"),
            ));
        }
    }

    let response = ctx
        .coordinator
        .begin_upload(
            &branch,
            runtime_version,
            query.platform.as_deref(),
            query.build_number.as_deref(),
            query.commit_hash.as_deref(),
            &body.file_names,
        )
        .await
        .map_err(publish_error)?;
    Ok(Json(response))
}

// ─── Finalize ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FinalizeQuery {
    pub platform: Option<String>,
    #[serde(rename = "runtimeVersion")]
    pub runtime_version: Option<String>,
    #[serde(rename = "updateId")]
    pub update_id: Option<String>,
}

pub async fn mark_uploaded_update(
    State(ctx): State<Arc<AppContext>>,
    Path(branch): Path<String>,
    Query(query): Query<FinalizeQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_publisher(&ctx, &headers).await?;

    let runtime_version = required(&query.runtime_version, "runtimeVersion")?;
    let update_id = required(&query.update_id, "updateId")?;
    let platform = required(&query.platform, "platform").and_then(|p| {
        Platform::parse(p).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unsupported platform '{p}'"))
        })
    })?;

    ctx.coordinator
        .finalize_upload(&branch, runtime_version, update_id, platform)
        .await
        .map_err(publish_error)?;
    Ok(Json(json!({ "status": "ok", "updateId": update_id })))
}

// ─── Local upload sink ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UploadTokenQuery {
    pub token: Option<String>,
}

pub async fn upload_local_file(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<UploadTokenQuery>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing upload token"))?;

    let mut file_bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?
    {
        let bytes = field
            .bytes()
            .await
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
        file_bytes = Some(bytes);
        break;
    }
    let file_bytes = file_bytes
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "multipart body carries no file"))?;

    let file_path = ctx
        .coordinator
        .accept_local_upload(token, file_bytes)
        .await
        .map_err(publish_error)?;
    Ok(Json(json!({ "status": "ok", "filePath": file_path })))
}
