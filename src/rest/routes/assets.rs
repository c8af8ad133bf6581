// rest/routes/assets.rs — asset byte streaming and CDN redirects.
//
// Manifest asset URLs use the query form; older clients and direct tooling
// use the positional form. Selection tolerates inactive updates here (and
// only here) so devices pinned to an older manifest can still fetch its
// assets.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::metadata::Platform;
use crate::rest::{api_error, ApiError};
use crate::store::{read_path_candidates, UpdateLocator};
use crate::AppContext;

#[derive(Debug, Deserialize)]
pub struct AssetQuery {
    pub asset: Option<String>,
    #[serde(rename = "runtimeVersion")]
    pub runtime_version: Option<String>,
    pub platform: Option<String>,
    pub branch: Option<String>,
}

pub async fn asset_by_query(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<AssetQuery>,
) -> Result<Response, ApiError> {
    let asset = query
        .asset
        .as_deref()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing asset parameter"))?;
    let runtime_version = query
        .runtime_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing runtimeVersion parameter"))?;
    if let Some(platform) = query.platform.as_deref() {
        if Platform::parse(platform).is_none() {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("unsupported platform '{platform}'"),
            ));
        }
    }

    // Manifest URLs carry no branch, so an unscoped request searches every
    // branch in listing order.
    let branches = match &query.branch {
        Some(branch) => vec![branch.clone()],
        None => ctx
            .registry
            .branches()
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?,
    };

    for branch in &branches {
        let candidates = ctx
            .registry
            .asset_candidates(branch, runtime_version)
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
        for candidate in candidates {
            let locator = candidate.locator();
            if let Some(response) = try_serve(&ctx, &locator, asset).await? {
                return Ok(response);
            }
        }
    }

    Err(api_error(StatusCode::NOT_FOUND, "asset not found"))
}

/// Positional form: `/api/update/assets/{branch}/{rv}/{updateId}/{...path}`.
pub async fn asset_by_path(
    State(ctx): State<Arc<AppContext>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let mut segments = path.splitn(4, '/');
    let (Some(branch), Some(runtime_version), Some(update_id), Some(file)) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "expected branch/runtimeVersion/updateId/path",
        ));
    };

    let locator = UpdateLocator::new(branch, runtime_version, update_id);
    match try_serve(&ctx, &locator, file).await? {
        Some(response) => Ok(response),
        None => Err(api_error(StatusCode::NOT_FOUND, "asset not found")),
    }
}

/// Serve one asset from one update folder, walking the read-side path
/// fallbacks. `None` means this folder has no spelling of the asset.
async fn try_serve(
    ctx: &AppContext,
    locator: &UpdateLocator,
    asset: &str,
) -> Result<Option<Response>, ApiError> {
    for candidate in read_path_candidates(asset) {
        let exists = ctx
            .store
            .file_exists(locator, &candidate)
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
        if !exists {
            continue;
        }

        // A store with URL signing redirects to the CDN; everything else
        // streams through the service.
        match ctx.store.signed_download_url(locator, &candidate).await {
            Ok(Some(url)) => {
                let response = Response::builder()
                    .status(StatusCode::FOUND)
                    .header(header::LOCATION, url)
                    .body(axum::body::Body::empty())
                    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
                return Ok(Some(with_protocol_headers(response)));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "download URL signing failed — streaming instead"),
        }

        let stream = ctx
            .store
            .get_file(locator, &candidate)
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

        let content_type = mime_guess::from_path(&candidate)
            .first_or_octet_stream()
            .to_string();
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type);
        if let Some(length) = stream.content_length {
            response = response.header(header::CONTENT_LENGTH, length);
        }
        let response = response
            .body(axum::body::Body::from_stream(ReaderStream::new(
                stream.reader,
            )))
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
        return Ok(Some(with_protocol_headers(response)));
    }
    Ok(None)
}

fn with_protocol_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert("expo-protocol-version", "1".parse().unwrap());
    headers.insert("expo-sfv-version", "0".parse().unwrap());
    headers.insert(
        header::CACHE_CONTROL,
        "private, max-age=0".parse().unwrap(),
    );
    response
}
