// rest/routes/manifest.rs — the update-check dispatcher.
//
// Inspects the client's protocol headers, asks the registry for the best
// update, and answers with exactly one of: a signed manifest, a rollback
// directive, a no-update directive, or a protocol-appropriate error.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::manifest::{self, multipart};
use crate::metadata::{self, Platform};
use crate::registry::{extract_build_number, UpdateEntry};
use crate::rest::{api_error, ApiError};
use crate::AppContext;

static EXTRA_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z0-9_-]+)="([^"]*)""#).unwrap());

/// Read a protocol header, accepting both the `expo-` prefixed and the bare
/// spelling.
fn protocol_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(format!("expo-{name}"))
        .or_else(|| headers.get(name))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Parse `Expo-Extra-Params`: a comma-separated `name="value"` list.
fn extra_params(headers: &HeaderMap) -> HashMap<String, String> {
    let Some(raw) = protocol_header(headers, "extra-params") else {
        return HashMap::new();
    };
    EXTRA_PARAM
        .captures_iter(&raw)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

struct ManifestRequest {
    protocol_version: u8,
    platform: Platform,
    current_update_id: Option<String>,
    embedded_update_id: Option<String>,
    expect_signature: bool,
    client_build: Option<String>,
}

impl ManifestRequest {
    fn parse(headers: &HeaderMap) -> Result<Self, ApiError> {
        let protocol_version = match protocol_header(headers, "protocol-version").as_deref() {
            None | Some("0") => 0,
            Some("1") => 1,
            Some(other) => {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    format!("unsupported protocol version '{other}'"),
                ))
            }
        };

        let platform = protocol_header(headers, "platform")
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing platform header"))
            .and_then(|p| {
                Platform::parse(&p).ok_or_else(|| {
                    api_error(StatusCode::BAD_REQUEST, format!("unsupported platform '{p}'"))
                })
            })?;

        let params = extra_params(headers);
        let client_build = params
            .get("expo-build-number")
            .or_else(|| params.get("build-number"))
            .cloned();

        Ok(Self {
            protocol_version,
            platform,
            current_update_id: protocol_header(headers, "current-update-id"),
            embedded_update_id: protocol_header(headers, "embedded-update-id"),
            expect_signature: protocol_header(headers, "expect-signature").is_some(),
            client_build,
        })
    }
}

/// Build comparison between the client's reported build and the selected
/// update's. Unparseable update side means "an update is needed";
/// unparseable client side falls back to lexicographic comparison.
fn client_is_current(client_raw: Option<&str>, update: &UpdateEntry) -> bool {
    let Some(client_raw) = client_raw else {
        return false;
    };
    match (extract_build_number(client_raw), update.build_value()) {
        (Some(client), Some(update_build)) => client >= update_build,
        (_, None) => false,
        (None, Some(_)) => {
            let update_raw = update.build_number.as_deref().unwrap_or(&update.update_id);
            client_raw >= update_raw
        }
    }
}

pub async fn manifest(
    State(ctx): State<Arc<AppContext>>,
    Path((branch, runtime_version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = ManifestRequest::parse(&headers)?;

    let candidates = ctx
        .registry
        .select_candidates(&branch, &runtime_version, request.client_build.as_deref())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    let Some(selected) = candidates.first() else {
        return Err(api_error(StatusCode::NOT_FOUND, "no update found"));
    };

    // Rollback folders answer with a directive, never a manifest.
    if selected.is_rollback() {
        if request.protocol_version == 0 {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "rollback is not supported on protocol version 0",
            ));
        }
        if let (Some(current), Some(embedded)) = (
            request.current_update_id.as_deref(),
            request.embedded_update_id.as_deref(),
        ) {
            if current.eq_ignore_ascii_case(embedded) {
                return Ok(directive_response(&ctx, &request, manifest::no_update_available_directive())
                    .await);
            }
        }
        let directive = manifest::load_rollback_directive(ctx.store.as_ref(), selected)
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
        return Ok(directive_response(&ctx, &request, directive).await);
    }

    // First candidate whose metadata loads is the effective selection;
    // broken folders are skipped, not fatal.
    let mut chosen: Option<(&UpdateEntry, metadata::LoadedMetadata)> = None;
    for candidate in candidates.iter().filter(|c| !c.is_rollback()) {
        match metadata::load(
            ctx.store.as_ref(),
            &ctx.cache,
            &candidate.locator(),
            candidate.created_at,
        )
        .await
        {
            Ok(loaded) => {
                chosen = Some((candidate, loaded));
                break;
            }
            Err(e) => {
                warn!(update = %candidate.update_id, error = %e, "skipping unreadable update");
            }
        }
    }
    let Some((selected, loaded)) = chosen else {
        return Err(api_error(StatusCode::NOT_FOUND, "no update found"));
    };

    if client_is_current(request.client_build.as_deref(), selected) {
        return Ok(no_update_response(&ctx, &request).await);
    }

    // A protocol-1 client already running this exact content needs nothing.
    if request.protocol_version == 1 {
        if let (Some(current), Ok(manifest_id)) =
            (request.current_update_id.as_deref(), loaded.manifest_id())
        {
            if current.eq_ignore_ascii_case(&manifest_id.to_string()) {
                return Ok(no_update_response(&ctx, &request).await);
            }
        }
    }

    let update_manifest = manifest::assemble(
        &ctx.store,
        &ctx.cache,
        &ctx.config,
        selected,
        &loaded,
        request.platform,
    )
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    let client_id = request
        .current_update_id
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());
    ctx.registry
        .record_download_detached(selected.locator(), client_id);

    let body = serde_json::to_value(&update_manifest)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(part_response(&ctx, &request, multipart::PART_MANIFEST, body).await)
}

/// Protocol 1 gets the directive; protocol 0 has no directive shape, so the
/// response is simply omitted.
async fn no_update_response(ctx: &AppContext, request: &ManifestRequest) -> Response {
    if request.protocol_version == 0 {
        return StatusCode::NO_CONTENT.into_response();
    }
    directive_response(ctx, request, manifest::no_update_available_directive()).await
}

async fn directive_response(
    ctx: &AppContext,
    request: &ManifestRequest,
    directive: serde_json::Value,
) -> Response {
    part_response(ctx, request, multipart::PART_DIRECTIVE, directive).await
}

async fn part_response(
    ctx: &AppContext,
    request: &ManifestRequest,
    part_name: &str,
    body: serde_json::Value,
) -> Response {
    let json = body.to_string();
    let signature = if request.expect_signature {
        ctx.signer
            .signature_header(&ctx.config, &ctx.store, &json)
            .await
    } else {
        None
    };

    let boundary = multipart::new_boundary();
    let body = multipart::body(&boundary, part_name, &json, signature.as_deref());

    (
        StatusCode::OK,
        [
            ("content-type", multipart::content_type(&boundary)),
            (
                "expo-protocol-version",
                request.protocol_version.to_string(),
            ),
            ("expo-sfv-version", "0".to_string()),
            ("cache-control", "private, max-age=0".to_string()),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn entry(update_id: &str, build_number: Option<&str>) -> UpdateEntry {
        UpdateEntry {
            branch: "main".to_string(),
            runtime_version: "1.0.0".to_string(),
            update_id: update_id.to_string(),
            created_at: DateTime::<Utc>::from_timestamp_millis(0).unwrap(),
            build_number: build_number.map(str::to_string),
            commit_hash: None,
            platform: None,
            active: true,
            files: vec!["metadata.json".to_string()],
        }
    }

    #[test]
    fn numeric_build_comparison() {
        let update = entry("build-5-abc", Some("build-5-abc"));
        assert!(client_is_current(Some("build-5"), &update));
        assert!(client_is_current(Some("build-6"), &update));
        assert!(!client_is_current(Some("build-3"), &update));
        assert!(!client_is_current(None, &update));
    }

    #[test]
    fn unparseable_update_side_means_update_needed() {
        let update = entry("9f3c2a1e-0000-0000-0000-000000000000", None);
        assert!(!client_is_current(Some("build-99"), &update));
    }

    #[test]
    fn unparseable_client_side_falls_back_to_lexicographic() {
        let update = entry("build-5-abc", Some("build-5-abc"));
        // "zzz" > "build-5-abc" lexicographically — client is current.
        assert!(client_is_current(Some("zzz"), &update));
        assert!(!client_is_current(Some("aaa"), &update));
    }

    #[test]
    fn extra_params_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "expo-extra-params",
            r#"expo-build-number="build-3", channel="main""#.parse().unwrap(),
        );
        let params = extra_params(&headers);
        assert_eq!(params.get("expo-build-number").map(String::as_str), Some("build-3"));
        assert_eq!(params.get("channel").map(String::as_str), Some("main"));
    }

    #[test]
    fn request_parse_requires_platform() {
        let headers = HeaderMap::new();
        assert!(ManifestRequest::parse(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("expo-platform", "ios".parse().unwrap());
        headers.insert("expo-protocol-version", "1".parse().unwrap());
        let request = ManifestRequest::parse(&headers).unwrap();
        assert_eq!(request.protocol_version, 1);
        assert_eq!(request.platform, Platform::Ios);

        let mut headers = HeaderMap::new();
        headers.insert("expo-platform", "windows".parse().unwrap());
        assert!(ManifestRequest::parse(&headers).is_err());
    }
}
