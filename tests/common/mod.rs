//! Shared harness for the HTTP integration tests: a local-store context on
//! a temp directory and a few request/response helpers.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use expod::auth::DenyAllVerifier;
use expod::config::{KeysStorageType, ServerConfig, StorageMode};
use expod::store::local::LocalStore;
use expod::{rest, AppContext};

pub fn test_config(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        base_url: "http://localhost:3000".to_string(),
        port: 3000,
        storage_mode: StorageMode::Local,
        local_bucket_base_path: dir.path().to_path_buf(),
        s3_bucket_name: None,
        aws_region: None,
        firebase_project_id: None,
        firebase_storage_bucket: None,
        firebase_service_account: None,
        jwt_secret: Some("integration-test-secret".to_string()),
        expo_app_id: "test-app-id".to_string(),
        expo_access_token: None,
        admin_password: None,
        private_key_path: None,
        public_key_path: None,
        keys_storage_type: KeysStorageType::Local,
    }
}

pub fn make_ctx(config: ServerConfig) -> Arc<AppContext> {
    let store = Arc::new(LocalStore::new(&config).expect("local store"));
    AppContext::new(config, store, Arc::new(DenyAllVerifier))
}

pub fn make_router(dir: &TempDir) -> Router {
    rest::build_router(make_ctx(test_config(dir)))
}

/// Write one file into the store's on-disk layout.
pub fn seed_file(dir: &TempDir, relative: &str, bytes: &[u8]) {
    let path = dir.path().join(relative);
    std::fs::create_dir_all(path.parent().unwrap_or(Path::new("."))).unwrap();
    std::fs::write(path, bytes).unwrap();
}

/// A plausible publisher-written metadata.json for an iOS-only update.
pub fn ios_metadata(bundle: &str, assets: &[(&str, &str)]) -> String {
    let assets: Vec<serde_json::Value> = assets
        .iter()
        .map(|(path, ext)| serde_json::json!({ "path": path, "ext": ext }))
        .collect();
    serde_json::json!({
        "version": 0,
        "bundler": "metro",
        "fileMetadata": {
            "ios": { "bundle": bundle, "assets": assets },
            "android": { "bundle": "", "assets": [] },
        },
        "extra": {},
    })
    .to_string()
}

pub async fn send(
    router: &Router,
    request: Request<Body>,
) -> (StatusCode, Response<Body>, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes().to_vec();
    (status, Response::from_parts(parts, Body::empty()), bytes)
}

pub async fn get(
    router: &Router,
    uri: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, Response<Body>, Vec<u8>) {
    let mut request = Request::builder().method("GET").uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    send(router, request.body(Body::empty()).unwrap()).await
}

/// Pull the JSON payload out of a single-part multipart/mixed body.
pub fn part_json(body: &[u8]) -> serde_json::Value {
    let text = std::str::from_utf8(body).expect("multipart body is not UTF-8");
    let start = text.find("\r\n\r\n").expect("no part payload") + 4;
    let end = text[start..]
        .find("\r\n--")
        .map(|i| start + i)
        .expect("unterminated part");
    serde_json::from_str(&text[start..end]).expect("part payload is not JSON")
}

/// The form-data name of the single part.
pub fn part_name(body: &[u8]) -> String {
    let text = std::str::from_utf8(body).unwrap();
    let marker = "content-disposition: form-data; name=\"";
    let start = text.find(marker).expect("no content-disposition") + marker.len();
    let end = text[start..].find('"').unwrap() + start;
    text[start..end].to_string()
}
