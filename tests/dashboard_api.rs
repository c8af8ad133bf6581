//! Read-only dashboard views and update state toggling.

mod common;

use axum::body::Body;
use axum::http::Request;
use common::*;
use tempfile::TempDir;

const SCOPE: &str = "updates/main/1.0.0";

fn seed_update(dir: &TempDir, update_id: &str) {
    // Distinct metadata bytes per update so manifest ids differ.
    let metadata = serde_json::json!({
        "version": 0,
        "bundler": "metro",
        "fileMetadata": {
            "ios": { "bundle": "bundle.hbc", "assets": [] },
            "android": { "bundle": "", "assets": [] },
        },
        "extra": { "updateCode": update_id },
    })
    .to_string();
    seed_file(dir, &format!("{SCOPE}/{update_id}/metadata.json"), metadata.as_bytes());
    seed_file(dir, &format!("{SCOPE}/{update_id}/bundle.hbc"), b"bundle");
}

#[tokio::test]
async fn empty_store_lists_no_branches() {
    let dir = TempDir::new().unwrap();
    let router = make_router(&dir);

    let (status, _, body) = get(&router, "/api/dashboard/branches", &[("host", "localhost")]).await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["branches"], serde_json::json!([]));
}

#[tokio::test]
async fn views_walk_the_hierarchy() {
    let dir = TempDir::new().unwrap();
    seed_update(&dir, "build-1-aaa");
    seed_update(&dir, "build-2-bbb");
    let router = make_router(&dir);

    let (status, _, body) = get(&router, "/api/dashboard/branches", &[("host", "localhost")]).await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["branches"], serde_json::json!(["main"]));

    let (status, _, body) = get(
        &router,
        "/api/dashboard/branches/main/runtime-versions",
        &[("host", "localhost")],
    )
    .await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let versions = json["runtimeVersions"].as_array().unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["runtimeVersion"], "1.0.0");
    assert_eq!(versions[0]["numberOfUpdates"], 2);

    let (status, _, body) = get(
        &router,
        "/api/dashboard/branches/main/runtime-versions/1.0.0/updates",
        &[("host", "localhost")],
    )
    .await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let updates = json["updates"].as_array().unwrap();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|u| u["active"] == true));
    assert!(updates
        .iter()
        .any(|u| u["updateId"] == "build-2-bbb" && u["buildNumber"] == "build-2-bbb"));
}

#[tokio::test]
async fn state_toggle_flips_selection() {
    let dir = TempDir::new().unwrap();
    seed_update(&dir, "build-1-aaa");
    seed_update(&dir, "build-2-bbb");
    let router = make_router(&dir);

    // build-2 is newest and wins.
    let (_, _, body) = get(
        &router,
        "/api/update/manifest/main/1.0.0",
        &[("expo-platform", "ios"), ("expo-protocol-version", "1")],
    )
    .await;
    let before = part_json(&body)["id"].clone();

    // Deactivate it through the dashboard.
    let request = Request::builder()
        .method("PUT")
        .uri("/api/dashboard/branches/main/runtime-versions/1.0.0/updates/build-2-bbb/state")
        .header("host", "localhost")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"active":false}"#))
        .unwrap();
    let (status, _, _) = send(&router, request).await;
    assert_eq!(status, 200);
    assert!(dir
        .path()
        .join(format!("{SCOPE}/build-2-bbb/inactive"))
        .exists());

    // Selection now lands on build-1, and the cache was invalidated.
    let (_, _, body) = get(
        &router,
        "/api/update/manifest/main/1.0.0",
        &[("expo-platform", "ios"), ("expo-protocol-version", "1")],
    )
    .await;
    let after = part_json(&body)["id"].clone();
    assert_ne!(before, after);

    // Reactivation removes the inactive marker again.
    let request = Request::builder()
        .method("PUT")
        .uri("/api/dashboard/branches/main/runtime-versions/1.0.0/updates/build-2-bbb/state")
        .header("host", "localhost")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"active":true}"#))
        .unwrap();
    let (status, _, _) = send(&router, request).await;
    assert_eq!(status, 200);
    assert!(!dir
        .path()
        .join(format!("{SCOPE}/build-2-bbb/inactive"))
        .exists());
}

#[tokio::test]
async fn downloads_view_is_empty_until_recorded() {
    let dir = TempDir::new().unwrap();
    seed_update(&dir, "build-1-aaa");
    let router = make_router(&dir);

    let (status, _, body) = get(
        &router,
        "/api/dashboard/branches/main/runtime-versions/1.0.0/updates/build-1-aaa/downloads",
        &[("host", "localhost")],
    )
    .await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["downloads"], serde_json::json!([]));

    seed_file(
        &dir,
        "downloads/main/1.0.0/build-1-aaa/device-7_1700000000000.json",
        br#"{"clientId":"device-7"}"#,
    );
    let (status, _, body) = get(
        &router,
        "/api/dashboard/branches/main/runtime-versions/1.0.0/updates/build-1-aaa/downloads",
        &[("host", "localhost")],
    )
    .await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["downloads"][0]["clientId"], "device-7");
}

#[tokio::test]
async fn dashboard_requires_authentication_off_localhost() {
    let dir = TempDir::new().unwrap();
    let router = make_router(&dir);

    let (status, _, _) = get(
        &router,
        "/api/dashboard/branches",
        &[("host", "updates.example.com")],
    )
    .await;
    assert_eq!(status, 401);
}
