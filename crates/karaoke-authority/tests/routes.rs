#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use karaoke_authority::routes::{AppState, build_router};
use karaoke_authority::storage::{AuthorityDatabase, NewCatalogEntry};
use karaoke_core::catalog::CatalogCode;
use karaoke_core::clock::ManualClock;
use karaoke_core::license::{DAY_SECS, KeyKind, LicenseKey};

const T0: i64 = 1_760_000_000;
const KEY: &str = "ABCD-1234-EFGH-5678";

struct Harness {
    app: axum::Router,
    db: AuthorityDatabase,
    clock: Arc<ManualClock>,
    media: tempfile::TempDir,
}

async fn harness() -> Harness {
    let db = AuthorityDatabase::open_in_memory().await.unwrap();
    let media = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let app = build_router(AppState {
        db: db.clone(),
        clock: clock.clone(),
        media_dir: media.path().to_path_buf(),
    });
    Harness {
        app,
        db,
        clock,
        media,
    }
}

async fn publish(db: &AuthorityDatabase, code: &str) {
    let codigo = CatalogCode::parse(code).unwrap();
    db.upsert_catalog_entry(&NewCatalogEntry {
        codigo: &codigo,
        artista: "Artist",
        titulo: &format!("Song {code}"),
        media_ref: &format!("media/{code}.mp4"),
        size: Some(4),
        duration: Some(180),
    })
    .await
    .unwrap();
}

/// Send a request and return (status, JSON body or Null).
async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness().await;
    let (status, body) = send(&h.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn validate_machine_key_over_http() {
    let h = harness().await;
    h.db.insert_key(&LicenseKey::parse(KEY).unwrap(), KeyKind::Machine, Some(7), None)
        .await
        .unwrap();

    let (status, body) = send(
        &h.app,
        "POST",
        "/v1/activation/validate",
        Some(json!({"key": "abcd-1234-efgh-5678", "deviceId": "D1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["diasRestantes"], 7);
    assert_eq!(body["kind"], "machine");
    assert_eq!(body["key"], KEY);

    h.clock.advance(3 * DAY_SECS);
    let (status, body) = send(
        &h.app,
        "POST",
        "/v1/activation/validate",
        Some(json!({"key": KEY, "deviceId": "D2"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "machine_conflict");
    assert!(body["message"].as_str().unwrap().contains("unbind"));
}

#[tokio::test]
async fn validation_failures_map_to_statuses() {
    let h = harness().await;
    let key = LicenseKey::parse(KEY).unwrap();
    h.db.insert_key(&key, KeyKind::Subscription, None, Some(T0 - 1)).await.unwrap();

    let cases = [
        ("not-a-key", StatusCode::BAD_REQUEST, "invalid_format"),
        ("ZZZZ-ZZZZ-ZZZZ-ZZZZ", StatusCode::NOT_FOUND, "not_found"),
        (KEY, StatusCode::GONE, "expired"),
        (KEY, StatusCode::FORBIDDEN, "not_active"),
    ];
    for (key, expected_status, expected_code) in cases {
        let (status, body) = send(
            &h.app,
            "POST",
            "/v1/activation/validate",
            Some(json!({"key": key, "deviceId": "D1"})),
        )
        .await;
        assert_eq!(status, expected_status, "key {key}");
        assert_eq!(body["error"], expected_code, "key {key}");
    }
}

#[tokio::test]
async fn catalog_paging_and_lookup() {
    let h = harness().await;
    for code in ["00001", "00002", "00003"] {
        publish(&h.db, code).await;
    }

    let (status, page) = send(&h.app, "GET", "/v1/catalog?since=0&limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["entries"].as_array().unwrap().len(), 2);
    assert_eq!(page["hasMore"], true);

    let cursor = page["nextCursor"].as_i64().unwrap();
    let (_, rest) = send(&h.app, "GET", &format!("/v1/catalog?since={cursor}&limit=2"), None).await;
    assert_eq!(rest["entries"][0]["codigo"], "00003");
    assert_eq!(rest["hasMore"], false);

    let (status, entry) = send(&h.app, "GET", "/v1/catalog/00002", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["titulo"], "Song 00002");

    let (status, body) = send(&h.app, "GET", "/v1/catalog/09999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_code");

    let (status, _) = send(&h.app, "GET", "/v1/catalog/12", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn history_push_with_placeholder_retry() {
    let h = harness().await;
    h.db.insert_key(&LicenseKey::parse(KEY).unwrap(), KeyKind::Machine, Some(7), None)
        .await
        .unwrap();
    publish(&h.db, "00001").await;

    let push = json!({
        "key": KEY,
        "deviceId": "D1",
        "entries": [
            {"id": "a", "codigo": "00001", "playedAt": T0},
            {"id": "b", "codigo": "04242", "playedAt": T0},
        ]
    });
    let (status, body) = send(&h.app, "POST", "/v1/history", Some(push.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], json!(["a"]));
    assert_eq!(body["rejected"][0]["id"], "b");
    assert_eq!(body["rejected"][0]["reason"], "unknown_code");

    let (status, _) = send(&h.app, "PUT", "/v1/catalog/04242/placeholder", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Retrying the whole batch is safe: "a" is a duplicate, "b" now lands.
    let (_, body) = send(&h.app, "POST", "/v1/history", Some(push)).await;
    assert_eq!(body["accepted"], json!(["a", "b"]));
    assert_eq!(body["rejected"], json!([]));

    // Placeholders stay out of the published catalog.
    let (status, _) = send(&h.app, "GET", "/v1/catalog/04242", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn history_push_requires_known_key() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        "POST",
        "/v1/history",
        Some(json!({"key": KEY, "deviceId": "D1", "entries": []})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn media_is_served_with_ranges() {
    let h = harness().await;
    std::fs::write(h.media.path().join("00001.mp4"), b"0123456789").unwrap();

    let req = Request::builder()
        .uri("/media/00001.mp4")
        .header("range", "bytes=4-")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"456789");
}
