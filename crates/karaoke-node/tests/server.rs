#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use karaoke_core::license::KeyKind;
use karaoke_node::server::build_router;

use common::{Harness, body, harness};

fn app(h: &Harness) -> axum::Router {
    build_router(h.node.app_state())
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
    let (status, body) = send(&app(&h), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn activation_flow() {
    let h = harness().await;
    let app = app(&h);

    let (status, lease) = send(&app, "GET", "/lease", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lease["ativada"], false);
    assert_eq!(lease["lastRevalidation"]["state"], "never");

    let (status, err) = send(&app, "POST", "/activation", Some(json!({"key": "nope"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_format");

    let key = h.remote.add_key(KeyKind::Machine, Some(7), None);
    let (status, lease) = send(&app, "POST", "/activation", Some(json!({"key": key.as_str()}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lease["ativada"], true);
    assert_eq!(lease["diasRestantes"], 7);
    assert_eq!(lease["kind"], "machine");

    let (_, lease) = send(&app, "GET", "/lease", None).await;
    assert_eq!(lease["ativada"], true);

    let (status, removed) = send(&app, "DELETE", "/activation", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["removed"], true);
    let (_, lease) = send(&app, "GET", "/lease", None).await;
    assert_eq!(lease["ativada"], false);
}

#[tokio::test]
async fn activation_errors_map_to_statuses() {
    let h = harness().await;
    let app = app(&h);
    let key = h.remote.add_key(KeyKind::Machine, Some(7), None);
    h.remote.insert_key(karaoke_core::license::ActivationKey {
        bound_device_id: Some("someone-else".into()),
        ..h.remote.key(&key).unwrap()
    });

    let (status, err) = send(&app, "POST", "/activation", Some(json!({"key": key.as_str()}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"], "machine_conflict");

    h.remote.set_offline(true);
    let (status, err) = send(&app, "POST", "/activation", Some(json!({"key": key.as_str()}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err["error"], "network_unavailable");
}

#[tokio::test]
async fn sync_endpoints_and_offline_status() {
    let h = harness().await;
    let app = app(&h);
    for c in ["00001", "00002", "00003"] {
        h.remote.add_entry(c, "Artist", &format!("Song {c}"), body(c, 10));
    }

    let (status, report) = send(&app, "POST", "/sync/discover", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["upserted"], 3);

    let (_, pending) = send(&app, "GET", "/sync/pending", None).await;
    assert_eq!(pending.as_array().unwrap().len(), 3);

    let (status, report) = send(&app, "POST", "/sync/batch?n=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["downloaded"], 2);
    assert_eq!(report["remaining"], 1);
    assert_eq!(report["errors"], 0);

    let (_, offline) = send(&app, "GET", "/offline-status", None).await;
    assert_eq!(offline["totalCatalog"], 3);
    assert_eq!(offline["totalLocal"], 2);
    assert_eq!(offline["totalPendingRemote"], 1);
    assert_eq!(offline["bytesUsed"], 20);

    let (status, report) = send(&app, "POST", "/sync/reindex", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["alreadyKnown"], 2);
}

#[tokio::test]
async fn catalog_search_and_lookup() {
    let h = harness().await;
    let app = app(&h);
    h.remote.add_entry("00001", "Roberto", "Detalhes", body("00001", 4));
    h.remote.add_entry("00002", "Tim", "Azul da Cor do Mar", body("00002", 4));
    h.node.sync.discover().await.unwrap();

    let (status, hits) = send(&app, "GET", "/catalog/search?q=azul", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hits.as_array().unwrap().len(), 1);
    assert_eq!(hits[0]["codigo"], "00002");

    let (status, row) = send(&app, "GET", "/catalog/00001", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["artista"], "Roberto");

    let (status, err) = send(&app, "GET", "/catalog/04242", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "unknown_code");

    let (status, err) = send(&app, "GET", "/catalog/12", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_code");
}

#[tokio::test]
async fn queue_endpoints() {
    let h = harness().await;
    let app = app(&h);
    h.remote.add_entry("00001", "Roberto", "Detalhes", body("00001", 4));
    h.node.sync.discover().await.unwrap();

    let (status, len) = send(&app, "POST", "/queue", Some(json!({"codigo": "00001"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(len["length"], 1);
    let (_, len) = send(&app, "POST", "/queue", Some(json!({"codigo": "00007", "titulo": "Typed"}))).await;
    assert_eq!(len["length"], 2);

    let (_, items) = send(&app, "GET", "/queue", None).await;
    assert_eq!(items[0]["titulo"], "Detalhes");
    assert_eq!(items[0]["artista"], "Roberto");
    assert_eq!(items[1]["titulo"], "Typed");
    assert!(items[1].get("artista").is_none());

    let (_, next) = send(&app, "GET", "/queue/next", None).await;
    assert_eq!(next["codigo"], "00001");
    let (_, popped) = send(&app, "POST", "/queue/pop", None).await;
    assert_eq!(popped["codigo"], "00001");

    let (status, _) = send(&app, "DELETE", "/queue", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, popped) = send(&app, "POST", "/queue/pop", None).await;
    assert_eq!(popped, Value::Null);

    let (status, err) = send(&app, "POST", "/queue", Some(json!({"codigo": "abc"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_code");
}

#[tokio::test]
async fn player_and_history_endpoints() {
    let h = harness().await;
    let app = app(&h);
    let key = h.remote.add_key(KeyKind::Subscription, None, None);
    h.node.license.validate_key(key.as_str()).await.unwrap();
    h.remote.add_entry("00001", "A", "T", body("00001", 4));

    let (status, state) = send(&app, "POST", "/player/start", Some(json!({"codigo": "00001"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["state"], "playing");
    assert_eq!(state["codigo"], "00001");

    let (_, state) = send(&app, "GET", "/player", None).await;
    assert_eq!(state["state"], "playing");

    let (status, outcome) = send(&app, "POST", "/player/finish", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(outcome["recorded"].is_string());
    assert_eq!(outcome["state"]["state"], "idle");

    let (status, recorded) = send(&app, "POST", "/history", Some(json!({"codigo": "00001"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(recorded["id"].is_string());

    let (status, report) = send(&app, "POST", "/history/push", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["pushed"], 2);
    assert_eq!(report["pending"], 0);
}

#[tokio::test]
async fn media_streams_downloaded_files_with_ranges() {
    let h = harness().await;
    let app = app(&h);
    h.remote.add_entry("00001", "A", "T", body("00001", 64));
    h.remote.add_entry("00002", "B", "U", body("00002", 64));
    h.node.sync.discover().await.unwrap();
    h.node.sync.download_batch(1).await.unwrap();

    let resp = app
        .clone()
        .oneshot(Request::get("/media/00001").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), body("00001", 64).as_slice());

    let resp = app
        .clone()
        .oneshot(
            Request::get("/media/00001")
                .header("range", "bytes=10-19")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), &body("00001", 64)[10..20]);

    let (status, err) = send(&app, "GET", "/media/00002", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "not_downloaded");

    let (status, err) = send(&app, "GET", "/media/1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_code");
}

#[tokio::test]
async fn random_pick_comes_from_downloaded_songs() {
    let h = harness().await;
    let app = app(&h);
    for c in ["00001", "00002", "00003"] {
        h.remote.add_entry(c, "Artist", &format!("Song {c}"), body(c, 8));
    }
    h.node.sync.discover().await.unwrap();

    let (status, pick) = send(&app, "GET", "/catalog/random", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pick, Value::Null);

    h.node.sync.download_batch(2).await.unwrap();
    for _ in 0..10 {
        let (_, pick) = send(&app, "GET", "/catalog/random", None).await;
        assert!(pick["local_path"].is_string());
        assert_ne!(pick["codigo"], "00003");
    }
}
