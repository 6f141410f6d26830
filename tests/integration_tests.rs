//! Integration tests: durable restarts and the HTTP API.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use balance_tier::clock::ManualClock;
use balance_tier::config::Config;
use balance_tier::queue::TransferStatus;
use balance_tier::server::{build_router, AppState};
use balance_tier::service::SubmitRequest;
use balance_tier::store::{FileStore, MemoryStore};
use balance_tier::Ledger;

const X: &str = "0x1111111111111111111111111111111111111111";
const Y: &str = "0x2222222222222222222222222222222222222222";

fn file_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.store.data_dir = dir.to_path_buf();
    config.store.fsync = false;
    config
}

async fn open_ledger(config: &Config) -> (Arc<Ledger>, Arc<FileStore>) {
    let store = Arc::new(FileStore::open(&config.store).await.unwrap());
    let ledger = Ledger::new(
        config.clone(),
        store.clone(),
        Arc::new(ManualClock::new(5_000)),
    )
    .unwrap();
    (Arc::new(ledger), store)
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    let (done_id, pending_id, held_id, owner) = {
        let (ledger, _) = open_ledger(&config).await;
        ledger.seed_balance(X, Decimal::from(10)).await.unwrap();
        let done = ledger
            .submit_transfer(SubmitRequest {
                from: Some(X.into()),
                to: Y.into(),
                amount: Decimal::from(4),
                hash: "0xpersist".into(),
                gas_price: None,
            })
            .await
            .unwrap();
        ledger.processor().run_once().await.unwrap();
        let pending = ledger.mint(Y, Decimal::ONE, "0xlater").await.unwrap();
        // Higher amount, so it is claimed ahead of "0xlater".
        let held = ledger.mint(Y, Decimal::from(2), "0xheld").await.unwrap();
        let claimed = ledger.queue().claim_batch(1).await.unwrap();
        assert_eq!(claimed[0].id, held.id);
        (done.id, pending.id, held.id, ledger.queue().owner())
    };

    let (ledger, _) = open_ledger(&config).await;
    assert_eq!(ledger.get_balance(X).await.unwrap(), Decimal::from(6));
    assert_eq!(ledger.get_balance(Y).await.unwrap(), Decimal::from(4));

    let done = ledger.transfer(done_id).await.unwrap().unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    let pending = ledger.transfer(pending_id).await.unwrap().unwrap();
    assert_eq!(pending.status, TransferStatus::Pending);
    let held = ledger.transfer(held_id).await.unwrap().unwrap();
    assert_eq!(held.status, TransferStatus::Claimed);
    assert_eq!(held.lease.map(|lease| lease.owner), Some(owner));

    // Dedup survives the restart, and new ids keep counting up.
    let again = ledger.mint(Y, Decimal::ONE, "0xlater").await.unwrap();
    assert!(!again.accepted);
    assert_eq!(again.id, pending_id);
    let fresh = ledger.mint(Y, Decimal::ONE, "0xfresh").await.unwrap();
    assert!(fresh.id > pending_id);
}

#[tokio::test]
async fn test_compacted_store_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    {
        let (ledger, store) = open_ledger(&config).await;
        ledger.seed_balance(X, Decimal::from(3)).await.unwrap();
        ledger.mint(X, Decimal::from(2), "0xc1").await.unwrap();
        ledger.processor().run_once().await.unwrap();
        store.compact().await.unwrap();
        ledger.mint(X, Decimal::from(5), "0xc2").await.unwrap();
    }

    let (ledger, _) = open_ledger(&config).await;
    assert_eq!(ledger.get_balance(X).await.unwrap(), Decimal::from(5));
    let stats = ledger.queue_stats().await.unwrap();
    assert_eq!((stats.pending, stats.completed), (1, 1));

    ledger.processor().run_once().await.unwrap();
    assert_eq!(ledger.get_balance(X).await.unwrap(), Decimal::from(10));
}

// ─── HTTP API ──────────────────────────────────────────────────────────────

fn app() -> (Router, Arc<Ledger>) {
    let ledger = Arc::new(
        Ledger::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(5_000)),
        )
        .unwrap(),
    );
    let router = build_router(Arc::new(AppState::new(
        ledger.clone(),
        CancellationToken::new(),
    )));
    (router, ledger)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::get(uri).body(Body::empty()).unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().unwrap(),
        other => other.to_string().parse().unwrap(),
    }
}

#[tokio::test]
async fn test_balance_endpoint() {
    let (app, ledger) = app();
    ledger.seed_balance(X, Decimal::from(10)).await.unwrap();

    let (status, body) = get_json(&app, &format!("/v1/balances/{X}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], X);
    assert_eq!(decimal(&body["balance"]), Decimal::from(10));

    let (status, body) = get_json(&app, "/v1/balances/0xnothex").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_submit_then_duplicate() {
    let (app, _) = app();
    let payload = json!({
        "from": X,
        "to": Y,
        "amount": "2.5",
        "hash": "0xabc",
        "gas_price": 3
    });

    let (status, first) = post_json(&app, "/v1/transfers", payload.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["accepted"], true);

    let (status, second) = post_json(&app, "/v1/transfers", payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["accepted"], false);
    assert_eq!(second["id"], first["id"]);
    assert_eq!(second["reason"], "duplicate");

    let id = first["id"].as_u64().unwrap();
    let (status, transfer) = get_json(&app, &format!("/v1/transfers/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(transfer["status"], "pending");
    assert_eq!(transfer["hash"], "0xabc");

    let (status, stats) = get_json(&app, "/v1/queue/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["completed"], 0);
}

#[tokio::test]
async fn test_submit_rejects_invalid_amount() {
    let (app, _) = app();
    let (status, body) = post_json(
        &app,
        "/v1/transfers",
        json!({"from": X, "to": Y, "amount": "-1", "hash": "0xneg"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());

    let (_, stats) = get_json(&app, "/v1/queue/stats").await;
    assert_eq!(stats["pending"], 0);
}

#[tokio::test]
async fn test_full_queue_is_503_with_retry_after() {
    let mut config = Config::default();
    config.queue.max_outstanding = 1;
    let ledger = Arc::new(
        Ledger::new(config, Arc::new(MemoryStore::new()), Arc::new(ManualClock::new(0))).unwrap(),
    );
    ledger.mint(X, Decimal::ONE, "0xfirst").await.unwrap();
    let app = build_router(Arc::new(AppState::new(ledger, CancellationToken::new())));

    let request = Request::post("/v1/transfers")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"to": X, "amount": 1, "hash": "0xsecond"}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
}

#[tokio::test]
async fn test_unknown_transfer_is_404() {
    let (app, _) = app();
    let (status, body) = get_json(&app, "/v1/transfers/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("999"));
}

#[tokio::test]
async fn test_cache_stats_and_health() {
    let (app, ledger) = app();
    ledger.get_balance(X).await.unwrap();
    ledger.get_balance(X).await.unwrap();

    let (status, stats) = get_json(&app, "/v1/cache/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["store_reads"], 1);
    assert_eq!(stats["cold_hits"], 1);
    assert_eq!(stats["sizes"]["hot"], 1);

    let (status, health) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["cache"]["hot"], 1);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let (app, ledger) = app();
    ledger.get_balance(Y).await.unwrap();
    ledger.mint(Y, Decimal::ONE, "0xm").await.unwrap();
    ledger.processor().run_once().await.unwrap();

    let request = Request::get("/metrics").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("balance_cache_store_reads_total"));
    assert!(text.contains("transfer_submissions_total"));
    assert!(text.contains("transfers_processed_total"));
    assert!(text.contains("transfer_batch_duration_seconds"));
}
