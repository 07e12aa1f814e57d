use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use waybill_client::{ClientConfig, Connectivity, ErrorClass, StoreLocation, SyncContext};
use waybill_core::EntityType;
use waybill_events::{EventBus, SyncEvent};

type Log = Arc<Mutex<Vec<(String, Value)>>>;

/// Mock REST backend on an ephemeral port.
struct TestServer {
    base_url: String,
    log: Log,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let log: Log = Arc::default();
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/v1/shipments", post(create_shipment))
            .route("/v1/shipments/:id", patch(update_shipment).get(fetch_shipment))
            .with_state(log.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, log, handle }
    }

    fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(line, _)| line.clone()).collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn create_shipment(State(log): State<Log>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    log.lock().unwrap().push(("POST /v1/shipments".to_string(), body.clone()));
    let mut data = body;
    data["id"] = json!("ship_123");
    (StatusCode::CREATED, Json(json!({ "data": data })))
}

async fn update_shipment(
    State(log): State<Log>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    log.lock().unwrap().push((format!("PATCH /v1/shipments/{id}"), body.clone()));
    let mut data = body;
    data["id"] = json!(id);
    data["origin"] = json!("Jakarta");
    Json(json!({ "data": data }))
}

async fn fetch_shipment(State(log): State<Log>, Path(id): Path<String>) -> Json<Value> {
    log.lock().unwrap().push((format!("GET /v1/shipments/{id}"), Value::Null));
    Json(json!({ "data": { "id": id, "status": "in_transit" } }))
}

fn config_for(base_url: &str) -> ClientConfig {
    ClientConfig {
        api_base_url: base_url.to_string(),
        api_version: "v1".to_string(),
        realtime_url: "ws://127.0.0.1:9/ws".to_string(),
        store: StoreLocation::Memory,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn offline_create_and_follow_up_reconcile_after_reconnect() {
    let srv = TestServer::spawn().await;
    let ctx = SyncContext::build(config_for(&srv.base_url)).await.unwrap();
    let events = ctx.events.subscribe();
    ctx.monitor.set(Connectivity::Offline);

    let created = ctx
        .dispatcher
        .post("/shipments", json!({ "origin": "Jakarta", "destination": "Surabaya" }))
        .await
        .unwrap();
    assert!(created.is_deferred());
    let temp_id = created.temp_id().cloned().unwrap();
    assert_eq!(created.body()["offlineOperation"], json!(true));

    let updated = ctx
        .dispatcher
        .patch(&format!("/shipments/{temp_id}"), json!({ "status": "ready_for_pickup" }))
        .await
        .unwrap();
    assert!(updated.is_deferred());

    // Optimistic copy is readable before anything reached the server.
    let optimistic = ctx
        .cache
        .get_entity(&EntityType::Shipment, temp_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert!(!optimistic.is_confirmed());
    assert!(srv.requests().is_empty());
    assert_eq!(ctx.queue.len().await.unwrap(), 2);

    ctx.monitor.set(Connectivity::Online);
    let report = ctx.queue.drain().await.unwrap();

    assert_eq!(report.replayed.len(), 2);
    assert_eq!(report.reconciled, vec![(temp_id.clone(), "ship_123".to_string())]);
    assert_eq!(
        srv.requests(),
        vec!["POST /v1/shipments", "PATCH /v1/shipments/ship_123"]
    );
    assert!(ctx.queue.is_empty().await.unwrap());

    let confirmed = ctx
        .cache
        .get_entity(&EntityType::Shipment, "ship_123")
        .await
        .unwrap()
        .unwrap();
    assert!(confirmed.is_confirmed());
    assert_eq!(confirmed.payload["status"], json!("ready_for_pickup"));
    assert!(
        ctx.cache
            .get_entity(&EntityType::Shipment, temp_id.as_str())
            .await
            .unwrap()
            .is_none()
    );

    let seen = events.drain();
    assert!(seen.iter().any(|e| matches!(
        e,
        SyncEvent::IdReconciled { real_id, .. } if real_id == "ship_123"
    )));
}

#[tokio::test]
async fn live_reads_populate_the_cache_for_later_offline_use() {
    let srv = TestServer::spawn().await;
    let ctx = SyncContext::build(config_for(&srv.base_url)).await.unwrap();

    let live = ctx.dispatcher.get("/shipments/ship_7").await.unwrap();
    assert!(!live.is_deferred());
    assert_eq!(srv.requests(), vec!["GET /v1/shipments/ship_7"]);

    ctx.monitor.set(Connectivity::Offline);
    let cached = ctx.dispatcher.get("/shipments/ship_7").await.unwrap();
    assert_eq!(cached.body()["status"], json!("in_transit"));
    assert_eq!(srv.requests().len(), 1);
}

#[tokio::test]
async fn unreachable_backend_defers_writes_and_marks_offline() {
    // Reserve a port, then close it so connections are refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let ctx = SyncContext::build(config_for(&format!("http://{addr}"))).await.unwrap();
    assert_eq!(ctx.monitor.current(), Connectivity::Unknown);

    let response = ctx
        .dispatcher
        .put("/customers/c_1", json!({ "name": "Budi" }))
        .await
        .unwrap();
    assert!(response.is_deferred());
    assert!(response.temp_id().is_none());
    assert_eq!(ctx.monitor.current(), Connectivity::Offline);
    assert_eq!(ctx.queue.len().await.unwrap(), 1);

    let miss = ctx.dispatcher.get("/shipments/ship_404").await.unwrap_err();
    assert_eq!(miss.class(), Some(ErrorClass::Connectivity));
}
