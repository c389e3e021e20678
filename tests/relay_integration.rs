//! End-to-end tests across the bus, broker, status relay and HTTP surface.
//!
//! Everything runs in-process: the in-memory bus stands in for Redis and
//! connections are plain channels registered directly with the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower::ServiceExt;

use event_relay::broker::{broker_topics, BrokerConfig, MessageBroker};
use event_relay::bus::{InMemoryBus, MessageBus};
use event_relay::config::{
    BusConfig, JwtConfig, OtelConfig, QuotaConfig, ServerConfig, Settings, TenantEntry,
    ThrottlingConfig, WebSocketConfig,
};
use event_relay::connection_manager::ConnectionRegistry;
use event_relay::events::{
    ChangeType, EntityChanged, EventPayload, PlanOverageNotice, RelayEvent, WorkItemStatus,
};
use event_relay::guards::{PlanLimits, QuotaTracker, StaticQuotaSource};
use event_relay::jobs::WorkItemReporter;
use event_relay::relay::{OrNull, StatusRelay};
use event_relay::server::{create_app, AppState};
use event_relay::websocket::OutboundMessage;

const API_KEY: &str = "tenant-t-key";

fn settings(max_requests: u32) -> Settings {
    Settings {
        server: ServerConfig::default(),
        jwt: JwtConfig {
            secret: "integration-secret".to_string(),
            issuer: None,
            audience: None,
        },
        bus: BusConfig {
            backend: "memory".to_string(),
            ..Default::default()
        },
        websocket: WebSocketConfig {
            send_timeout_ms: 200,
            ..Default::default()
        },
        throttling: ThrottlingConfig {
            enabled: true,
            max_requests,
            window_seconds: 1,
            ..Default::default()
        },
        quota: QuotaConfig::default(),
        tenants: vec![TenantEntry {
            id: "T".to_string(),
            api_keys: vec![API_KEY.to_string()],
            active: true,
            max_events_per_hour: None,
            max_events_per_month: None,
        }],
        otel: OtelConfig::default(),
    }
}

struct Harness {
    app: Router,
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
    notices: mpsc::UnboundedReceiver<PlanOverageNotice>,
}

async fn harness(max_requests: u32) -> Harness {
    harness_with(settings(max_requests)).await
}

async fn harness_with(settings: Settings) -> Harness {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(64));
    let (state, notices) = AppState::build(settings, bus.clone());
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut workers = state
        .broker
        .start(bus.as_ref(), &broker_topics(), &shutdown_tx)
        .await
        .unwrap();
    let relay = Arc::new(StatusRelay::new(state.broker.clone()));
    workers.push(relay.start(bus.as_ref(), &shutdown_tx).await.unwrap());

    Harness {
        app: create_app(state.clone()),
        state,
        shutdown_tx,
        workers,
        notices,
    }
}

async fn connect(
    registry: &ConnectionRegistry,
    user: &str,
    tenant: &str,
) -> mpsc::Receiver<OutboundMessage> {
    let (tx, rx) = mpsc::channel(8);
    registry
        .register(user.to_string(), tenant.to_string(), tx)
        .await
        .unwrap();
    rx
}

fn frame_json(msg: OutboundMessage) -> Value {
    serde_json::from_str(&msg.to_json().unwrap()).unwrap()
}

async fn next_frame(rx: &mut mpsc::Receiver<OutboundMessage>) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection channel closed");
    frame_json(msg)
}

async fn assert_silent(rx: &mut mpsc::Receiver<OutboundMessage>) {
    let outcome = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(outcome.is_err(), "unexpected frame: {:?}", outcome);
}

fn publish_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/events")
        .header("content-type", "application/json")
        .header("X-API-Key", API_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn work_item_body() -> Value {
    json!({
        "payload": {
            "type": "work_item_status",
            "data": { "work_item_id": "abc", "message": null, "progress": 50 }
        }
    })
}

/// Start at the beginning of a fresh one-second throttling window
async fn align_to_next_second() {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let wait = 1000 - now_ms.rem_euclid(1000) + 10;
    tokio::time::sleep(Duration::from_millis(wait as u64)).await;
}

fn entity_event(tenant: &str, id: &str) -> RelayEvent {
    RelayEvent::for_tenant(
        tenant,
        EventPayload::EntityChanged(EntityChanged {
            entity_type: "Project".to_string(),
            id: Some(id.to_string()),
            change_type: ChangeType::Added,
            data: HashMap::new(),
        }),
    )
}

#[tokio::test]
async fn test_tenant_event_reaches_every_tenant_connection_only() {
    let registry = Arc::new(ConnectionRegistry::new());
    let quota = Arc::new(QuotaTracker::new(Arc::new(StaticQuotaSource::new(
        PlanLimits::unlimited(),
    ))));
    let broker = MessageBroker::new(registry.clone(), quota, BrokerConfig::default());

    let mut tenant_rxs = Vec::new();
    for i in 0..4 {
        tenant_rxs.push(connect(&registry, &format!("t-user-{i}"), "T").await);
    }
    let mut other = connect(&registry, "u-user", "U").await;

    let result = broker.dispatch(&entity_event("T", "p-1")).await;

    assert_eq!(result.targeted, 4);
    assert_eq!(result.delivered, 4);
    for rx in &mut tenant_rxs {
        let frame = next_frame(rx).await;
        assert_eq!(frame["topic"], "entity-changed");
        assert_eq!(frame["event"]["payload"]["data"]["id"], "p-1");
    }
    assert_silent(&mut other).await;
}

#[tokio::test]
async fn test_failed_write_drops_connection_and_others_still_receive() {
    let registry = Arc::new(ConnectionRegistry::new());
    let quota = Arc::new(QuotaTracker::new(Arc::new(StaticQuotaSource::new(
        PlanLimits::unlimited(),
    ))));
    let broker = MessageBroker::new(registry.clone(), quota, BrokerConfig::default());

    let mut alive_a = connect(&registry, "a", "T").await;
    let broken = connect(&registry, "b", "T").await;
    let mut alive_c = connect(&registry, "c", "T").await;
    drop(broken);

    let result = broker.dispatch(&entity_event("T", "p-2")).await;

    assert_eq!(result.targeted, 3);
    assert_eq!(result.delivered, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(registry.len().await, 2);
    assert!(registry.get_connections_for_user("b").await.is_empty());

    next_frame(&mut alive_a).await;
    next_frame(&mut alive_c).await;
}

#[tokio::test]
async fn test_work_item_status_published_over_http_reaches_tenant_clients() {
    let h = harness(100).await;
    let mut t1 = connect(&h.state.registry, "t1", "T").await;
    let mut t2 = connect(&h.state.registry, "t2", "T").await;
    let mut u1 = connect(&h.state.registry, "u1", "U").await;

    let response = h.app.clone().oneshot(publish_request(work_item_body())).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["X-Over-Limit"], "false");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["over_limit"], false);

    for rx in [&mut t1, &mut t2] {
        let frame = next_frame(rx).await;
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["topic"], "work-item-status");
        let data = &frame["event"]["payload"]["data"];
        assert_eq!(data["work_item_id"], "abc");
        assert_eq!(data["progress"], 50);
        assert!(data["message"].is_null());
        assert_silent(rx).await;
    }
    assert_silent(&mut u1).await;

    // Absent values render as a placeholder only when logged
    let status = WorkItemStatus::new(Some("abc".into()), None, 50);
    assert_eq!(OrNull(&status.message).to_string(), "<NULL>");
    assert_eq!(OrNull(&status.work_item_id).to_string(), "abc");
}

#[tokio::test]
async fn test_only_published_events_count_toward_quota() {
    let mut settings = settings(100);
    settings.tenants[0].max_events_per_hour = Some(1);
    let mut h = harness_with(settings).await;

    let rejected = [
        json!({
            "payload": {
                "type": "release_notification",
                "data": { "critical": false, "date": "2024-03-15T10:00:00Z", "message": null }
            }
        }),
        json!({
            "payload": {
                "type": "entity_changed",
                "data": { "entity_type": " ", "id": null, "change_type": "added", "data": {} }
            }
        }),
        json!({ "payload": { "type": "no_such_topic" } }),
    ];
    for body in rejected {
        let response = h.app.clone().oneshot(publish_request(body)).await.unwrap();
        assert!(response.status().is_client_error(), "got {}", response.status());
    }

    assert_eq!(h.state.quota.usage("T").hourly, 0);
    assert!(!h.state.quota.is_over("T"));
    assert!(h.notices.try_recv().is_err());

    let first = h.app.clone().oneshot(publish_request(work_item_body())).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    assert_eq!(first.headers()["X-Over-Limit"], "false");
    assert_eq!(h.state.quota.usage("T").hourly, 1);

    let second = h.app.clone().oneshot(publish_request(work_item_body())).await.unwrap();
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    assert_eq!(second.headers()["X-Over-Limit"], "true");

    let notice = h.notices.try_recv().unwrap();
    assert_eq!(notice.organization_id, "T");
    assert_eq!(notice.count, 2);
    assert_eq!(notice.limit, 1);
}

#[tokio::test]
async fn test_throttle_admits_two_per_second_and_rejects_third() {
    let h = harness(2).await;

    align_to_next_second().await;
    let mut statuses = Vec::new();
    let mut retry_after = None;
    for _ in 0..3 {
        let response = h.app.clone().oneshot(publish_request(work_item_body())).await.unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            retry_after = response
                .headers()
                .get("Retry-After")
                .map(|v| v.to_str().unwrap().to_string());
        }
        statuses.push(response.status());
    }

    assert_eq!(
        statuses,
        vec![
            StatusCode::ACCEPTED,
            StatusCode::ACCEPTED,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
    assert_eq!(retry_after.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_publish_requires_known_api_key() {
    let h = harness(10).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/events")
        .header("content-type", "application/json")
        .header("X-API-Key", "wrong")
        .body(Body::from(work_item_body().to_string()))
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_reporter_progress_reaches_clients_and_stats_count_it() {
    let h = harness(10).await;
    let mut rx = connect(&h.state.registry, "t1", "T").await;

    let reporter = WorkItemReporter::new(h.state.bus.clone(), Some("job-7".into())).for_tenant("T");
    reporter.report(130, Some("almost")).await.unwrap();

    let frame = next_frame(&mut rx).await;
    assert_eq!(frame["event"]["payload"]["data"]["progress"], 100);
    assert_eq!(frame["event"]["payload"]["data"]["message"], "almost");
    // Stats are recorded after the fan-out completes
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let stats: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["connections"]["total_connections"], 1);
    assert_eq!(stats["deliveries"]["total_delivered"], 1);
}

#[tokio::test]
async fn test_shutdown_drains_dispatch_loops() {
    let h = harness(10).await;
    let mut rx = connect(&h.state.registry, "t1", "T").await;

    h.state.bus.publish(&entity_event("T", "last")).await.unwrap();
    let _ = h.shutdown_tx.send(());

    for worker in h.workers {
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("dispatch loop did not stop")
            .unwrap();
    }

    let frame = next_frame(&mut rx).await;
    assert_eq!(frame["event"]["payload"]["data"]["id"], "last");
}
