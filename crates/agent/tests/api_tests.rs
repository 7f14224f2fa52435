//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use flagsync_agent::api::{create_router, AppState};
use sdk_core::{
    health::components, HealthRegistry, ReadinessEvent, StructuredLogger, SyncEvent, SyncMetrics,
    SyncMode,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SYNC).await;
    health_registry.register(components::SUBMITTERS).await;

    let state = Arc::new(AppState::new(health_registry, SyncMetrics::new()));
    let router = create_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["sync"].is_object());
    assert!(health["components"]["submitters"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_degraded(components::SYNC, "Polling for updates")
        .await;

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["components"]["sync"]["message"], "Polling for updates");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_unhealthy(components::SUBMITTERS, "Collector unreachable")
        .await;

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_until_sdk_ready() {
    let (app, state) = setup_test_app().await;

    let (status, readiness) = get_json(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    let (tx, rx) = broadcast::channel(4);
    let tracker = tokio::spawn(
        state
            .health_registry
            .clone()
            .track_readiness(rx, StructuredLogger::new("api-test")),
    );
    tx.send(ReadinessEvent::Ready).unwrap();
    drop(tx);
    tracker.await.unwrap();

    let (status, readiness) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_sync_stopped() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let (tx, rx) = broadcast::channel(4);
    let tracker = tokio::spawn(state.health_registry.clone().track_sync(rx));
    tx.send(SyncEvent::ModeChanged(SyncMode::Stopped)).unwrap();
    drop(tx);
    tracker.await.unwrap();

    let (status, readiness) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Critical component unhealthy");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_fetch_latency("splits", 0.002);
    state.metrics.record_batch("events", 3);
    state.metrics.set_sync_mode(SyncMode::Polling.gauge());
    state.metrics.set_sdk_ready(true);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("flagsync_fetch_latency_seconds_bucket"));
    assert!(metrics_text.contains("flagsync_fetch_latency_seconds_count"));
    assert!(metrics_text.contains("flagsync_batches_submitted_total"));
    assert!(metrics_text.contains("flagsync_records_submitted_total"));
    assert!(metrics_text.contains("flagsync_sync_mode 1"));
    assert!(metrics_text.contains("flagsync_sdk_ready 1"));
}
