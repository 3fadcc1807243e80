use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use ingest_bridge::health::router;
use ingest_bridge::{HealthServer, Metrics, MetricsSnapshot};
use std::sync::Arc;
use tower::ServiceExt;

#[tokio::test]
async fn health_returns_snapshot_json() {
    let metrics = Arc::new(Metrics::new());
    metrics.set_bus_connected(true);
    metrics.record_consume(5);
    metrics.record_insert(4);
    metrics.record_error(1);

    let resp = router(metrics.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let snap: MetricsSnapshot = serde_json::from_slice(&bytes).expect("snapshot json");
    assert_eq!(snap.status, "unhealthy");
    assert!(snap.bus_connected);
    assert!(!snap.sink_connected);
    assert_eq!(snap.events_consumed, 5);
    assert_eq!(snap.events_inserted, 4);
    assert_eq!(snap.batches_flushed, 1);
    assert_eq!(snap.errors, 1);
    assert!(snap.last_flush_at.is_some());
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let resp = router(Arc::new(Metrics::new()))
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn server_reports_healthy_over_tcp() {
    let metrics = Arc::new(Metrics::new());
    metrics.set_bus_connected(true);
    metrics.set_sink_connected(true);
    let server = HealthServer::spawn("127.0.0.1:0".parse().unwrap(), metrics).await.expect("bind");
    let url = format!("http://{}/health", server.local_addr());
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body.get("started_at").is_some());
    server.shutdown();
}
