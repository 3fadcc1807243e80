use crate::metrics::{Metrics, MetricsSnapshot};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

async fn health(State(metrics): State<Arc<Metrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// `GET /health` returns the metrics snapshot; every other path is 404.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(metrics)
}

/// Health listener running on its own task. It only ever reads [`Metrics`].
pub struct HealthServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl HealthServer {
    pub async fn spawn(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind health server on {addr}"))?;
        let addr = listener.local_addr()?;
        let app = router(metrics);
        info!(%addr, "starting health server");
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "health server exited");
            }
        });
        Ok(Self { addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr { self.addr }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}
