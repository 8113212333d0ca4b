//! Process-wide counters and the diagnostics HTTP endpoint.
//!
//! Counters are plain atomics incremented from connection teardown (and, for
//! the warning banners, from the banner task). The diagnostics server is a
//! tiny axum router exposing them as JSON; export to a time-series database
//! is intentionally not part of this server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

/// Counter set for the whole process.
#[derive(Debug, Default)]
pub struct Metrics {
    pub handshake_errors: AtomicU64,
    pub errors: AtomicU64,
    pub agent: AtomicU64,
    pub x11: AtomicU64,
    pub roaming: AtomicU64,
    pub conns: AtomicU64,
    pub with_keys: AtomicU64,
    pub identified: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current values as a JSON object, for `/debug/vars` and tests.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "handshake_errors": self.handshake_errors.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "agent": self.agent.load(Ordering::Relaxed),
            "x11": self.x11.load(Ordering::Relaxed),
            "roaming": self.roaming.load(Ordering::Relaxed),
            "conns": self.conns.load(Ordering::Relaxed),
            "with_keys": self.with_keys.load(Ordering::Relaxed),
            "identified": self.identified.load(Ordering::Relaxed),
        })
    }
}

/// Increment helper; all counters are monotonic.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

async fn vars(State(metrics): State<Arc<Metrics>>) -> Json<serde_json::Value> {
    Json(metrics.snapshot())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve `GET /debug/vars` and `GET /healthz` on `addr` until the process
/// exits.
pub async fn serve_diagnostics(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<()> {
    let router = Router::new()
        .route("/debug/vars", get(vars))
        .route("/healthz", get(healthz))
        .with_state(metrics);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind diagnostics endpoint on {addr}"))?;
    info!("Diagnostics endpoint listening on {addr}");

    axum::serve(listener, router)
        .await
        .context("diagnostics server exited")
}
