//! Telemetry endpoint: Prometheus text at /metrics, component snapshots at
//! /status, manual breaker reset at /breaker/reset.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::awg::ApiWeightGovernor;
use crate::breaker::RiskBreaker;
use crate::ledger::EventLedger;
use crate::metrics::Metrics;
use crate::mirror::OrderMirror;
use crate::shadow::ShadowBalance;
use crate::uds::UserDataStream;

#[derive(Clone)]
pub struct TelemetryState {
    pub metrics: Arc<Metrics>,
    pub awg: Arc<ApiWeightGovernor>,
    pub ledger: Arc<EventLedger>,
    pub shadow: Arc<ShadowBalance>,
    pub mirror: Arc<OrderMirror>,
    pub uds: Arc<UserDataStream>,
    pub breaker: Arc<RiskBreaker>,
}

pub async fn serve(state: TelemetryState, addr: String) {
    let app = Router::new()
        .route("/metrics", get(metrics_text))
        .route("/status", get(status_json))
        .route("/breaker/reset", post(breaker_reset))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("[telemetry] bind {addr} failed: {e}");
            return;
        }
    };
    info!("[telemetry] listening on {addr}");
    if let Err(e) = axum::serve(listener, app).await {
        warn!("[telemetry] server error: {e}");
    }
}

async fn metrics_text(State(state): State<TelemetryState>) -> String {
    state.metrics.render()
}

async fn status_json(State(state): State<TelemetryState>) -> Json<Value> {
    Json(json!({
        "awg": state.awg.status(),
        "ledger": state.ledger.status(),
        "shadow": {
            "stats": state.shadow.stats(),
            "summary": state.shadow.summary(),
        },
        "mirror": {
            "stats": state.mirror.stats(),
            "summary": state.mirror.summary(),
        },
        "uds": state.uds.health(),
        "breaker": state.breaker.status(),
    }))
}

async fn breaker_reset(State(state): State<TelemetryState>) -> Json<Value> {
    state.breaker.reset();
    Json(json!({"ok": true}))
}
