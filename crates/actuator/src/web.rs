//! Actuator-local HTTP surface: liveness for the orchestrator and a small
//! valve/flow status endpoint.  The full UI-facing REST/SSE surface lives in
//! the web UI process.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

use mistcool_core::message::FaultClass;

use crate::fault::SafeState;
use crate::flow::FlowEstimate;
use crate::valve::ValveObservation;

#[derive(Clone)]
pub struct AppState {
    /// Arrival time of the last control message.
    pub last_control: watch::Receiver<Option<Instant>>,
    pub liveness_timeout: Duration,
    pub valve: watch::Receiver<ValveObservation>,
    pub estimate: watch::Receiver<FlowEstimate>,
    pub safe: watch::Receiver<SafeState>,
}

#[derive(Serialize)]
struct ValveStatusResponse {
    valve_open: bool,
    valve_duration_sec: f64,
    flow_lpm: Option<f64>,
    safe_engaged: bool,
    fault: FaultClass,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/healthz", get(healthz))
        .route("/api/valve_status", get(valve_status))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let fresh = state
        .last_control
        .borrow()
        .map(|at| at.elapsed() <= state.liveness_timeout)
        .unwrap_or(false);
    if fresh {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no control messages")
    }
}

async fn valve_status(State(state): State<AppState>) -> impl IntoResponse {
    let valve = *state.valve.borrow();
    let estimate = *state.estimate.borrow();
    let safe = *state.safe.borrow();
    Json(ValveStatusResponse {
        valve_open: valve.open,
        valve_duration_sec: valve.duration().as_secs_f64(),
        flow_lpm: (estimate.sampling && estimate.n > 0).then_some(estimate.mean),
        safe_engaged: safe.engaged,
        fault: safe.fault,
    })
}

pub async fn serve(port: u16, state: AppState) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind actuator web on {addr}: {e}");
            return;
        }
    };
    info!(%addr, "actuator web listening");
    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("actuator web server error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
