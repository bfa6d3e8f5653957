//! REST + SSE surface for the browser UI.
//!
//! All data comes from the two live subscriptions (control stream, actuator
//! status stream) and the read-only view of the actuator's SQLite file.  The
//! SSE channel only carries refresh hints (`log` / `stat`); the UI re-fetches
//! through the REST endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info};

use mistcool_core::db::{self, Db};
use mistcool_core::message::{ActuatorStatus, ControlMessage};

/// Refresh hints pushed to SSE clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseHint {
    Log,
    Stat,
}

impl SseHint {
    fn as_str(self) -> &'static str {
        match self {
            SseHint::Log => "log",
            SseHint::Stat => "stat",
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub control: watch::Receiver<Option<ControlMessage>>,
    pub status: watch::Receiver<Option<ActuatorStatus>>,
    pub last_control: watch::Receiver<Option<Instant>>,
    pub liveness_timeout: Duration,
    pub pool: Db,
    pub water_unit_price: f64,
    pub sse: broadcast::Sender<SseHint>,
    pub sse_idle_timeout: Duration,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stat", get(api_stat))
        .route("/api/watering", get(api_watering))
        .route("/api/log_view", get(api_log_view))
        .route("/api/event", get(api_event))
        .route("/api/sysinfo", get(api_sysinfo))
        .route("/api/healthz", get(api_healthz))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// /api/stat
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatResponse {
    mode: Option<ControlMessage>,
    sensor: Option<mistcool_core::message::SenseSummary>,
    actuator: Option<ActuatorStatus>,
}

async fn api_stat(State(state): State<AppState>) -> impl IntoResponse {
    let control = state.control.borrow().clone();
    let status = state.status.borrow().clone();
    Json(StatResponse {
        sensor: control.as_ref().and_then(|m| m.sense.clone()),
        mode: control,
        actuator: status,
    })
}

// ---------------------------------------------------------------------------
// /api/watering
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WateringEntry {
    date: String,
    amount_l: f64,
    price: f64,
}

/// Today plus the prior nine days, newest first.  Day boundaries are
/// local-time midnight.
async fn api_watering(State(state): State<AppState>) -> impl IntoResponse {
    let mut watering = Vec::with_capacity(10);
    for day_before in 0..10 {
        let date = (chrono::Local::now() - chrono::Duration::days(day_before))
            .format("%Y-%m-%d")
            .to_string();
        let amount_l = match db::day_volume(&state.pool, &date).await {
            Ok(volume) => volume,
            Err(e) => {
                error!("watering query failed for {date}: {e:#}");
                return Json(serde_json::json!({ "error": e.to_string() })).into_response();
            }
        };
        watering.push(WateringEntry {
            date,
            amount_l,
            price: amount_l * state.water_unit_price / 1000.0,
        });
    }
    Json(serde_json::json!({ "watering": watering })).into_response()
}

// ---------------------------------------------------------------------------
// /api/log_view
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LogViewParams {
    #[serde(default)]
    offset: i64,
    limit: Option<i64>,
}

const LOG_VIEW_LIMIT_MAX: i64 = 500;

async fn api_log_view(
    State(state): State<AppState>,
    Query(params): Query<LogViewParams>,
) -> impl IntoResponse {
    let offset = params.offset.max(0);
    let limit = params.limit.unwrap_or(50).clamp(1, LOG_VIEW_LIMIT_MAX);
    match db::list_events(&state.pool, offset, limit).await {
        Ok(records) => Json(serde_json::json!({ "log": records })).into_response(),
        Err(e) => {
            error!("log_view query failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// /api/event (SSE)
// ---------------------------------------------------------------------------

/// SSE stream of refresh hints.  A lagging client (more than the broadcast
/// capacity of buffered hints) or an idle one (no hints within the idle
/// timeout) has its stream closed.
async fn api_event(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sse.subscribe();
    let stream = BroadcastStream::new(rx)
        .timeout(state.sse_idle_timeout)
        .take_while(|item| matches!(item, Ok(Ok(_))))
        .filter_map(|item| match item {
            Ok(Ok(hint)) => Some(Ok(Event::default().data(hint.as_str()))),
            _ => None,
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// /api/sysinfo
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SysinfoResponse {
    version: &'static str,
    build_date: &'static str,
    uptime_sec: u64,
    load_average: Option<[f64; 3]>,
}

fn load_average() -> Option<[f64; 3]> {
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    let mut parts = text.split_whitespace();
    let one = parts.next()?.parse().ok()?;
    let five = parts.next()?.parse().ok()?;
    let fifteen = parts.next()?.parse().ok()?;
    Some([one, five, fifteen])
}

async fn api_sysinfo(State(state): State<AppState>) -> impl IntoResponse {
    Json(SysinfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        build_date: option_env!("BUILD_DATE").unwrap_or("unknown"),
        uptime_sec: state.started.elapsed().as_secs(),
        load_average: load_average(),
    })
}

// ---------------------------------------------------------------------------
// /api/healthz
// ---------------------------------------------------------------------------

async fn api_healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
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

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

pub async fn serve(port: u16, state: AppState) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind web ui on {addr}: {e}");
            return;
        }
    };
    info!(%addr, "web ui listening");
    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("web ui server error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use mistcool_core::db::MetricField;
    use mistcool_core::event::{EventKind, EventRecord, LogLevel};
    use mistcool_core::message::{CoolingState, Duty, FaultClass};
    use tower::ServiceExt;

    struct TestHandles {
        control_tx: watch::Sender<Option<ControlMessage>>,
        status_tx: watch::Sender<Option<ActuatorStatus>>,
        last_control_tx: watch::Sender<Option<Instant>>,
        pool: Db,
    }

    async fn test_state() -> (AppState, TestHandles) {
        let pool = db::open_memory().await.unwrap();
        db::migrate(&pool).await.unwrap();

        let (control_tx, control) = watch::channel(None);
        let (status_tx, status) = watch::channel(None);
        let (last_control_tx, last_control) = watch::channel(None);
        let (sse, _) = broadcast::channel(64);

        let state = AppState {
            control,
            status,
            last_control,
            liveness_timeout: Duration::from_secs(30),
            pool: pool.clone(),
            water_unit_price: 250.0,
            sse,
            sse_idle_timeout: Duration::from_secs(300),
            started: Instant::now(),
        };
        (
            state,
            TestHandles {
                control_tx,
                status_tx,
                last_control_tx,
                pool,
            },
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn control_message() -> ControlMessage {
        ControlMessage {
            message_id: 12,
            ts: Utc::now(),
            mode_index: 2,
            state: CoolingState::Running,
            duty: Duty {
                enable: true,
                on_sec: 60,
                off_sec: 60,
            },
            sense: None,
        }
    }

    // -- /api/stat ----------------------------------------------------------

    #[tokio::test]
    async fn stat_is_empty_before_any_message() {
        let (state, _handles) = test_state().await;
        let (status, json) = get_json(router(state), "/api/stat").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["mode"].is_null());
        assert!(json["actuator"].is_null());
    }

    #[tokio::test]
    async fn stat_reflects_live_messages() {
        let (state, handles) = test_state().await;
        handles.control_tx.send(Some(control_message())).unwrap();
        handles
            .status_tx
            .send(Some(ActuatorStatus {
                ts: Utc::now(),
                valve_open: true,
                valve_duration_sec: 12.0,
                flow_lpm: Some(1.4),
                mode_index: 2,
                fault: FaultClass::Ok,
                last_event_id: 9,
            }))
            .unwrap();

        let (status, json) = get_json(router(state), "/api/stat").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"]["mode_index"], 2);
        assert_eq!(json["mode"]["duty"]["on_sec"], 60);
        assert_eq!(json["actuator"]["valve_open"], true);
        assert_eq!(json["actuator"]["fault"], "ok");
    }

    // -- /api/watering ------------------------------------------------------

    #[tokio::test]
    async fn watering_returns_ten_days_with_cost() {
        let (state, handles) = test_state().await;
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        db::add_metric(&handles.pool, &today, 1, MetricField::VolumeL, 8.0)
            .await
            .unwrap();

        let (status, json) = get_json(router(state), "/api/watering").await;
        assert_eq!(status, StatusCode::OK);
        let list = json["watering"].as_array().unwrap();
        assert_eq!(list.len(), 10);
        assert_eq!(list[0]["date"], today);
        assert_eq!(list[0]["amount_l"], 8.0);
        // 8 L at 250 per m^3.
        assert!((list[0]["price"].as_f64().unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(list[9]["amount_l"], 0.0);
    }

    // -- /api/log_view ------------------------------------------------------

    #[tokio::test]
    async fn log_view_pages_newest_first() {
        let (state, handles) = test_state().await;
        for id in 1..=30 {
            db::insert_event(
                &handles.pool,
                &EventRecord {
                    id,
                    ts: Utc::now(),
                    level: LogLevel::Info,
                    kind: EventKind::DutyOn,
                    message: format!("event {id}"),
                },
            )
            .await
            .unwrap();
        }

        let (status, json) =
            get_json(router(state.clone()), "/api/log_view?offset=0&limit=5").await;
        assert_eq!(status, StatusCode::OK);
        let log = json["log"].as_array().unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(log[0]["id"], 30);
        assert_eq!(log[4]["id"], 26);

        let (_, json) = get_json(router(state), "/api/log_view?offset=5&limit=5").await;
        assert_eq!(json["log"][0]["id"], 25);
    }

    #[tokio::test]
    async fn log_view_defaults_and_caps_its_limit() {
        let (state, _handles) = test_state().await;
        let (status, json) = get_json(router(state.clone()), "/api/log_view").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["log"].as_array().unwrap().is_empty());

        // An absurd limit is clamped rather than rejected.
        let (status, _) =
            get_json(router(state), "/api/log_view?offset=0&limit=100000").await;
        assert_eq!(status, StatusCode::OK);
    }

    // -- /api/event ---------------------------------------------------------

    #[tokio::test]
    async fn event_stream_responds_with_sse_headers() {
        let (state, _handles) = test_state().await;
        let resp = router(state)
            .oneshot(Request::builder().uri("/api/event").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }

    // -- /api/sysinfo -------------------------------------------------------

    #[tokio::test]
    async fn sysinfo_reports_version_and_uptime() {
        let (state, _handles) = test_state().await;
        let (status, json) = get_json(router(state), "/api/sysinfo").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["version"].is_string());
        assert!(json["uptime_sec"].is_u64());
    }

    // -- /api/healthz -------------------------------------------------------

    #[tokio::test]
    async fn healthz_degrades_without_control_traffic() {
        let (state, handles) = test_state().await;

        let resp = router(state.clone())
            .oneshot(Request::builder().uri("/api/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        handles.last_control_tx.send(Some(Instant::now())).unwrap();
        let resp = router(state)
            .oneshot(Request::builder().uri("/api/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
