//! Controller entry point: queries the TSDB every tick, runs the mode
//! decider, and publishes a control message as a heartbeat even when the
//! mode is unchanged.  The last-value-caching proxy runs here as well,
//! re-publishing on its own port for late-joining subscribers.
//!
//! Safety features:
//! - Publish failures are logged and never block the tick
//! - Absent sensor windows hold the previous mode only briefly, then force
//!   mode 0
//! - A final `stopping` message with duty disabled goes out on shutdown
//! - `/api/healthz` reports 503 when the tick loop stalls

mod decider;
mod sensor;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use mistcool_core::args::{self, RoleArgs};
use mistcool_core::config::Config;
use mistcool_core::message::{ControlMessage, CoolingState, Duty, CONTROL_TOPIC};
use mistcool_core::pubsub::{Proxy, Publisher};

use decider::Decider;
use sensor::TsdbClient;

/// Budget for one tick's worth of TSDB reads.
const FETCH_BUDGET: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = RoleArgs::parse();
    args::init_logging(cli.debug);

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("config error: {e:#}");
            std::process::exit(args::EXIT_CONFIG);
        }
    };

    if let Err(e) = run(cli, config).await {
        error!("controller failed: {e:#}");
        std::process::exit(args::EXIT_RUNTIME);
    }
}

async fn run(cli: RoleArgs, config: Config) -> Result<()> {
    let dummy_mode = cli.dummy_mode();
    if dummy_mode {
        warn!("DUMMY mode: sensor data is synthetic");
    }

    let publish_port = cli.port.unwrap_or(config.controller.publish_port);
    let interval = Duration::from_secs(config.controller.interval_sec);

    // ── Publisher + cache proxy ─────────────────────────────────────
    let publisher = Publisher::bind(&format!("0.0.0.0:{publish_port}"))
        .await
        .context("failed to start publisher")?;
    info!(port = publish_port, "publisher ready");

    let proxy = Proxy::start(
        format!("127.0.0.1:{publish_port}"),
        &format!("0.0.0.0:{}", config.controller.proxy_port),
        CONTROL_TOPIC.to_string(),
    )
    .await
    .context("failed to start cache proxy")?;

    // ── Healthz ─────────────────────────────────────────────────────
    let (tick_tx, tick_rx) = watch::channel(Instant::now());
    let health = tokio::spawn(serve_healthz(
        config.controller.web_port,
        tick_rx,
        interval * 3,
    ));

    // ── TSDB client + decider ───────────────────────────────────────
    let tsdb = if dummy_mode {
        None
    } else {
        Some(TsdbClient::new(&config.controller.tsdb)?)
    };
    let mut decider = Decider::new(&config.controller);
    let mut message_id: u64 = 0;

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // ── Tick loop ───────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        interval_sec = config.controller.interval_sec,
        "controller started"
    );

    let exit_reason: &str;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let window = fetch_window(&config, tsdb.as_ref(), dummy_mode).await;
                let decision = decider.tick(window.as_ref());

                message_id += 1;
                let message = ControlMessage {
                    message_id,
                    ts: Utc::now(),
                    mode_index: decision.mode_index,
                    state: decision.state,
                    duty: decision.duty,
                    sense: window.as_ref().map(|w| w.to_summary()),
                };

                match message.to_json() {
                    Ok(body) => {
                        if let Err(e) = publisher.publish(CONTROL_TOPIC, &body).await {
                            warn!("publish failed: {e:#}");
                        }
                    }
                    Err(e) => warn!("could not encode control message: {e:#}"),
                }

                let _ = tick_tx.send(Instant::now());
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown: final stopping message, then teardown ────
    warn!(signal = exit_reason, "shutting down");

    message_id += 1;
    let stopping = ControlMessage {
        message_id,
        ts: Utc::now(),
        mode_index: 0,
        state: CoolingState::Stopping,
        duty: Duty::OFF,
        sense: None,
    };
    if let Ok(body) = stopping.to_json() {
        if let Err(e) = publisher.publish(CONTROL_TOPIC, &body).await {
            warn!("final stopping publish failed: {e:#}");
        }
    }
    // Let the proxy relay the final message before the sockets go away.
    tokio::time::sleep(Duration::from_millis(200)).await;

    publisher.shutdown().await;
    proxy.stop().await;
    health.abort();

    info!("shutdown complete");
    Ok(())
}

/// Fetch a sensor window within the per-tick budget.  Returns `None` for an
/// absent or invalid window so the decider can apply its stale handling.
async fn fetch_window(
    config: &Config,
    tsdb: Option<&TsdbClient>,
    dummy_mode: bool,
) -> Option<sensor::SensorWindow> {
    if dummy_mode {
        return Some(sensor::dummy_window(&config.controller.sensor));
    }
    let client = tsdb?;

    let window =
        match tokio::time::timeout(FETCH_BUDGET, client.fetch_window(&config.controller.sensor))
            .await
        {
            Ok(window) => window,
            Err(_) => {
                warn!("sensor fetch exceeded the per-tick budget");
                return None;
            }
        };

    let stale = Duration::from_secs(config.controller.decision.stale_threshold_sec);
    if window.is_valid(stale, Utc::now()) {
        Some(window)
    } else {
        warn!("sensor window is stale or incomplete");
        None
    }
}

// ---------------------------------------------------------------------------
// Healthz
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HealthState {
    last_tick: watch::Receiver<Instant>,
    max_age: Duration,
}

fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/api/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.last_tick.borrow().elapsed() <= state.max_age {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "tick loop stalled")
    }
}

async fn serve_healthz(port: u16, last_tick: watch::Receiver<Instant>, max_age: Duration) {
    let state = HealthState { last_tick, max_age };
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind healthz on {addr}: {e}");
            return;
        }
    };
    info!(%addr, "healthz listening");
    if let Err(e) = axum::serve(listener, health_router(state)).await {
        error!("healthz server error: {e}");
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
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_ok_when_ticking() {
        let (_tx, rx) = watch::channel(Instant::now());
        let app = health_router(HealthState {
            last_tick: rx,
            max_age: Duration::from_secs(30),
        });

        let resp = app
            .oneshot(Request::builder().uri("/api/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn healthz_degrades_when_ticks_stop() {
        let (_tx, rx) = watch::channel(Instant::now());
        let app = health_router(HealthState {
            last_tick: rx,
            max_age: Duration::from_secs(30),
        });

        tokio::time::advance(Duration::from_secs(31)).await;

        let resp = app
            .oneshot(Request::builder().uri("/api/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
