//! Web UI entry point: subscribes to the control stream (via the cache
//! proxy) and the actuator's status channel, opens a read-only view of the
//! actuator's database, and serves the REST/SSE surface.

mod web;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use mistcool_core::args::{self, RoleArgs};
use mistcool_core::config::Config;
use mistcool_core::db;
use mistcool_core::message::{ActuatorStatus, ControlMessage, CONTROL_TOPIC, STATUS_TOPIC};
use mistcool_core::pubsub::Subscription;

use web::SseHint;

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
        error!("web ui failed: {e:#}");
        std::process::exit(args::EXIT_RUNTIME);
    }
}

async fn run(cli: RoleArgs, config: Config) -> Result<()> {
    let pool = db::open_ro(&config.webui.db_path)
        .await
        .context("is the actuator running? its database must exist")?;

    let (control_tx, control_rx) = watch::channel(None::<ControlMessage>);
    let (status_tx, status_rx) = watch::channel(None::<ActuatorStatus>);
    let (last_control_tx, last_control_rx) = watch::channel(None::<Instant>);
    let (sse_tx, _) = broadcast::channel::<SseHint>(config.webui.sse_queue_max);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Control subscription: stat hints ────────────────────────────
    let control_addr = format!(
        "{}:{}",
        config.webui.control_host, config.webui.subscribe_port
    );
    let control_sub = Subscription::connect(control_addr.clone(), CONTROL_TOPIC.to_string());
    info!(addr = %control_addr, "subscribing to control messages");

    let control_worker = {
        let mut raw_rx = control_sub.messages();
        let sse = sse_tx.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = raw_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let raw = raw_rx.borrow_and_update().clone();
                        let Some(raw) = raw else { continue };
                        match ControlMessage::from_json(&raw.body) {
                            Ok(message) => {
                                let _ = last_control_tx.send(Some(raw.received));
                                let _ = control_tx.send(Some(message));
                                let _ = sse.send(SseHint::Stat);
                            }
                            Err(e) => warn!("discarding bad control message: {e:#}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    // ── Status subscription: log hints on new event ids ─────────────
    let status_addr = format!(
        "{}:{}",
        config.webui.actuator_host, config.webui.status_port
    );
    let status_sub = Subscription::connect(status_addr.clone(), STATUS_TOPIC.to_string());
    info!(addr = %status_addr, "subscribing to actuator status");

    let status_worker = {
        let mut raw_rx = status_sub.messages();
        let sse = sse_tx.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut last_event_id: Option<i64> = None;
            loop {
                tokio::select! {
                    changed = raw_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let raw = raw_rx.borrow_and_update().clone();
                        let Some(raw) = raw else { continue };
                        match ActuatorStatus::from_json(&raw.body) {
                            Ok(status) => {
                                if last_event_id.is_some_and(|id| status.last_event_id > id) {
                                    let _ = sse.send(SseHint::Log);
                                }
                                last_event_id = Some(status.last_event_id);
                                let _ = status_tx.send(Some(status));
                            }
                            Err(e) => warn!("discarding bad status message: {e:#}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    // ── HTTP server ─────────────────────────────────────────────────
    let port = cli.port.unwrap_or(config.webui.port);
    let state = web::AppState {
        control: control_rx,
        status: status_rx,
        last_control: last_control_rx,
        liveness_timeout: config.liveness_timeout(),
        pool: pool.clone(),
        water_unit_price: config.webui.water_unit_price,
        sse: sse_tx,
        sse_idle_timeout: Duration::from_secs(config.webui.sse_idle_timeout_sec),
        started: Instant::now(),
    };
    let server = tokio::spawn(web::serve(port, state));

    // ── Wait for a signal ───────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    warn!(signal = exit_reason, "shutting down");

    control_sub.stop().await;
    status_sub.stop().await;
    let _ = shutdown_tx.send(true);
    let _ = control_worker.await;
    let _ = status_worker.await;
    server.abort();
    pool.close().await;

    info!("shutdown complete");
    Ok(())
}
