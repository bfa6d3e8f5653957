//! Actuator entry point: subscribes to the controller's control stream and
//! drives the mist valve.
//!
//! Workers: control subscriber (with liveness watchdog), duty scheduler
//! (sole owner of the valve driver), flow sampler, monitor (fault detection,
//! metrics, status channel), event-log writer, storage maintenance, and a
//! small local web surface.
//!
//! Safety features:
//! - SIGTERM/SIGINT → scheduler emits a final CLOSE before exit
//! - Publisher silence beyond the liveness timeout → SAFE mode
//! - Hardware faults (no water, leak, stuck valve) → SAFE mode + notification
//! - Event/metrics retention pruning and periodic vacuum

mod event_log;
mod fault;
mod flow;
mod scheduler;
mod valve;
mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use mistcool_core::args::{self, RoleArgs};
use mistcool_core::config::Config;
use mistcool_core::db;
use mistcool_core::event::{EventKind, LogLevel};
use mistcool_core::message::{ControlMessage, CONTROL_TOPIC};
use mistcool_core::notify::{self, RateLimited};
use mistcool_core::pubsub::{Publisher, Subscription};

use event_log::EventLog;
use fault::SafeLatch;
use flow::{DummyFlowSensor, FlowEstimate, FlowSensor};
use scheduler::Scheduler;
use valve::{ValveDriver, ValveObservation};

/// Delay before the first maintenance pass after startup.
const MAINTENANCE_STARTUP_DELAY: Duration = Duration::from_secs(60);

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
        error!("actuator failed: {e:#}");
        std::process::exit(args::EXIT_RUNTIME);
    }
}

fn make_flow_sensor(
    config: &Config,
    dummy_mode: bool,
    valve_rx: watch::Receiver<ValveObservation>,
) -> Result<Box<dyn FlowSensor>> {
    #[cfg(feature = "gpio")]
    if !dummy_mode {
        let sensor = flow::analog::AnalogFlowSensor::new(&config.actuator.flow)
            .context("failed to open the flow sensor")?;
        return Ok(Box::new(sensor));
    }
    #[cfg(not(feature = "gpio"))]
    if !dummy_mode {
        warn!("built without the gpio feature, using the mock flow sensor");
    }
    let _ = config;
    Ok(Box::new(DummyFlowSensor::new(valve_rx)))
}

async fn run(cli: RoleArgs, config: Config) -> Result<()> {
    let dummy_mode = cli.dummy_mode();
    if dummy_mode {
        warn!("DUMMY mode: no hardware access");
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(parent) = std::path::Path::new(&config.actuator.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let pool = db::open_rw(&config.actuator.db_path).await?;
    db::migrate(&pool).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (log_shutdown_tx, log_shutdown_rx) = watch::channel(false);

    let hostname = std::env::var("NODE_HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "actuator".to_string());

    let (events, log_writer) =
        EventLog::open(pool.clone(), &config.actuator.storage, log_shutdown_rx).await?;
    events.append(
        LogLevel::Info,
        EventKind::Start,
        format!("actuator started on {hostname}"),
    );

    // ── Shared state channels ───────────────────────────────────────
    let (safe, safe_rx) = SafeLatch::new();
    let (valve_tx, valve_rx) = watch::channel(ValveObservation::closed_now());
    let (control_tx, control_rx) = watch::channel(None::<ControlMessage>);
    let (last_control_tx, last_control_rx) = watch::channel(None::<Instant>);
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let (estimate_tx, estimate_rx) = watch::channel(FlowEstimate::idle());

    // ── Control subscription + parser ───────────────────────────────
    let control_addr = format!(
        "{}:{}",
        config.actuator.control_host, config.actuator.subscribe_port
    );
    let subscription = Subscription::connect(control_addr.clone(), CONTROL_TOPIC.to_string());
    info!(addr = %control_addr, "subscribing to control messages");

    let parser = {
        let mut raw_rx = subscription.messages();
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
                            }
                            // A single bad message never takes the scheduler
                            // down; control continues from the last valid one.
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

    // ── Liveness watchdog ───────────────────────────────────────────
    let watchdog = {
        let liveness_timeout = config.liveness_timeout();
        let last_control_rx = last_control_rx.clone();
        let safe = Arc::clone(&safe);
        let events = events.clone();
        let mut shutdown = shutdown_rx.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut lost = false;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let last = last_control_rx.borrow().unwrap_or(started);
                        let stale = last.elapsed() > liveness_timeout;
                        if stale && !lost {
                            lost = true;
                            events.append(
                                LogLevel::Err,
                                EventKind::Fault,
                                format!(
                                    "no control messages for {} s, entering safe mode",
                                    liveness_timeout.as_secs()
                                ),
                            );
                            safe.set_publisher_lost(true);
                        } else if !stale && lost {
                            lost = false;
                            events.append(
                                LogLevel::Info,
                                EventKind::Recover,
                                "control messages resumed",
                            );
                            safe.set_publisher_lost(false);
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

    // ── Scheduler (sole valve owner) ────────────────────────────────
    let driver = ValveDriver::new(&config.actuator.valve, dummy_mode)?;
    let scheduler_task = tokio::spawn(
        Scheduler::new(driver, events.clone(), valve_tx, reports_tx).run(
            control_rx.clone(),
            safe_rx.clone(),
            shutdown_rx.clone(),
        ),
    );

    // ── Flow sampler ────────────────────────────────────────────────
    let sensor = make_flow_sensor(&config, dummy_mode, valve_rx.clone())?;
    let sampler_task = tokio::spawn(flow::run_sampler(
        sensor,
        config.actuator.flow.clone(),
        valve_rx.clone(),
        estimate_tx,
        shutdown_rx.clone(),
    ));

    // ── Monitor: faults, metrics, status channel ────────────────────
    let status_publisher = Publisher::bind(&format!("0.0.0.0:{}", config.actuator.status_port))
        .await
        .context("failed to bind the status publisher")?;
    info!(port = config.actuator.status_port, "status channel ready");

    let notifier = RateLimited::new(
        notify::from_config(&config.actuator.notify),
        Duration::from_secs(config.actuator.notify.interval_min * 60),
    );
    let monitor_task = tokio::spawn(fault::run_monitor(fault::MonitorDeps {
        flow_config: config.actuator.flow.clone(),
        interval: Duration::from_secs_f64(config.actuator.monitor_interval_sec),
        valve_rx: valve_rx.clone(),
        estimate_rx: estimate_rx.clone(),
        control_rx: control_rx.clone(),
        reports_rx,
        safe: Arc::clone(&safe),
        events: events.clone(),
        pool: pool.clone(),
        status: status_publisher,
        notifier,
        shutdown: shutdown_rx.clone(),
    }));

    // ── Storage maintenance ─────────────────────────────────────────
    let maintenance = {
        let pool = pool.clone();
        let retention_days = config.actuator.storage.retention_days;
        let interval =
            Duration::from_secs(config.actuator.storage.vacuum_interval_hours * 3600);
        tokio::spawn(async move {
            tokio::time::sleep(MAINTENANCE_STARTUP_DELAY).await;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match db::prune_events(&pool, retention_days).await {
                    Ok(n) if n > 0 => info!(deleted = n, "pruned old events"),
                    Ok(_) => {}
                    Err(e) => error!("event pruning failed: {e:#}"),
                }
                match db::prune_metrics(&pool, retention_days).await {
                    Ok(n) if n > 0 => info!(deleted = n, "pruned old metrics"),
                    Ok(_) => {}
                    Err(e) => error!("metrics pruning failed: {e:#}"),
                }
                if let Err(e) = db::vacuum(&pool).await {
                    error!("vacuum failed: {e:#}");
                }
            }
        })
    };

    // ── Local web surface ───────────────────────────────────────────
    let web_port = cli.port.unwrap_or(config.actuator.web_port);
    let web_task = tokio::spawn(web::serve(
        web_port,
        web::AppState {
            last_control: last_control_rx,
            liveness_timeout: config.liveness_timeout(),
            valve: valve_rx,
            estimate: estimate_rx,
            safe: safe_rx,
        },
    ));

    // ── Wait for a signal ───────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    warn!(signal = exit_reason, "shutting down");

    // ── Ordered teardown ────────────────────────────────────────────
    subscription.stop().await;
    let _ = shutdown_tx.send(true);

    let _ = parser.await;
    let _ = watchdog.await;
    let _ = scheduler_task.await; // emits the final CLOSE
    let _ = sampler_task.await;
    let _ = monitor_task.await;
    maintenance.abort();
    web_task.abort();

    events.append(
        LogLevel::Info,
        EventKind::Stop,
        format!("actuator stopped on {hostname}"),
    );
    events.flush().await;
    let _ = log_shutdown_tx.send(true);
    let _ = log_writer.await;
    pool.close().await;

    info!("shutdown complete");
    Ok(())
}
