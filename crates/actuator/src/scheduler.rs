//! Duty scheduler: turns the stream of control messages into valve
//! commands.
//!
//! One task owns the valve driver, so command emission order is exactly the
//! order of message acceptance and phase-timer fires.  Phase deadlines live
//! on the monotonic clock; the cycle phase is preserved across messages that
//! keep the same `(on_sec, off_sec)` tuple and reset (starting with an ON
//! phase) when the tuple changes.  SAFE demotion and shutdown preempt the
//! phase timer and force a final close.

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info};

use mistcool_core::event::{EventKind, LogLevel};
use mistcool_core::message::{ControlMessage, CoolingState, Duty};

use crate::event_log::EventLog;
use crate::fault::{HardwareReport, SafeState};
use crate::valve::{ValveDriver, ValveObservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    On { until: Instant },
    Off { until: Instant },
}

impl Phase {
    fn deadline(self) -> Option<Instant> {
        match self {
            Phase::Idle => None,
            Phase::On { until } | Phase::Off { until } => Some(until),
        }
    }
}

pub struct Scheduler {
    driver: ValveDriver,
    events: EventLog,
    valve_tx: watch::Sender<ValveObservation>,
    reports: mpsc::UnboundedSender<HardwareReport>,

    last_applied: Option<u64>,
    last_message: Option<ControlMessage>,
    active_duty: Option<(u32, u32)>,
    phase: Phase,
    prev_mode: Option<u16>,
}

impl Scheduler {
    pub fn new(
        driver: ValveDriver,
        events: EventLog,
        valve_tx: watch::Sender<ValveObservation>,
        reports: mpsc::UnboundedSender<HardwareReport>,
    ) -> Scheduler {
        Scheduler {
            driver,
            events,
            valve_tx,
            reports,
            last_applied: None,
            last_message: None,
            active_duty: None,
            phase: Phase::Idle,
            prev_mode: None,
        }
    }

    pub async fn run(
        mut self,
        mut control_rx: watch::Receiver<Option<ControlMessage>>,
        mut safe_rx: watch::Receiver<SafeState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("duty scheduler started");

        loop {
            let deadline = self.phase.deadline();
            let timer = async move {
                match deadline {
                    Some(until) => sleep_until(until).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                changed = control_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let message = control_rx.borrow_and_update().clone();
                    if let Some(message) = message {
                        let safe = *safe_rx.borrow();
                        self.accept(message, safe).await;
                    }
                }

                changed = safe_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let safe = *safe_rx.borrow_and_update();
                    self.on_safe_change(safe).await;
                }

                _ = timer => {
                    self.on_phase_deadline().await;
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Final command on every exit path.
        self.set_valve(false, "cooling stopped, valve closed").await;
        info!("duty scheduler stopped");
    }

    /// Apply a newly received control message; older ids are discarded.
    async fn accept(&mut self, message: ControlMessage, safe: SafeState) {
        if !message.is_newer_than(self.last_applied) {
            debug!(
                message_id = message.message_id,
                "out-of-order control message ignored"
            );
            return;
        }
        self.last_applied = Some(message.message_id);

        if self.prev_mode != Some(message.mode_index) {
            let before = self
                .prev_mode
                .map(|m| m.to_string())
                .unwrap_or_else(|| "init".to_string());
            self.events.append(
                LogLevel::Info,
                EventKind::ModeChange,
                format!("cooling mode changed ({before} -> {})", message.mode_index),
            );
            self.prev_mode = Some(message.mode_index);
        }

        self.last_message = Some(message.clone());
        self.apply(&message, safe).await;
    }

    async fn apply(&mut self, message: &ControlMessage, safe: SafeState) {
        if safe.engaged {
            // SAFE posture: the message is remembered but the valve stays
            // closed until the latch releases.
            self.freeze("valve held closed (safe mode)").await;
            return;
        }

        let stopping = matches!(
            message.state,
            CoolingState::Stopping | CoolingState::Fault
        );
        if stopping || !message.duty.enable {
            self.freeze("cooling stopped, valve closed").await;
            return;
        }

        let tuple = (message.duty.on_sec, message.duty.off_sec);
        if self.active_duty == Some(tuple) && self.phase != Phase::Idle {
            // Same cycle: the phase is preserved, nothing to do.
            return;
        }

        self.start_cycle(message.duty).await;
    }

    /// Begin a fresh cycle, always with an ON phase.
    async fn start_cycle(&mut self, duty: Duty) {
        self.active_duty = Some((duty.on_sec, duty.off_sec));
        self.set_valve(true, "valve opened (on phase)").await;
        self.phase = Phase::On {
            until: Instant::now() + Duration::from_secs(u64::from(duty.on_sec)),
        };
    }

    /// Cancel any pending phase deadline and hold the valve closed.
    async fn freeze(&mut self, note: &str) {
        self.phase = Phase::Idle;
        self.active_duty = None;
        self.set_valve(false, note).await;
    }

    async fn on_safe_change(&mut self, safe: SafeState) {
        if safe.engaged {
            info!(fault = ?safe.fault, "safe mode engaged");
            self.freeze("safe mode: valve forced closed, duty disabled").await;
        } else if let Some(message) = self.last_message.clone() {
            info!("safe mode released, re-applying last control message");
            self.apply(&message, safe).await;
        }
    }

    async fn on_phase_deadline(&mut self) {
        let Some((on_sec, off_sec)) = self.active_duty else {
            self.phase = Phase::Idle;
            return;
        };
        match self.phase {
            Phase::On { .. } => {
                self.set_valve(false, "valve closed (off phase)").await;
                self.phase = Phase::Off {
                    until: Instant::now() + Duration::from_secs(u64::from(off_sec)),
                };
            }
            Phase::Off { .. } => {
                self.set_valve(true, "valve opened (on phase)").await;
                self.phase = Phase::On {
                    until: Instant::now() + Duration::from_secs(u64::from(on_sec)),
                };
            }
            Phase::Idle => {}
        }
    }

    async fn set_valve(&mut self, open: bool, note: &str) {
        let was_open = self.driver.is_open();
        match self.driver.set(open).await {
            Ok(report) => {
                if was_open != open {
                    let _ = self.valve_tx.send(ValveObservation {
                        open,
                        since: Instant::now(),
                    });
                    let kind = if open { EventKind::DutyOn } else { EventKind::DutyOff };
                    self.events.append(LogLevel::Info, kind, note);
                }
                if report.mismatch() {
                    let _ = self
                        .reports
                        .send(HardwareReport::EchoMismatch { commanded: open });
                }
            }
            Err(e) => {
                error!("valve command failed: {e:#}");
                let _ = self.reports.send(HardwareReport::WriteFailed {
                    commanded: open,
                    error: format!("{e:#}"),
                });
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
