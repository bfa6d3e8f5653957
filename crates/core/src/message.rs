//! Wire-level message schema shared by the controller, actuator, and web UI.
//!
//! Everything here round-trips through JSON; `ControlMessage` and
//! `ActuatorStatus` are the two bodies that cross process boundaries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic label for the control channel (controller → proxy → subscribers).
pub const CONTROL_TOPIC: &str = "cooler";

/// Topic label for the actuator status channel (actuator → web UI).
pub const STATUS_TOPIC: &str = "unit_status";

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

/// Overall posture advertised by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoolingState {
    Idle,
    Running,
    Stopping,
    Fault,
}

/// Square-wave valve drive for one cooling mode.  `enable == false` means the
/// valve is held closed regardless of `on_sec`/`off_sec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duty {
    pub enable: bool,
    pub on_sec: u32,
    pub off_sec: u32,
}

impl Duty {
    pub const OFF: Duty = Duty {
        enable: false,
        on_sec: 0,
        off_sec: 0,
    };
}

/// One sensor reading carried along for the UI (`None` value = absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenseReading {
    pub name: String,
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// Latest sensor values, embedded in each control message so the web UI can
/// render current conditions without its own TSDB access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenseSummary {
    pub temp: Option<SenseReading>,
    pub humi: Option<SenseReading>,
    pub lux: Option<SenseReading>,
    pub solar_rad: Option<SenseReading>,
    pub rain: Option<SenseReading>,
    #[serde(default)]
    pub power: Vec<SenseReading>,
}

/// Controller → actuator control message.  Published on every tick as a
/// heartbeat even when nothing changed; `message_id` increases per send and
/// receivers must discard older ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub message_id: u64,
    pub ts: DateTime<Utc>,
    pub mode_index: u16,
    pub state: CoolingState,
    pub duty: Duty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sense: Option<SenseSummary>,
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialize control message")
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse control message")
    }

    /// Ordering guarantee: apply only messages newer than the last applied id.
    pub fn is_newer_than(&self, last_applied: Option<u64>) -> bool {
        match last_applied {
            Some(id) => self.message_id > id,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator status channel
// ---------------------------------------------------------------------------

/// Fault classification reported by the actuator's fault detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    Ok,
    NoFlowWhileOpen,
    FlowWhileClosed,
    Unstable,
}

impl FaultClass {
    /// Faults that force SAFE mode (valve closed, duty disabled).
    pub fn is_hazard(self) -> bool {
        matches!(self, FaultClass::NoFlowWhileOpen | FaultClass::FlowWhileClosed)
    }
}

/// Actuator → web UI status message, published every monitor tick so the UI
/// can fan out SSE hints without polling the actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorStatus {
    pub ts: DateTime<Utc>,
    pub valve_open: bool,
    pub valve_duration_sec: f64,
    pub flow_lpm: Option<f64>,
    pub mode_index: u16,
    pub fault: FaultClass,
    pub last_event_id: i64,
}

impl ActuatorStatus {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialize actuator status")
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse actuator status")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
