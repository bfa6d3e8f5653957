//! Event-log record types.  Records are append-only with strictly increasing
//! ids; the actuator owns the single writer, everything else reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Err,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Err => "err",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "err" => Some(LogLevel::Err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ModeChange,
    DutyOn,
    DutyOff,
    Fault,
    Recover,
    Start,
    Stop,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ModeChange => "mode_change",
            EventKind::DutyOn => "duty_on",
            EventKind::DutyOff => "duty_off",
            EventKind::Fault => "fault",
            EventKind::Recover => "recover",
            EventKind::Start => "start",
            EventKind::Stop => "stop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mode_change" => Some(EventKind::ModeChange),
            "duty_on" => Some(EventKind::DutyOn),
            "duty_off" => Some(EventKind::DutyOff),
            "fault" => Some(EventKind::Fault),
            "recover" => Some(EventKind::Recover),
            "start" => Some(EventKind::Start),
            "stop" => Some(EventKind::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub kind: EventKind,
    pub message: String,
}

// ===========================================================================
// Tests
// ===========================================================================
