//! TOML configuration shared by all three roles.
//!
//! The file is parsed once at startup into an immutable typed tree.  Missing
//! required fields (TSDB url, sensor lists, mode table, database path) are a
//! fatal error; tunables carry the defaults documented on each field.
//! Unknown keys are rejected so typos fail fast instead of silently falling
//! back to defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::message::Duty;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub controller: ControllerConfig,
    pub actuator: ActuatorConfig,
    pub webui: WebUiConfig,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Control tick and publish heartbeat period.
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,
    #[serde(default = "default_publish_port")]
    pub publish_port: u16,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Healthz port for the controller process.
    #[serde(default = "default_controller_web_port")]
    pub web_port: u16,
    pub tsdb: TsdbConfig,
    pub sensor: SensorSetConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    /// Mode-indexed duty table; index 0 must be the disabled "no cooling"
    /// entry.
    pub modes: Vec<ModeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TsdbConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorItemConfig {
    pub name: String,
    pub measure: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorSetConfig {
    pub temp: Vec<SensorItemConfig>,
    pub humi: Vec<SensorItemConfig>,
    pub lux: Vec<SensorItemConfig>,
    pub solar_rad: Vec<SensorItemConfig>,
    pub rain: Vec<SensorItemConfig>,
    /// One entry per monitored air conditioner.
    pub power: Vec<SensorItemConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DecisionConfig {
    pub thresholds: Thresholds,
    /// Consecutive ticks a higher mode must hold before it is emitted.
    pub up_debounce_ticks: u32,
    /// Consecutive ticks a lower mode must hold (longer, to avoid flapping).
    pub down_debounce_ticks: u32,
    /// How many ticks an absent sensor window may reuse the previous mode.
    pub stale_keep_ticks: u32,
    /// A reading older than this makes its metric invalid.
    pub stale_threshold_sec: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        DecisionConfig {
            thresholds: Thresholds::default(),
            up_debounce_ticks: 3,
            down_debounce_ticks: 6,
            stale_keep_ticks: 3,
            stale_threshold_sec: 300,
        }
    }
}

/// Decision thresholds, mirroring the deployed defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Thresholds {
    /// Below this outdoor temperature the A/C cannot be cooling.
    pub temp_cooling: f64,
    pub power_work: f64,
    pub power_normal: f64,
    pub power_full: f64,
    /// Rain rate (mm/h) above which cooling stops immediately.
    pub rain_max: f64,
    /// Humidity (%) above which cooling stops immediately.
    pub humi_max: f64,
    pub temp_high_h: f64,
    pub temp_high_l: f64,
    pub temp_mid: f64,
    pub solar_rad_daytime: f64,
    pub solar_rad_high: f64,
    pub solar_rad_low: f64,
    pub lux_low: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            temp_cooling: 28.0,
            power_work: 50.0,
            power_normal: 500.0,
            power_full: 900.0,
            rain_max: 1.0,
            humi_max: 96.0,
            temp_high_h: 35.0,
            temp_high_l: 32.0,
            temp_mid: 29.0,
            solar_rad_daytime: 200.0,
            solar_rad_high: 700.0,
            solar_rad_low: 100.0,
            lux_low: 500.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeConfig {
    pub enable: bool,
    pub on_sec: u32,
    pub off_sec: u32,
}

impl ModeConfig {
    pub fn duty(&self) -> Duty {
        Duty {
            enable: self.enable,
            on_sec: self.on_sec,
            off_sec: self.off_sec,
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActuatorConfig {
    #[serde(default = "default_localhost")]
    pub control_host: String,
    #[serde(default = "default_proxy_port")]
    pub subscribe_port: u16,
    /// Port for the actuator's own status channel.
    #[serde(default = "default_status_port")]
    pub status_port: u16,
    #[serde(default = "default_actuator_web_port")]
    pub web_port: u16,
    /// SQLite file holding events and daily metrics.
    pub db_path: String,
    #[serde(default = "default_monitor_interval_sec")]
    pub monitor_interval_sec: f64,
    #[serde(default)]
    pub valve: ValveConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ValveConfig {
    /// BCM pin driving the solenoid relay.
    pub pin: u8,
    /// Optional sense line echoing the commanded level.
    pub echo_pin: Option<u8>,
}

impl Default for ValveConfig {
    fn default() -> Self {
        ValveConfig {
            pin: 17,
            echo_pin: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FlowConfig {
    pub sample_hz: f64,
    /// Trailing smoothing window.
    pub window_sec: f64,
    /// Below this mean while OPEN: supply valve is shut upstream.
    pub min_flow_lpm: f64,
    /// Above this mean while CLOSED: the solenoid leaks.
    pub leak_threshold_lpm: f64,
    /// stddev/mean ratio above which the signal counts as unstable.
    pub noise_ratio: f64,
    pub grace_open_sec: f64,
    pub grace_close_sec: f64,
    pub unstable_sec: f64,
    pub recover_hold_sec: f64,
    /// Seconds after which a hazard fault auto-clears; 0 = manual clear only.
    pub auto_recover_sec: u64,
    /// Power the sensor down after the valve has been closed this long with
    /// zero flow.
    pub power_off_sec: f64,
    /// ADS1115 address/channel and scale for the analog flow sensor (`gpio`
    /// builds only).
    pub i2c_addr: u16,
    pub adc_channel: u8,
    pub lpm_per_count: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            sample_hz: 10.0,
            window_sec: 3.0,
            min_flow_lpm: 0.2,
            leak_threshold_lpm: 0.1,
            noise_ratio: 0.5,
            grace_open_sec: 5.0,
            grace_close_sec: 3.0,
            unstable_sec: 10.0,
            recover_hold_sec: 15.0,
            auto_recover_sec: 1800,
            power_off_sec: 600.0,
            i2c_addr: 0x48,
            adc_channel: 0,
            lpm_per_count: 0.000_5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub retention_days: i64,
    pub vacuum_interval_hours: u64,
    /// In-process ring mirrors this many recent event records.
    pub ring_size: usize,
    /// Bounded queue in front of the single SQLite writer.
    pub write_queue_max: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            retention_days: 400,
            vacuum_interval_hours: 24,
            ring_size: 1000,
            write_queue_max: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NotifyConfig {
    pub slack_webhook_url: Option<String>,
    pub interval_min: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            slack_webhook_url: None,
            interval_min: default_notify_interval_min(),
        }
    }
}

// ---------------------------------------------------------------------------
// Web UI
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebUiConfig {
    #[serde(default = "default_webui_port")]
    pub port: u16,
    #[serde(default = "default_localhost")]
    pub control_host: String,
    #[serde(default = "default_proxy_port")]
    pub subscribe_port: u16,
    #[serde(default = "default_localhost")]
    pub actuator_host: String,
    #[serde(default = "default_status_port")]
    pub status_port: u16,
    /// Read-only view of the actuator's SQLite file.
    pub db_path: String,
    /// Water price per cubic metre, for the watering cost readout.
    #[serde(default)]
    pub water_unit_price: f64,
    #[serde(default = "default_sse_queue_max")]
    pub sse_queue_max: usize,
    #[serde(default = "default_sse_idle_timeout_sec")]
    pub sse_idle_timeout_sec: u64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_interval_sec() -> u64 {
    10
}
fn default_publish_port() -> u16 {
    2222
}
fn default_proxy_port() -> u16 {
    2223
}
fn default_status_port() -> u16 {
    2224
}
fn default_controller_web_port() -> u16 {
    5001
}
fn default_actuator_web_port() -> u16 {
    5002
}
fn default_webui_port() -> u16 {
    5000
}
fn default_localhost() -> String {
    "localhost".to_string()
}
fn default_monitor_interval_sec() -> f64 {
    1.0
}
fn default_notify_interval_min() -> u64 {
    30
}
fn default_sse_queue_max() -> usize {
    64
}
fn default_sse_idle_timeout_sec() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Load + validate
// ---------------------------------------------------------------------------

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `HEMS_SERVER_HOST` points subscribers at a non-local controller.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HEMS_SERVER_HOST") {
            if !host.is_empty() {
                self.actuator.control_host = host.clone();
                self.webui.control_host = host;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.interval_sec == 0 {
            bail!("controller.interval_sec must be positive");
        }
        if c.modes.is_empty() {
            bail!("controller.modes must list at least mode 0");
        }
        if c.modes[0].enable {
            bail!("controller.modes[0] is the no-cooling mode and must have enable = false");
        }
        for (i, mode) in c.modes.iter().enumerate() {
            if mode.enable && (mode.on_sec == 0 || mode.off_sec == 0) {
                bail!("controller.modes[{i}]: enabled modes need on_sec and off_sec > 0");
            }
        }
        if c.sensor.temp.is_empty() || c.sensor.power.is_empty() {
            bail!("controller.sensor.temp and controller.sensor.power must not be empty");
        }
        if self.actuator.flow.sample_hz <= 0.0 || self.actuator.flow.window_sec <= 0.0 {
            bail!("actuator.flow.sample_hz and window_sec must be positive");
        }
        Ok(())
    }

    /// Highest configured mode index.
    pub fn max_mode(&self) -> u16 {
        (self.controller.modes.len() - 1) as u16
    }

    /// Duty looked up from the mode table, clamped to the table length.
    pub fn duty_for_mode(&self, mode_index: u16) -> Duty {
        let idx = usize::from(mode_index).min(self.controller.modes.len() - 1);
        self.controller.modes[idx].duty()
    }

    /// Subscriber liveness window: 3 publish intervals of silence.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.interval_sec * 3)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"
[controller]
[controller.tsdb]
url = "http://tsdb.example:8086"

[controller.sensor]
temp = [{ name = "outdoor", measure = "env", hostname = "roof" }]
humi = [{ name = "outdoor", measure = "env", hostname = "roof" }]
lux = [{ name = "outdoor", measure = "env", hostname = "roof" }]
solar_rad = [{ name = "outdoor", measure = "env", hostname = "roof" }]
rain = [{ name = "gauge", measure = "env", hostname = "roof" }]
power = [{ name = "aircon-1", measure = "power", hostname = "meter" }]

[[controller.modes]]
enable = false
on_sec = 0
off_sec = 0

[[controller.modes]]
enable = true
on_sec = 60
off_sec = 120

[actuator]
db_path = "data/mistcool.db"

[webui]
db_path = "data/mistcool.db"
"#;

    fn parse(toml_str: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.controller.interval_sec, 10);
        assert_eq!(config.controller.publish_port, 2222);
        assert_eq!(config.controller.proxy_port, 2223);
        assert_eq!(config.actuator.status_port, 2224);
        assert_eq!(config.controller.decision.up_debounce_ticks, 3);
        assert_eq!(config.controller.decision.down_debounce_ticks, 6);
        assert_eq!(config.actuator.storage.ring_size, 1000);
        assert_eq!(config.webui.sse_queue_max, 64);
        assert_eq!(config.liveness_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn missing_required_field_is_fatal() {
        // No tsdb url.
        let broken = MINIMAL.replace("url = \"http://tsdb.example:8086\"", "");
        assert!(parse(&broken).is_err());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let with_typo = format!("{MINIMAL}\n[controller.decisionn]\n");
        assert!(parse(&with_typo).is_err());
    }

    #[test]
    fn empty_mode_table_is_rejected() {
        let broken = MINIMAL
            .replace("[[controller.modes]]\nenable = false\non_sec = 0\noff_sec = 0\n", "")
            .replace("[[controller.modes]]\nenable = true\non_sec = 60\noff_sec = 120\n", "");
        assert!(parse(&broken).is_err());
    }

    #[test]
    fn enabled_mode_zero_is_rejected() {
        let broken = MINIMAL.replacen("enable = false", "enable = true\n# was false", 1)
            .replacen("on_sec = 0", "on_sec = 30", 1)
            .replacen("off_sec = 0", "off_sec = 30", 1);
        assert!(parse(&broken).is_err());
    }

    #[test]
    fn duty_lookup_clamps_to_table() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.max_mode(), 1);
        let duty = config.duty_for_mode(99);
        assert!(duty.enable);
        assert_eq!(duty.on_sec, 60);
        assert_eq!(config.duty_for_mode(0), Duty::OFF);
    }

    #[test]
    fn enabled_mode_with_zero_on_sec_is_rejected() {
        let broken = MINIMAL.replace("on_sec = 60", "on_sec = 0");
        assert!(parse(&broken).is_err());
    }
}
