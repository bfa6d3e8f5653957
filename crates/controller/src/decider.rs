//! Staged cooling-mode decision.
//!
//! Two ordered first-match-wins rule lists produce the raw mode: an A/C
//! activity classifier over the per-unit power readings, and an outdoor
//! adjustment over the weather metrics.  A debounce stage then suppresses
//! chatter: increases wait `up_debounce_ticks`, decreases wait
//! `down_debounce_ticks`, and stop-class conditions (rain, humidity over
//! limit, unusable sensor window past `stale_keep_ticks`) drop to mode 0
//! immediately.

use tracing::{info, warn};

use mistcool_core::config::{ControllerConfig, Thresholds};
use mistcool_core::message::{CoolingState, Duty};

use crate::sensor::SensorWindow;

// ---------------------------------------------------------------------------
// A/C activity classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirconMode {
    Off,
    Idle,
    Normal,
    Full,
}

/// Classify one air conditioner from its power draw.  Below `temp_cooling`
/// the unit cannot be cooling (it is off, heating, or defrosting), so any
/// draw counts as Off.  An absent reading also counts as Off.
pub fn aircon_mode(power_w: Option<f64>, temp: f64, th: &Thresholds) -> AirconMode {
    let Some(power) = power_w else {
        return AirconMode::Off;
    };
    if temp < th.temp_cooling {
        return AirconMode::Off;
    }
    if power > th.power_full {
        AirconMode::Full
    } else if power > th.power_normal {
        AirconMode::Normal
    } else if power > th.power_work {
        AirconMode::Idle
    } else {
        AirconMode::Off
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ModeCounts {
    pub idle: usize,
    pub normal: usize,
    pub full: usize,
}

impl ModeCounts {
    fn tally(window: &SensorWindow, th: &Thresholds) -> ModeCounts {
        let temp = window.temp.value.unwrap_or(f64::MIN);
        let mut counts = ModeCounts::default();
        for unit in &window.power {
            match aircon_mode(unit.value, temp, th) {
                AirconMode::Idle => counts.idle += 1,
                AirconMode::Normal => counts.normal += 1,
                AirconMode::Full => counts.full += 1,
                AirconMode::Off => {}
            }
        }
        counts
    }
}

/// Ordered activity rules; the first match wins.
pub fn activity_status(c: ModeCounts) -> (u16, &'static str) {
    if c.full >= 2 {
        (6, "two or more units at full blast")
    } else if c.full >= 1 && c.normal >= 1 {
        (5, "one unit at full blast, another in normal operation")
    } else if c.full >= 1 {
        (4, "one unit at full blast")
    } else if c.normal >= 2 {
        (4, "two or more units in normal operation")
    } else if c.normal >= 1 {
        (3, "one unit in normal operation")
    } else if c.idle >= 2 {
        (2, "two or more units idling")
    } else if c.idle >= 1 {
        (1, "one unit idling")
    } else {
        (0, "no unit is running")
    }
}

// ---------------------------------------------------------------------------
// Outdoor adjustment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outdoor {
    pub adjust: i32,
    /// Stop-class: cooling must cease immediately, bypassing debounce.
    pub stop: bool,
    pub reason: &'static str,
}

/// Ordered outdoor rules; the first match wins.
pub fn outdoor_adjust(window: &SensorWindow, th: &Thresholds) -> Outdoor {
    let temp = window.temp.value.unwrap_or(0.0);
    let humi = window.humi.value.unwrap_or(0.0);
    let lux = window.lux.value.unwrap_or(0.0);
    let solar = window.solar_rad.value.unwrap_or(0.0);
    let rain = window.rain_mm_h();

    if rain > th.rain_max {
        Outdoor {
            adjust: 0,
            stop: true,
            reason: "raining, spraying would be pointless",
        }
    } else if humi > th.humi_max {
        Outdoor {
            adjust: 0,
            stop: true,
            reason: "humidity too high for evaporative cooling",
        }
    } else if temp > th.temp_high_h && solar > th.solar_rad_daytime {
        Outdoor {
            adjust: 3,
            stop: false,
            reason: "very hot under strong sun",
        }
    } else if temp > th.temp_high_l && solar > th.solar_rad_daytime {
        Outdoor {
            adjust: 2,
            stop: false,
            reason: "hot under strong sun",
        }
    } else if solar > th.solar_rad_high {
        Outdoor {
            adjust: 1,
            stop: false,
            reason: "strong solar radiation",
        }
    } else if temp > th.temp_mid && lux < th.lux_low {
        Outdoor {
            adjust: -1,
            stop: false,
            reason: "warm but dark",
        }
    } else if lux < th.lux_low {
        Outdoor {
            adjust: -2,
            stop: false,
            reason: "dark",
        }
    } else if solar < th.solar_rad_low {
        Outdoor {
            adjust: -1,
            stop: false,
            reason: "weak solar radiation",
        }
    } else {
        Outdoor {
            adjust: 0,
            stop: false,
            reason: "neutral conditions",
        }
    }
}

// ---------------------------------------------------------------------------
// Decider with debounce
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub mode_index: u16,
    pub state: CoolingState,
    pub duty: Duty,
    /// Set when the emitted mode changed on this tick.
    pub changed: bool,
}

pub struct Decider {
    thresholds: Thresholds,
    duty_table: Vec<Duty>,
    up_debounce: u32,
    down_debounce: u32,
    stale_keep: u32,

    current: u16,
    candidate: Option<u16>,
    candidate_ticks: u32,
    absent_ticks: u32,
}

impl Decider {
    pub fn new(config: &ControllerConfig) -> Decider {
        Decider {
            thresholds: config.decision.thresholds.clone(),
            duty_table: config.modes.iter().map(|m| m.duty()).collect(),
            up_debounce: config.decision.up_debounce_ticks,
            down_debounce: config.decision.down_debounce_ticks,
            stale_keep: config.decision.stale_keep_ticks,
            current: 0,
            candidate: None,
            candidate_ticks: 0,
            absent_ticks: 0,
        }
    }

    pub fn current_mode(&self) -> u16 {
        self.current
    }

    fn max_mode(&self) -> u16 {
        (self.duty_table.len() - 1) as u16
    }

    fn decision(&self, changed: bool) -> Decision {
        let duty = self.duty_table[usize::from(self.current)];
        Decision {
            mode_index: self.current,
            state: if self.current > 0 {
                CoolingState::Running
            } else {
                CoolingState::Idle
            },
            duty,
            changed,
        }
    }

    /// One control tick.  `window == None` covers both a failed fetch and an
    /// invalid (stale) window; the previous mode is reused for at most
    /// `stale_keep_ticks` ticks before forcing mode 0.
    pub fn tick(&mut self, window: Option<&SensorWindow>) -> Decision {
        let Some(window) = window else {
            return self.absent_tick();
        };
        self.absent_ticks = 0;

        let counts = ModeCounts::tally(window, &self.thresholds);
        let (activity, activity_reason) = activity_status(counts);

        let (target, stop, reason) = if activity == 0 {
            (0u16, false, activity_reason)
        } else {
            let outdoor = outdoor_adjust(window, &self.thresholds);
            if outdoor.stop {
                (0u16, true, outdoor.reason)
            } else {
                let raw = (i32::from(activity) + outdoor.adjust).max(0) as u16;
                (raw.min(self.max_mode()), false, outdoor.reason)
            }
        };

        if stop {
            let changed = self.current != 0;
            if changed {
                info!(reason, "stop condition, cooling off immediately");
            }
            self.current = 0;
            self.candidate = None;
            self.candidate_ticks = 0;
            return self.decision(changed);
        }

        if target == self.current {
            self.candidate = None;
            self.candidate_ticks = 0;
            return self.decision(false);
        }

        // Debounce: the same target must hold for enough consecutive ticks.
        if self.candidate == Some(target) {
            self.candidate_ticks += 1;
        } else {
            self.candidate = Some(target);
            self.candidate_ticks = 1;
        }

        let needed = if target > self.current {
            self.up_debounce
        } else {
            self.down_debounce
        };

        if self.candidate_ticks >= needed {
            info!(
                from = self.current,
                to = target,
                reason,
                "cooling mode change"
            );
            self.current = target;
            self.candidate = None;
            self.candidate_ticks = 0;
            return self.decision(true);
        }

        self.decision(false)
    }

    fn absent_tick(&mut self) -> Decision {
        self.absent_ticks += 1;
        if self.absent_ticks == 2 {
            warn!("sensor window absent for 2 consecutive ticks");
        } else if self.absent_ticks == 5 {
            tracing::error!("sensor window absent for 5 consecutive ticks");
        }

        if self.absent_ticks > self.stale_keep {
            let changed = self.current != 0;
            if changed {
                warn!(
                    ticks = self.absent_ticks,
                    "sensor window stale beyond keep limit, cooling off"
                );
            }
            self.current = 0;
            self.candidate = None;
            self.candidate_ticks = 0;
            return self.decision(changed);
        }
        self.decision(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mistcool_core::config::Config;

    use crate::sensor::Metric;

    const CONFIG: &str = r#"
[controller]
[controller.tsdb]
url = "http://tsdb.example:8086"

[controller.sensor]
temp = [{ name = "outdoor", measure = "env", hostname = "roof" }]
humi = [{ name = "outdoor", measure = "env", hostname = "roof" }]
lux = [{ name = "outdoor", measure = "env", hostname = "roof" }]
solar_rad = [{ name = "outdoor", measure = "env", hostname = "roof" }]
rain = [{ name = "gauge", measure = "env", hostname = "roof" }]
power = [
    { name = "aircon-1", measure = "power", hostname = "meter" },
    { name = "aircon-2", measure = "power", hostname = "meter" },
]

[[controller.modes]]
enable = false
on_sec = 0
off_sec = 0

[[controller.modes]]
enable = true
on_sec = 60
off_sec = 120

[[controller.modes]]
enable = true
on_sec = 60
off_sec = 60

[[controller.modes]]
enable = true
on_sec = 90
off_sec = 30

[actuator]
db_path = ":memory:"

[webui]
db_path = ":memory:"
"#;

    fn config() -> Config {
        let config: Config = toml::from_str(CONFIG).unwrap();
        config.validate().unwrap();
        config
    }

    fn metric(value: f64) -> Metric {
        Metric {
            name: "m".into(),
            value: Some(value),
            at: Some(Utc::now()),
        }
    }

    /// Mild day with neutral outdoor conditions (adjustment 0), aircons at
    /// the given draws.
    fn window(power: &[f64]) -> SensorWindow {
        SensorWindow {
            temp: metric(30.0),
            humi: metric(60.0),
            lux: metric(50_000.0),
            solar_rad: metric(400.0),
            rain: metric(0.0),
            power: power.iter().map(|&p| metric(p)).collect(),
        }
    }

    // -- aircon_mode --------------------------------------------------------

    #[test]
    fn aircon_mode_thresholds() {
        let th = Thresholds::default();
        assert_eq!(aircon_mode(Some(0.0), 33.0, &th), AirconMode::Off);
        assert_eq!(aircon_mode(Some(100.0), 33.0, &th), AirconMode::Idle);
        assert_eq!(aircon_mode(Some(600.0), 33.0, &th), AirconMode::Normal);
        assert_eq!(aircon_mode(Some(1000.0), 33.0, &th), AirconMode::Full);
    }

    #[test]
    fn cold_outdoor_temp_means_not_cooling() {
        let th = Thresholds::default();
        // 1 kW draw at 10 degrees is heating, not cooling.
        assert_eq!(aircon_mode(Some(1000.0), 10.0, &th), AirconMode::Off);
    }

    #[test]
    fn absent_power_reading_counts_as_off() {
        let th = Thresholds::default();
        assert_eq!(aircon_mode(None, 33.0, &th), AirconMode::Off);
    }

    // -- activity rules -----------------------------------------------------

    #[test]
    fn activity_rules_first_match_wins() {
        let status = |idle, normal, full| activity_status(ModeCounts { idle, normal, full }).0;
        assert_eq!(status(0, 0, 0), 0);
        assert_eq!(status(1, 0, 0), 1);
        assert_eq!(status(2, 0, 0), 2);
        assert_eq!(status(0, 1, 0), 3);
        assert_eq!(status(0, 2, 0), 4);
        assert_eq!(status(0, 0, 1), 4);
        assert_eq!(status(0, 1, 1), 5);
        assert_eq!(status(0, 0, 2), 6);
    }

    // -- outdoor rules ------------------------------------------------------

    #[test]
    fn rain_is_a_stop_condition() {
        let th = Thresholds::default();
        let mut w = window(&[800.0]);
        w.rain = metric(5.0);
        let outdoor = outdoor_adjust(&w, &th);
        assert!(outdoor.stop);
    }

    #[test]
    fn high_humidity_is_a_stop_condition() {
        let th = Thresholds::default();
        let mut w = window(&[800.0]);
        w.humi = metric(99.0);
        assert!(outdoor_adjust(&w, &th).stop);
    }

    #[test]
    fn hot_sunny_day_boosts_cooling() {
        let th = Thresholds::default();
        let mut w = window(&[800.0]);
        w.temp = metric(36.0);
        w.solar_rad = metric(800.0);
        assert_eq!(outdoor_adjust(&w, &th).adjust, 3);
    }

    #[test]
    fn darkness_weakens_cooling() {
        let th = Thresholds::default();
        let mut w = window(&[800.0]);
        w.temp = metric(28.5);
        w.lux = metric(100.0);
        w.solar_rad = metric(150.0);
        assert_eq!(outdoor_adjust(&w, &th).adjust, -2);
    }

    // -- boundary: all-zero power → mode 0 ----------------------------------

    #[test]
    fn all_zero_power_yields_mode_zero() {
        let mut decider = Decider::new(&config().controller);
        for _ in 0..5 {
            let d = decider.tick(Some(&window(&[0.0, 0.0])));
            assert_eq!(d.mode_index, 0);
            assert_eq!(d.state, CoolingState::Idle);
            assert!(!d.duty.enable);
        }
    }

    // -- debounce -----------------------------------------------------------

    #[test]
    fn mode_increase_waits_for_up_debounce() {
        let mut decider = Decider::new(&config().controller);
        let w = window(&[800.0, 0.0]); // one unit in normal operation

        // Ticks 1 and 2: still mode 0.
        assert_eq!(decider.tick(Some(&w)).mode_index, 0);
        assert_eq!(decider.tick(Some(&w)).mode_index, 0);

        // Tick 3: the new mode is emitted.
        let d = decider.tick(Some(&w));
        assert!(d.mode_index > 0);
        assert!(d.changed);
        assert_eq!(d.state, CoolingState::Running);
        assert!(d.duty.enable);
    }

    #[test]
    fn mode_decrease_waits_for_down_debounce() {
        let mut decider = Decider::new(&config().controller);
        let on = window(&[800.0, 0.0]);
        let off = window(&[0.0, 0.0]);

        for _ in 0..3 {
            decider.tick(Some(&on));
        }
        let established = decider.current_mode();
        assert!(established > 0);

        // Power drops: 5 ticks of holding, mode 0 on the 6th.
        for i in 1..=5 {
            let d = decider.tick(Some(&off));
            assert_eq!(d.mode_index, established, "tick {i} should still hold");
        }
        let d = decider.tick(Some(&off));
        assert_eq!(d.mode_index, 0);
        assert!(d.changed);
    }

    #[test]
    fn interrupted_candidate_resets_the_debounce_count() {
        let mut decider = Decider::new(&config().controller);
        let on = window(&[800.0, 0.0]);
        let idle = window(&[100.0, 0.0]); // different non-zero target

        decider.tick(Some(&on));
        decider.tick(Some(&on));
        decider.tick(Some(&idle)); // breaks the streak
        decider.tick(Some(&on));
        let d = decider.tick(Some(&on));
        // Only two consecutive ticks for `on` so far: still mode 0.
        assert_eq!(d.mode_index, 0);
    }

    #[test]
    fn stop_condition_bypasses_debounce() {
        let mut decider = Decider::new(&config().controller);
        let on = window(&[800.0, 0.0]);
        for _ in 0..3 {
            decider.tick(Some(&on));
        }
        assert!(decider.current_mode() > 0);

        // Rain starts: mode 0 on the very next tick.
        let mut rainy = window(&[800.0, 0.0]);
        rainy.rain = metric(10.0);
        let d = decider.tick(Some(&rainy));
        assert_eq!(d.mode_index, 0);
        assert!(d.changed);
    }

    // -- absent windows -----------------------------------------------------

    #[test]
    fn absent_window_reuses_previous_mode_within_keep_limit() {
        let mut decider = Decider::new(&config().controller);
        let on = window(&[800.0, 0.0]);
        for _ in 0..3 {
            decider.tick(Some(&on));
        }
        let established = decider.current_mode();
        assert!(established > 0);

        // stale_keep_ticks = 3: three absent ticks hold, the fourth stops.
        for _ in 0..3 {
            assert_eq!(decider.tick(None).mode_index, established);
        }
        let d = decider.tick(None);
        assert_eq!(d.mode_index, 0);
        assert!(!d.duty.enable);
    }

    #[test]
    fn no_nonzero_mode_while_window_stays_absent() {
        let mut decider = Decider::new(&config().controller);
        for _ in 0..10 {
            assert_eq!(decider.tick(None).mode_index, 0);
        }
    }

    #[test]
    fn recovery_after_absence_goes_through_debounce_again() {
        let mut decider = Decider::new(&config().controller);
        let on = window(&[800.0, 0.0]);
        for _ in 0..3 {
            decider.tick(Some(&on));
        }
        for _ in 0..4 {
            decider.tick(None); // beyond stale_keep → mode 0
        }
        assert_eq!(decider.current_mode(), 0);

        // Fresh data again: the ramp is debounced from scratch.
        assert_eq!(decider.tick(Some(&on)).mode_index, 0);
        assert_eq!(decider.tick(Some(&on)).mode_index, 0);
        assert!(decider.tick(Some(&on)).mode_index > 0);
    }

    // -- clamping -----------------------------------------------------------

    #[test]
    fn raw_mode_is_clamped_to_the_duty_table() {
        let mut decider = Decider::new(&config().controller);
        // Two units at full blast under a blazing sun: activity 6 + adjust 3,
        // clamped to the highest configured mode (3).
        let mut w = window(&[1200.0, 1300.0]);
        w.temp = metric(37.0);
        w.solar_rad = metric(900.0);

        for _ in 0..3 {
            decider.tick(Some(&w));
        }
        assert_eq!(decider.current_mode(), 3);
    }
}
