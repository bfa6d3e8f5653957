//! Flow sensing: periodic samples smoothed into a trailing-window estimate.
//!
//! The sampler is the flow sensor's single reader.  It also owns the sensor
//! power policy: after the valve has been closed for a while with zero flow
//! the sensor is powered down, and sampling suspends until the next OPEN.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mistcool_core::config::FlowConfig;

use crate::valve::ValveObservation;

// ---------------------------------------------------------------------------
// Sensor backends
// ---------------------------------------------------------------------------

pub trait FlowSensor: Send {
    fn read_lpm(&mut self) -> Result<f64>;
    fn set_power(&mut self, on: bool);
    fn powered(&self) -> bool;
}

/// Mock sensor: flow follows the commanded valve state, with some jitter
/// while the valve is open.
pub struct DummyFlowSensor {
    valve: watch::Receiver<ValveObservation>,
    powered: bool,
}

impl DummyFlowSensor {
    pub fn new(valve: watch::Receiver<ValveObservation>) -> DummyFlowSensor {
        DummyFlowSensor {
            valve,
            powered: true,
        }
    }
}

impl FlowSensor for DummyFlowSensor {
    fn read_lpm(&mut self) -> Result<f64> {
        let open = self.valve.borrow().open;
        if open {
            Ok(1.0 + fastrand::f64() * 1.5)
        } else {
            Ok(0.0)
        }
    }

    fn set_power(&mut self, on: bool) {
        self.powered = on;
    }

    fn powered(&self) -> bool {
        self.powered
    }
}

/// Analog flow sensor read through an ADS1115 on I2C (`gpio` builds).
/// Single-shot, single-ended conversion on one channel; the raw count is
/// scaled to L/min by calibration.
#[cfg(feature = "gpio")]
pub mod analog {
    use super::*;
    use rppal::i2c::I2c;

    const REG_CONVERSION: u8 = 0x00;
    const REG_CONFIG: u8 = 0x01;
    /// OS=1, PGA ±4.096 V, single-shot, 128 SPS, comparator off.
    const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;
    const MUX_SHIFT: u8 = 12;
    const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];
    const CONVERSION_WAIT: Duration = Duration::from_millis(9);

    pub struct AnalogFlowSensor {
        i2c: I2c,
        channel: u8,
        lpm_per_count: f64,
        powered: bool,
    }

    impl AnalogFlowSensor {
        pub fn new(config: &FlowConfig) -> Result<AnalogFlowSensor> {
            use anyhow::Context;
            anyhow::ensure!(config.adc_channel <= 3, "ADS1115 channel out of range");
            let mut i2c = I2c::new().context("failed to open i2c bus")?;
            i2c.set_slave_address(config.i2c_addr)
                .context("failed to address ADS1115")?;
            Ok(AnalogFlowSensor {
                i2c,
                channel: config.adc_channel,
                lpm_per_count: config.lpm_per_count,
                powered: true,
            })
        }
    }

    impl FlowSensor for AnalogFlowSensor {
        fn read_lpm(&mut self) -> Result<f64> {
            let config =
                CONFIG_BASE | (MUX_SINGLE_ENDED[self.channel as usize] << MUX_SHIFT);
            self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;
            std::thread::sleep(CONVERSION_WAIT);
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONVERSION, &mut buf)?;
            let raw = i16::from_be_bytes(buf).max(0);
            Ok(f64::from(raw) * self.lpm_per_count)
        }

        fn set_power(&mut self, on: bool) {
            self.powered = on;
        }

        fn powered(&self) -> bool {
            self.powered
        }
    }
}

// ---------------------------------------------------------------------------
// Trailing-window estimate
// ---------------------------------------------------------------------------

/// Smoothed flow over the trailing window.  `sampling == false` means the
/// sensor is deliberately powered down (valve long closed), so an empty
/// window is expected and not a signal-quality problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowEstimate {
    pub mean: f64,
    pub stddev: f64,
    pub n: usize,
    pub sampling: bool,
}

impl FlowEstimate {
    pub fn idle() -> FlowEstimate {
        FlowEstimate {
            mean: 0.0,
            stddev: 0.0,
            n: 0,
            sampling: false,
        }
    }
}

pub struct FlowWindow {
    samples: VecDeque<(Instant, f64)>,
    window: Duration,
}

impl FlowWindow {
    pub fn new(window: Duration) -> FlowWindow {
        FlowWindow {
            samples: VecDeque::new(),
            window,
        }
    }

    pub fn push(&mut self, at: Instant, lpm: f64) {
        self.samples.push_back((at, lpm));
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Drop samples older than the window and compute mean/stddev over the
    /// rest.
    pub fn estimate(&mut self, now: Instant) -> FlowEstimate {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let n = self.samples.len();
        if n == 0 {
            return FlowEstimate {
                mean: 0.0,
                stddev: 0.0,
                n: 0,
                sampling: true,
            };
        }

        let mean = self.samples.iter().map(|&(_, v)| v).sum::<f64>() / n as f64;
        let variance = self
            .samples
            .iter()
            .map(|&(_, v)| (v - mean).powi(2))
            .sum::<f64>()
            / n as f64;

        FlowEstimate {
            mean,
            stddev: variance.sqrt(),
            n,
            sampling: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Sampler worker
// ---------------------------------------------------------------------------

pub async fn run_sampler(
    mut sensor: Box<dyn FlowSensor>,
    config: FlowConfig,
    valve_rx: watch::Receiver<ValveObservation>,
    estimate_tx: watch::Sender<FlowEstimate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs_f64(1.0 / config.sample_hz);
    let mut window = FlowWindow::new(Duration::from_secs_f64(config.window_sec));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(hz = config.sample_hz, "flow sampler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let valve = *valve_rx.borrow();
                let now = Instant::now();

                if !sensor.powered() {
                    if valve.open {
                        info!("valve opened, powering flow sensor back on");
                        sensor.set_power(true);
                        window.clear();
                    } else {
                        let _ = estimate_tx.send(FlowEstimate::idle());
                        continue;
                    }
                }

                match sensor.read_lpm() {
                    Ok(lpm) => window.push(now, lpm),
                    Err(e) => debug!("flow read failed: {e}"),
                }
                let estimate = window.estimate(now);
                let _ = estimate_tx.send(estimate);

                // Valve long closed with no measurable flow: save the sensor.
                if !valve.open
                    && valve.duration() >= Duration::from_secs_f64(config.power_off_sec)
                    && estimate.n > 0
                    && estimate.mean == 0.0
                {
                    warn!(
                        closed_sec = valve.duration().as_secs(),
                        "valve closed for a long time, powering flow sensor off"
                    );
                    sensor.set_power(false);
                    window.clear();
                    let _ = estimate_tx.send(FlowEstimate::idle());
                }
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("flow sampler stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn estimate_over_constant_samples() {
        let mut window = FlowWindow::new(Duration::from_secs(3));
        let t0 = Instant::now();
        for i in 0..10 {
            window.push(t0 + Duration::from_millis(i * 100), 2.0);
        }
        let est = window.estimate(t0 + Duration::from_secs(1));
        assert_eq!(est.n, 10);
        assert!((est.mean - 2.0).abs() < 1e-9);
        assert!(est.stddev < 1e-9);
        assert!(est.sampling);
    }

    #[tokio::test(start_paused = true)]
    async fn old_samples_age_out_of_the_window() {
        let mut window = FlowWindow::new(Duration::from_secs(3));
        let t0 = Instant::now();
        window.push(t0, 100.0);
        window.push(t0 + Duration::from_secs(4), 1.0);

        let est = window.estimate(t0 + Duration::from_secs(4));
        assert_eq!(est.n, 1);
        assert!((est.mean - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_reports_zero_samples_while_sampling() {
        let mut window = FlowWindow::new(Duration::from_secs(3));
        let est = window.estimate(Instant::now());
        assert_eq!(est.n, 0);
        assert!(est.sampling);
    }

    #[tokio::test(start_paused = true)]
    async fn stddev_reflects_noise() {
        let mut window = FlowWindow::new(Duration::from_secs(10));
        let t0 = Instant::now();
        for (i, v) in [1.0, 3.0, 1.0, 3.0].iter().enumerate() {
            window.push(t0 + Duration::from_millis(i as u64 * 100), *v);
        }
        let est = window.estimate(t0 + Duration::from_secs(1));
        assert!((est.mean - 2.0).abs() < 1e-9);
        assert!((est.stddev - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn dummy_sensor_tracks_valve_state() {
        let (valve_tx, valve_rx) = watch::channel(ValveObservation::closed_now());
        let mut sensor = DummyFlowSensor::new(valve_rx);

        assert_eq!(sensor.read_lpm().unwrap(), 0.0);

        valve_tx
            .send(ValveObservation {
                open: true,
                since: Instant::now(),
            })
            .unwrap();
        let lpm = sensor.read_lpm().unwrap();
        assert!(lpm >= 1.0 && lpm <= 2.5, "unexpected dummy flow: {lpm}");
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_powers_sensor_off_after_long_close() {
        let (_valve_tx, valve_rx) = watch::channel(ValveObservation {
            open: false,
            // Closed for far longer than power_off_sec.
            since: Instant::now(),
        });
        let (est_tx, est_rx) = watch::channel(FlowEstimate::idle());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = FlowConfig {
            power_off_sec: 1.0,
            ..FlowConfig::default()
        };
        let sensor = Box::new(DummyFlowSensor::new(valve_rx.clone()));
        let sampler = tokio::spawn(run_sampler(
            sensor,
            config,
            valve_rx,
            est_tx,
            shutdown_rx,
        ));

        // Enough virtual time for samples to accumulate and the close timer
        // to pass the power-off threshold.
        tokio::time::sleep(Duration::from_secs(5)).await;

        let est = *est_rx.borrow();
        assert!(!est.sampling, "sensor should be powered down: {est:?}");

        shutdown_tx.send(true).unwrap();
        sampler.await.unwrap();
    }
}
