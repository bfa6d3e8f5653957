//! Solenoid valve driver.  Bit-level GPIO behind the `gpio` feature, a mock
//! backend otherwise (and in `-d` dummy mode).  Writes retry briefly before
//! escalating; an optional echo pin is sampled 50 ms after each write and a
//! mismatch is handed to the fault detector rather than raised here.
//!
//! Ownership is the interlock: the driver is not `Clone` and is moved into
//! the scheduler task, so nothing else can command the valve.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::Instant;
use tracing::{debug, info};

use mistcool_core::config::ValveConfig;

const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);
const ECHO_SETTLE: Duration = Duration::from_millis(50);

/// Commanded valve state plus when it last changed, shared with the flow
/// sampler, fault detector, and status publisher.
#[derive(Debug, Clone, Copy)]
pub struct ValveObservation {
    pub open: bool,
    pub since: Instant,
}

impl ValveObservation {
    pub fn closed_now() -> ValveObservation {
        ValveObservation {
            open: false,
            since: Instant::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.since.elapsed()
    }
}

/// Result of one write: what was commanded and what the echo pin read back
/// (`None` when no echo pin is wired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReport {
    pub commanded: bool,
    pub echoed: Option<bool>,
}

impl EchoReport {
    pub fn mismatch(&self) -> bool {
        matches!(self.echoed, Some(echoed) if echoed != self.commanded)
    }
}

// ---------------------------------------------------------------------------
// Pin backends
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
mod hw {
    use rppal::gpio::{InputPin, OutputPin};

    pub struct HardwarePins {
        pub pin: OutputPin,
        pub echo: Option<InputPin>,
    }
}

enum PinBackend {
    #[cfg(feature = "gpio")]
    Hardware(hw::HardwarePins),
    Mock {
        level: bool,
        echo_wired: bool,
        /// Test hook: make the next N writes fail.
        fail_writes: u32,
    },
}

impl PinBackend {
    fn write(&mut self, open: bool) -> Result<()> {
        match self {
            #[cfg(feature = "gpio")]
            PinBackend::Hardware(pins) => {
                if open {
                    pins.pin.set_high();
                } else {
                    pins.pin.set_low();
                }
                Ok(())
            }
            PinBackend::Mock {
                level, fail_writes, ..
            } => {
                if *fail_writes > 0 {
                    *fail_writes -= 1;
                    bail!("injected gpio write failure");
                }
                *level = open;
                debug!("[mock-gpio] valve set {}", if open { "OPEN" } else { "CLOSE" });
                Ok(())
            }
        }
    }

    fn read_echo(&self) -> Option<bool> {
        match self {
            #[cfg(feature = "gpio")]
            PinBackend::Hardware(pins) => pins.echo.as_ref().map(|pin| pin.is_high()),
            PinBackend::Mock {
                level, echo_wired, ..
            } => echo_wired.then_some(*level),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct ValveDriver {
    backend: PinBackend,
    open: bool,
    /// Command history, recorded only under `TEST=true`.
    hist: Option<Vec<bool>>,
}

impl ValveDriver {
    /// Initialise the driver with the valve failsafe-closed.  `dummy_mode`
    /// forces the mock backend even on a `gpio` build.
    pub fn new(config: &ValveConfig, dummy_mode: bool) -> Result<ValveDriver> {
        let backend = Self::make_backend(config, dummy_mode)?;
        let hist = (std::env::var("TEST").as_deref() == Ok("true")).then(Vec::new);

        let mut driver = ValveDriver {
            backend,
            open: true, // force the initial close to actually write
            hist,
        };
        driver
            .backend
            .write(false)
            .context("failed to close valve at init")?;
        driver.open = false;
        info!("valve driver initialised, valve closed");
        Ok(driver)
    }

    #[cfg(feature = "gpio")]
    fn make_backend(config: &ValveConfig, dummy_mode: bool) -> Result<PinBackend> {
        if dummy_mode {
            return Ok(PinBackend::Mock {
                level: false,
                echo_wired: config.echo_pin.is_some(),
                fail_writes: 0,
            });
        }
        let gpio = rppal::gpio::Gpio::new().context("failed to open gpio")?;
        let pin = gpio
            .get(config.pin)
            .with_context(|| format!("failed to claim gpio pin {}", config.pin))?
            .into_output();
        let echo = match config.echo_pin {
            Some(echo_pin) => Some(
                gpio.get(echo_pin)
                    .with_context(|| format!("failed to claim echo pin {echo_pin}"))?
                    .into_input(),
            ),
            None => None,
        };
        Ok(PinBackend::Hardware(hw::HardwarePins { pin, echo }))
    }

    #[cfg(not(feature = "gpio"))]
    fn make_backend(config: &ValveConfig, _dummy_mode: bool) -> Result<PinBackend> {
        debug!(pin = config.pin, "[mock-gpio] valve registered (not wired)");
        Ok(PinBackend::Mock {
            level: false,
            echo_wired: config.echo_pin.is_some(),
            fail_writes: 0,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Command the valve.  Idempotent: re-commanding the current state skips
    /// the write and just re-samples the echo.  A failed write is retried
    /// before the error escalates to the caller.
    pub async fn set(&mut self, open: bool) -> Result<EchoReport> {
        if open == self.open {
            return Ok(EchoReport {
                commanded: open,
                echoed: self.backend.read_echo(),
            });
        }

        let mut last_err = None;
        for attempt in 1..=WRITE_RETRIES {
            match self.backend.write(open) {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    debug!(attempt, "valve write failed: {e}");
                    last_err = Some(e);
                    if attempt < WRITE_RETRIES {
                        tokio::time::sleep(WRITE_RETRY_DELAY).await;
                    }
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e.context(format!(
                "valve write failed after {WRITE_RETRIES} attempts"
            )));
        }

        self.open = open;
        info!("VALVE: {}", if open { "CLOSE -> OPEN" } else { "OPEN -> CLOSE" });
        if let Some(hist) = &mut self.hist {
            hist.push(open);
        }

        // Let the armature settle before trusting the sense line.
        tokio::time::sleep(ECHO_SETTLE).await;
        Ok(EchoReport {
            commanded: open,
            echoed: self.backend.read_echo(),
        })
    }

    pub fn history(&self) -> Option<&[bool]> {
        self.hist.as_deref()
    }

    /// Test hook on the mock backend: fail the next `n` writes.
    #[cfg(test)]
    pub fn inject_write_failures(&mut self, n: u32) {
        if let PinBackend::Mock { fail_writes, .. } = &mut self.backend {
            *fail_writes = n;
        }
    }
}

impl Drop for ValveDriver {
    /// Failsafe: the valve must not stay open past the driver's lifetime,
    /// unwinding included.
    fn drop(&mut self) {
        if self.open {
            let _ = self.backend.write(false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
