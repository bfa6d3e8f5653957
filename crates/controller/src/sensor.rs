//! Sensor window acquisition from the time-series database.
//!
//! Each metric is a parameterized range read over a fixed lookback window.
//! Transient failures retry with exponential backoff; a metric that still
//! cannot be read comes back *absent*, never as a synthesized zero.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use mistcool_core::config::{SensorItemConfig, SensorSetConfig, TsdbConfig};
use mistcool_core::message::{SenseReading, SenseSummary};

/// Lookback for the range read.
const LOOKBACK: Duration = Duration::from_secs(300);

/// Per-attempt timeout against the TSDB.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Window types
// ---------------------------------------------------------------------------

/// Most recent reading for one metric; `value == None` means absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: Option<f64>,
    pub at: Option<DateTime<Utc>>,
}

impl Metric {
    fn absent(name: &str) -> Metric {
        Metric {
            name: name.to_string(),
            value: None,
            at: None,
        }
    }

    fn is_fresh(&self, stale_threshold: Duration, now: DateTime<Utc>) -> bool {
        match (self.value, self.at) {
            (Some(_), Some(at)) => {
                now.signed_duration_since(at).num_seconds() <= stale_threshold.as_secs() as i64
            }
            _ => false,
        }
    }

    fn to_reading(&self) -> SenseReading {
        SenseReading {
            name: self.name.clone(),
            value: self.value,
            time: self.at,
        }
    }
}

/// Snapshot of every metric the decider consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorWindow {
    pub temp: Metric,
    pub humi: Metric,
    pub lux: Metric,
    pub solar_rad: Metric,
    pub rain: Metric,
    /// One entry per monitored air conditioner.
    pub power: Vec<Metric>,
}

impl SensorWindow {
    /// A window is only usable when every environmental metric is fresh.
    /// Power readings may be individually absent (that unit reads as OFF);
    /// rain defaults to 0 when the gauge is silent.
    pub fn is_valid(&self, stale_threshold: Duration, now: DateTime<Utc>) -> bool {
        self.temp.is_fresh(stale_threshold, now)
            && self.humi.is_fresh(stale_threshold, now)
            && self.lux.is_fresh(stale_threshold, now)
            && self.solar_rad.is_fresh(stale_threshold, now)
    }

    pub fn rain_mm_h(&self) -> f64 {
        self.rain.value.unwrap_or(0.0)
    }

    pub fn to_summary(&self) -> SenseSummary {
        SenseSummary {
            temp: Some(self.temp.to_reading()),
            humi: Some(self.humi.to_reading()),
            lux: Some(self.lux.to_reading()),
            solar_rad: Some(self.solar_rad.to_reading()),
            rain: Some(self.rain.to_reading()),
            power: self.power.iter().map(Metric::to_reading).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// TSDB client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Point {
    time: DateTime<Utc>,
    value: f64,
}

pub struct TsdbClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl TsdbClient {
    pub fn new(config: &TsdbConfig) -> Result<TsdbClient> {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .context("failed to build TSDB http client")?;
        Ok(TsdbClient {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    /// One range read; returns the newest point in the lookback window.
    async fn query_last(
        &self,
        measure: &str,
        hostname: &str,
        field: &str,
    ) -> Result<Option<Point>> {
        let url = format!("{}/query", self.base_url);
        let start = format!("-{}s", LOOKBACK.as_secs());
        let mut request = self.client.get(&url).query(&[
            ("measurement", measure),
            ("host", hostname),
            ("field", field),
            ("start", start.as_str()),
            ("stop", "now"),
        ]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let points: Vec<Point> = request
            .send()
            .await
            .context("tsdb request failed")?
            .error_for_status()
            .context("tsdb returned an error status")?
            .json()
            .await
            .context("tsdb returned malformed json")?;

        Ok(points.into_iter().max_by_key(|p| p.time))
    }

    /// Retry wrapper; exhausting the attempts yields an absent metric.
    async fn fetch_metric(&self, item: &SensorItemConfig, field: &str) -> Metric {
        let mut backoff = BACKOFF_MIN;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.query_last(&item.measure, &item.hostname, field).await {
                Ok(Some(point)) => {
                    return Metric {
                        name: item.name.clone(),
                        value: Some(point.value),
                        at: Some(point.time),
                    };
                }
                Ok(None) => {
                    debug!(sensor = %item.name, "no data in lookback window");
                    return Metric::absent(&item.name);
                }
                Err(e) => {
                    debug!(sensor = %item.name, attempt, "tsdb read failed: {e:#}");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        }
        warn!(sensor = %item.name, "giving up after {MAX_ATTEMPTS} attempts");
        Metric::absent(&item.name)
    }

    /// Fetch the full window.  Rain gauges report per-minute amounts and are
    /// converted to mm/h here.
    pub async fn fetch_window(&self, sensors: &SensorSetConfig) -> SensorWindow {
        let temp = self.fetch_metric(&sensors.temp[0], "temp").await;
        let humi = self.fetch_metric(&sensors.humi[0], "humi").await;
        let lux = self.fetch_metric(&sensors.lux[0], "lux").await;
        let solar_rad = self.fetch_metric(&sensors.solar_rad[0], "solar_rad").await;
        let mut rain = self.fetch_metric(&sensors.rain[0], "rain").await;
        rain.value = rain.value.map(|v| v * 60.0);

        let mut power = Vec::with_capacity(sensors.power.len());
        for item in &sensors.power {
            power.push(self.fetch_metric(item, "power").await);
        }

        SensorWindow {
            temp,
            humi,
            lux,
            solar_rad,
            rain,
            power,
        }
    }
}

// ---------------------------------------------------------------------------
// Dummy mode
// ---------------------------------------------------------------------------

/// Synthetic window for `-d`/`DUMMY_MODE`: hot, sunny, dry, with the air
/// conditioners wandering between off and full blast.
pub fn dummy_window(sensors: &SensorSetConfig) -> SensorWindow {
    let now = Utc::now();
    let fresh = |name: &str, value: f64| Metric {
        name: name.to_string(),
        value: Some(value),
        at: Some(now),
    };

    let power = sensors
        .power
        .iter()
        .map(|item| {
            let draw = match fastrand::u8(0..4) {
                0 => 0.0,
                1 => 60.0 + fastrand::f64() * 100.0,
                2 => 550.0 + fastrand::f64() * 200.0,
                _ => 950.0 + fastrand::f64() * 300.0,
            };
            fresh(&item.name, draw)
        })
        .collect();

    SensorWindow {
        temp: fresh(&sensors.temp[0].name, 31.0 + fastrand::f64() * 4.0),
        humi: fresh(&sensors.humi[0].name, 55.0 + fastrand::f64() * 15.0),
        lux: fresh(&sensors.lux[0].name, 40_000.0 + fastrand::f64() * 20_000.0),
        solar_rad: fresh(&sensors.solar_rad[0].name, 500.0 + fastrand::f64() * 300.0),
        rain: fresh(&sensors.rain[0].name, 0.0),
        power,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
