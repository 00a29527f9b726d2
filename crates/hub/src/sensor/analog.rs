//! Hardware sources: raw analog conversions turned into physical metrics.

use serde::Deserialize;

use crate::error::ReadError;

use super::adc::{AnalogInput, FULL_SCALE_VOLTS, RAW_MAX};
use super::{Metric, MetricValue, SensorKind, SensorSource};

/// Supply voltage of the analog sensor boards. Readings above it are
/// clamped.
const SUPPLY_VOLTS: f64 = 3.3;

/// Illuminance at full supply voltage on the LDR divider.
const LUX_AT_SUPPLY: f64 = 100_000.0;

/// Dry/wet endpoints for a capacitive soil moisture probe, in raw ADC units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Calibration {
    pub raw_dry: i64,
    pub raw_wet: i64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            raw_dry: 26000,
            raw_wet: 12000,
        }
    }
}

/// Convert a raw reading to a 0..=100 moisture percentage using the probe's
/// calibration. Clamped so out-of-range readings stay meaningful.
pub fn moisture_percent(raw: i64, cal: Calibration) -> f64 {
    let range = cal.raw_dry - cal.raw_wet;
    if range == 0 {
        return 0.0;
    }
    let m = (cal.raw_dry - raw) as f64 / range as f64;
    round1(m.clamp(0.0, 1.0) * 100.0)
}

fn volts(raw: i64) -> f64 {
    (raw as f64 * FULL_SCALE_VOLTS / RAW_MAX as f64).clamp(0.0, SUPPLY_VOLTS)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Metrics for one raw conversion on a channel of `kind`.
pub fn convert(kind: SensorKind, raw: i64, cal: Calibration) -> Vec<MetricValue> {
    let frac = volts(raw) / SUPPLY_VOLTS;
    match kind {
        SensorKind::SoilMoisture => {
            vec![MetricValue::new(Metric::Moisture, moisture_percent(raw, cal))]
        }
        SensorKind::Light => vec![
            MetricValue::new(Metric::Light, round1(frac * LUX_AT_SUPPLY)),
            MetricValue::new(Metric::LightLevel, round1(frac * 100.0)),
        ],
        SensorKind::AirQuality => {
            let v = volts(raw);
            vec![
                MetricValue::new(Metric::AirQuality, round1(frac * 500.0)),
                MetricValue::new(Metric::Co2, round1(400.0 + v * 200.0)),
                MetricValue::new(Metric::Nh3, round1(v * 10.0)),
                MetricValue::new(Metric::Nox, round1(v * 20.0)),
            ]
        }
        SensorKind::TemperatureHumidity => Vec::new(),
    }
}

/// An analog sensor wired to one ADS1115 input.
pub struct AnalogSource {
    kind: SensorKind,
    input: AnalogInput,
    calibration: Calibration,
}

impl AnalogSource {
    pub fn new(kind: SensorKind, input: AnalogInput, calibration: Calibration) -> Self {
        Self {
            kind,
            input,
            calibration,
        }
    }
}

impl SensorSource for AnalogSource {
    fn read(&mut self) -> Result<Vec<MetricValue>, ReadError> {
        let raw = i64::from(self.input.read_raw()?);
        if !(0..=RAW_MAX).contains(&raw) {
            return Err(ReadError::OutOfRange(raw));
        }
        Ok(convert(self.kind, raw, self.calibration))
    }
}

/// Hardware this build has no driver for. Every read fails, so the channel
/// reports disconnected instead of inventing values.
pub struct UnsupportedSource {
    what: &'static str,
}

impl UnsupportedSource {
    pub fn new(what: &'static str) -> Self {
        Self { what }
    }
}

impl SensorSource for UnsupportedSource {
    fn read(&mut self) -> Result<Vec<MetricValue>, ReadError> {
        Err(ReadError::Unsupported(self.what))
    }
}
