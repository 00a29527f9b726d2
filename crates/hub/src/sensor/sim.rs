//! Stateful sensor simulator for rigs without hardware attached.
//!
//! Each metric evolves as a random walk with mean reversion, so consecutive
//! readings stay coherent instead of jumping around:
//! - slow drift (soil drying out)
//! - per-reading electronic noise
//! - a day/night cycle for light and temperature
//! - closed-loop watering response (moisture rises while the pump runs)

use crate::error::ReadError;

use super::{Metric, MetricValue, SensorKind, SensorSource};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Full-scale illuminance used to derive the light level percentage.
const LUX_FULL_SCALE: f64 = 100_000.0;

/// Moisture gained per sample while the pump is running, percent.
const WATERING_GAIN: f64 = 4.0;

/// Default length of a simulated day. Short so the cycle is visible while
/// developing.
const DIURNAL_PERIOD_S: f64 = 600.0;

// ---------------------------------------------------------------------------
// Per-metric walk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct WalkParams {
    center: f64,
    min: f64,
    max: f64,
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    diurnal_amplitude: f64,
}

fn params_for(metric: Metric) -> WalkParams {
    let p = |center, min, max, drift, walk_sigma, mean_reversion, noise_sigma, diurnal| WalkParams {
        center,
        min,
        max,
        drift,
        walk_sigma,
        mean_reversion,
        noise_sigma,
        diurnal_amplitude: diurnal,
    };
    match metric {
        Metric::Temperature => p(22.0, 10.0, 40.0, 0.0, 0.15, 0.05, 0.2, 3.0),
        Metric::Humidity => p(60.0, 20.0, 95.0, 0.0, 0.8, 0.05, 0.5, -6.0),
        Metric::Moisture => p(45.0, 0.0, 100.0, -0.3, 0.5, 0.01, 0.4, 0.0),
        Metric::Light => p(25_000.0, 0.0, LUX_FULL_SCALE, 0.0, 500.0, 0.1, 300.0, 24_000.0),
        Metric::AirQuality => p(50.0, 0.0, 500.0, 0.0, 2.0, 0.05, 1.5, 0.0),
        Metric::Co2 => p(600.0, 400.0, 2000.0, 0.0, 10.0, 0.05, 5.0, 0.0),
        Metric::Nh3 => p(12.0, 0.0, 50.0, 0.0, 0.3, 0.05, 0.2, 0.0),
        Metric::Nox => p(25.0, 0.0, 100.0, 0.0, 0.5, 0.05, 0.3, 0.0),
        // Derived from Light, never walked on its own.
        Metric::LightLevel => p(25.0, 0.0, 100.0, 0.0, 0.0, 0.0, 0.0, 0.0),
    }
}

#[derive(Debug, Clone)]
struct Walk {
    metric: Metric,
    params: WalkParams,
    /// Current "true" value. Evolves each sample.
    base: f64,
    /// Permanent offset so two simulated rigs never read identically.
    offset: f64,
}

impl Walk {
    fn new(metric: Metric) -> Self {
        let params = params_for(metric);
        let span = params.max - params.min;
        Self {
            metric,
            params,
            base: (params.center + gaussian(0.0, span * 0.03)).clamp(params.min, params.max),
            offset: gaussian(0.0, span * 0.01),
        }
    }

    fn step(&mut self, watering: bool, phase: f64) -> f64 {
        let p = self.params;

        let pull = p.mean_reversion * (p.center - self.base);
        let walk = gaussian(0.0, p.walk_sigma);
        let wet = if watering && self.metric == Metric::Moisture {
            WATERING_GAIN
        } else {
            0.0
        };
        self.base = (self.base + p.drift + pull + walk + wet).clamp(p.min, p.max);

        let diurnal = p.diurnal_amplitude * phase.sin();
        let noise = gaussian(0.0, p.noise_sigma);
        let value = (self.base + self.offset + diurnal + noise).clamp(p.min, p.max);
        (value * 10.0).round() / 10.0
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Synthesises plausible values for every metric of a sensor kind.
pub struct SimulatedSource {
    walks: Vec<Walk>,
    watering: bool,
    diurnal_period_s: f64,
}

impl SimulatedSource {
    pub fn new(kind: SensorKind) -> Self {
        Self::with_period(kind, DIURNAL_PERIOD_S)
    }

    /// `diurnal_period_s` controls the day/night cycle length. Use 86400 for
    /// real time.
    pub fn with_period(kind: SensorKind, diurnal_period_s: f64) -> Self {
        let walks = kind
            .metrics()
            .iter()
            .filter(|m| **m != Metric::LightLevel)
            .map(|m| Walk::new(*m))
            .collect();
        Self {
            walks,
            watering: false,
            diurnal_period_s,
        }
    }

    fn phase(&self) -> f64 {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s
    }
}

impl SensorSource for SimulatedSource {
    fn read(&mut self) -> Result<Vec<MetricValue>, ReadError> {
        let phase = self.phase();
        let watering = self.watering;
        let mut values = Vec::with_capacity(self.walks.len() + 1);

        for walk in &mut self.walks {
            let value = walk.step(watering, phase);
            values.push(MetricValue::new(walk.metric, value));
            if walk.metric == Metric::Light {
                let level = (value / LUX_FULL_SCALE * 1000.0).round() / 10.0;
                values.push(MetricValue::new(Metric::LightLevel, level));
            }
        }
        Ok(values)
    }

    fn set_watering(&mut self, on: bool) {
        self.watering = on;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
