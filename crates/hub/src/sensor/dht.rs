//! DHT11/DHT22 temperature and humidity sensor on a single GPIO data line.
//!
//! The host pulls the line low to request a frame, then the sensor answers
//! with 40 bits: humidity (2 bytes), temperature (2 bytes) and a checksum.
//! Each bit is a ~50 µs low followed by a high whose length encodes the
//! value (~27 µs for 0, ~70 µs for 1). Timing is done by busy-waiting on
//! the pin, so reads occasionally fail and are retried.
//!
//! The `gpio` feature gates the real rppal line; without it every read
//! reports [`ReadError::Unsupported`] so the channel stays disconnected.

use serde::Deserialize;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ReadError;

use super::{Metric, MetricValue, SensorSource};

/// Data bits in one frame.
pub const FRAME_BITS: usize = 40;

/// High pulses longer than this are a 1.
const ONE_THRESHOLD_US: u32 = 50;

/// The sensor refuses to answer more often than this.
pub const MIN_READ_INTERVAL: Duration = Duration::from_secs(2);

/// Attempts per read before the last error is reported.
const ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DhtModel {
    Dht11,
    #[default]
    Dht22,
}

impl DhtModel {
    /// How long the host holds the line low to start a frame.
    pub fn start_signal(self) -> Duration {
        match self {
            Self::Dht11 => Duration::from_millis(18),
            Self::Dht22 => Duration::from_micros(1100),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

/// Pack 40 high-pulse widths (µs) into the five frame bytes, MSB first.
pub fn frame_from_pulses(pulses: &[u32]) -> Result<[u8; 5], ReadError> {
    if pulses.len() != FRAME_BITS {
        return Err(ReadError::Bus(format!(
            "short frame: {} of {FRAME_BITS} bits",
            pulses.len()
        )));
    }
    let mut frame = [0u8; 5];
    for (i, width) in pulses.iter().enumerate() {
        if *width > ONE_THRESHOLD_US {
            frame[i / 8] |= 0x80 >> (i % 8);
        }
    }
    Ok(frame)
}

/// Temperature (°C) and relative humidity (%) from a checked frame.
pub fn decode(model: DhtModel, frame: [u8; 5]) -> Result<(f64, f64), ReadError> {
    let computed = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if computed != frame[4] {
        return Err(ReadError::Checksum {
            computed,
            received: frame[4],
        });
    }

    let (temperature, humidity) = match model {
        DhtModel::Dht22 => {
            let humidity = f64::from(u16::from_be_bytes([frame[0], frame[1]])) / 10.0;
            let magnitude = f64::from(u16::from_be_bytes([frame[2] & 0x7f, frame[3]])) / 10.0;
            let sign = if frame[2] & 0x80 != 0 { -1.0 } else { 1.0 };
            (sign * magnitude, humidity)
        }
        DhtModel::Dht11 => {
            let humidity = f64::from(u16::from(frame[0]) * 10 + u16::from(frame[1])) / 10.0;
            let magnitude =
                f64::from(u16::from(frame[2]) * 10 + u16::from(frame[3] & 0x7f)) / 10.0;
            let sign = if frame[3] & 0x80 != 0 { -1.0 } else { 1.0 };
            (sign * magnitude, humidity)
        }
    };

    if !(0.0..=100.0).contains(&humidity) {
        return Err(ReadError::OutOfRange(humidity.round() as i64));
    }
    if !(-40.0..=80.0).contains(&temperature) {
        return Err(ReadError::OutOfRange(temperature.round() as i64));
    }
    Ok((temperature, humidity))
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Captures one raw frame as 40 high-pulse widths in microseconds.
pub trait PulseReader: Send {
    fn read_pulses(&mut self, model: DhtModel) -> Result<Vec<u32>, ReadError>;
}

pub struct DhtSource<L = DhtLine> {
    line: L,
    model: DhtModel,
    min_interval: Duration,
    last_attempt: Option<Instant>,
}

impl<L: PulseReader> DhtSource<L> {
    pub fn new(line: L, model: DhtModel) -> Self {
        Self::with_interval(line, model, MIN_READ_INTERVAL)
    }

    pub fn with_interval(line: L, model: DhtModel, min_interval: Duration) -> Self {
        Self {
            line,
            model,
            min_interval,
            last_attempt: None,
        }
    }

    fn attempt(&mut self) -> Result<(f64, f64), ReadError> {
        if let Some(last) = self.last_attempt {
            let wait = self.min_interval.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }
        self.last_attempt = Some(Instant::now());
        let pulses = self.line.read_pulses(self.model)?;
        decode(self.model, frame_from_pulses(&pulses)?)
    }
}

impl<L: PulseReader> SensorSource for DhtSource<L> {
    fn read(&mut self) -> Result<Vec<MetricValue>, ReadError> {
        let mut last_error = ReadError::NoValue;
        for attempt in 1..=ATTEMPTS {
            match self.attempt() {
                Ok((temperature, humidity)) => {
                    return Ok(vec![
                        MetricValue::new(Metric::Temperature, temperature),
                        MetricValue::new(Metric::Humidity, humidity),
                    ]);
                }
                Err(e @ ReadError::Unsupported(_)) => return Err(e),
                Err(e) => {
                    tracing::debug!(attempt, model = ?self.model, "dht read failed: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

// ---------------------------------------------------------------------------
// Real line (requires rppal + Raspberry Pi GPIO)
// ---------------------------------------------------------------------------

/// Longest wait for any single edge. Real edges come within ~100 µs.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const EDGE_TIMEOUT: Duration = Duration::from_micros(500);

#[cfg(feature = "gpio")]
pub struct DhtLine {
    gpio_pin: u8,
    pin: Option<rppal::gpio::IoPin>,
}

#[cfg(feature = "gpio")]
impl DhtLine {
    pub fn new(gpio_pin: u8) -> Self {
        Self { gpio_pin, pin: None }
    }
}

#[cfg(feature = "gpio")]
impl PulseReader for DhtLine {
    fn read_pulses(&mut self, model: DhtModel) -> Result<Vec<u32>, ReadError> {
        use rppal::gpio::{Gpio, Mode, PullUpDown};

        if self.pin.is_none() {
            let pin = Gpio::new()
                .and_then(|gpio| gpio.get(self.gpio_pin))
                .map_err(|e| ReadError::Bus(e.to_string()))?
                .into_io(Mode::Output);
            tracing::debug!(pin = self.gpio_pin, "dht data line opened");
            self.pin = Some(pin);
        }
        let Some(pin) = self.pin.as_mut() else {
            return Err(ReadError::Bus("gpio pin unavailable".into()));
        };

        // Start signal, then hand the line to the sensor.
        pin.set_mode(Mode::Output);
        pin.set_low();
        thread::sleep(model.start_signal());
        pin.set_high();
        pin.set_mode(Mode::Input);
        pin.set_pullupdown(PullUpDown::PullUp);

        // Response: ~80 µs low, ~80 µs high, then the first bit's low.
        wait_for_level(pin, false)?;
        wait_for_level(pin, true)?;
        wait_for_level(pin, false)?;

        let mut pulses = Vec::with_capacity(FRAME_BITS);
        for _ in 0..FRAME_BITS {
            wait_for_level(pin, true)?;
            let rise = Instant::now();
            wait_for_level(pin, false)?;
            pulses.push(u32::try_from(rise.elapsed().as_micros()).unwrap_or(u32::MAX));
        }
        Ok(pulses)
    }
}

#[cfg(feature = "gpio")]
fn wait_for_level(pin: &rppal::gpio::IoPin, high: bool) -> Result<(), ReadError> {
    let start = Instant::now();
    while pin.is_high() != high {
        if start.elapsed() > EDGE_TIMEOUT {
            return Err(ReadError::Timeout);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stand-in when built without the `gpio` feature
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct DhtLine {
    gpio_pin: u8,
}

#[cfg(not(feature = "gpio"))]
impl DhtLine {
    pub fn new(gpio_pin: u8) -> Self {
        Self { gpio_pin }
    }
}

#[cfg(not(feature = "gpio"))]
impl PulseReader for DhtLine {
    fn read_pulses(&mut self, model: DhtModel) -> Result<Vec<u32>, ReadError> {
        tracing::trace!(pin = self.gpio_pin, ?model, "dht read without gpio support");
        Err(ReadError::Unsupported("DHT sensor"))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
