//! Sensor channels. Each channel wraps one physical or simulated sensor,
//! produces timestamped readings and tracks whether the hardware behind it
//! is actually answering.
//!
//! Simulated channels always read successfully but never claim to be
//! connected. Hardware channels are promoted on the first good read and
//! demoted through [`ConnectionSupervisor`] when reads start failing.

mod adc;
mod analog;
mod dht;
mod sim;
mod supervisor;

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ReadError;

pub use adc::{AnalogInput, MAX_CHANNEL, RAW_MAX};
pub use analog::{AnalogSource, Calibration, UnsupportedSource};
pub use dht::{DhtLine, DhtModel, DhtSource};
pub use sim::SimulatedSource;
pub use supervisor::{ConnectionSupervisor, Transition};

// ---------------------------------------------------------------------------
// Kinds, metrics, modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    TemperatureHumidity,
    SoilMoisture,
    Light,
    AirQuality,
}

impl SensorKind {
    /// Metrics a channel of this kind reports, in reading order.
    pub fn metrics(self) -> &'static [Metric] {
        match self {
            Self::TemperatureHumidity => &[Metric::Temperature, Metric::Humidity],
            Self::SoilMoisture => &[Metric::Moisture],
            Self::Light => &[Metric::Light, Metric::LightLevel],
            Self::AirQuality => &[Metric::AirQuality, Metric::Co2, Metric::Nh3, Metric::Nox],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Degrees Celsius.
    Temperature,
    /// Relative humidity, percent.
    Humidity,
    /// Soil moisture, percent.
    Moisture,
    /// Illuminance, lux.
    Light,
    /// Illuminance as a percentage of full scale.
    LightLevel,
    /// Air quality index, 0..=500.
    AirQuality,
    /// Parts per million.
    Co2,
    Nh3,
    Nox,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Moisture => "moisture",
            Self::Light => "light",
            Self::LightLevel => "light_level",
            Self::AirQuality => "air_quality",
            Self::Co2 => "co2",
            Self::Nh3 => "nh3",
            Self::Nox => "nox",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Simulated,
    Hardware,
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricValue {
    pub metric: Metric,
    pub value: f64,
}

impl MetricValue {
    pub fn new(metric: Metric, value: f64) -> Self {
        Self { metric, value }
    }
}

/// One poll result. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub channel_id: String,
    pub values: Vec<MetricValue>,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub connected: bool,
}

impl SensorReading {
    pub fn value(&self, metric: Metric) -> Option<f64> {
        self.values
            .iter()
            .find(|v| v.metric == metric)
            .map(|v| v.value)
    }
}

/// Something that can be asked for the current values of a sensor.
///
/// Reads are blocking and must return within a bounded time.
pub trait SensorSource: Send {
    fn read(&mut self) -> Result<Vec<MetricValue>, ReadError>;

    /// Told whenever the pump starts or stops. Only simulations care.
    fn set_watering(&mut self, _on: bool) {}
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Snapshot of a channel's internal state.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    pub mode: Mode,
    pub connected: bool,
    pub consecutive_failures: u32,
    pub last_reading: Option<SensorReading>,
}

/// What the status surface shows for a channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub id: String,
    pub kind: SensorKind,
    pub mode: Mode,
    pub connected: bool,
    pub consecutive_failures: u32,
    pub last_values: Vec<MetricValue>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reading_time: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

pub struct SensorChannel {
    id: String,
    kind: SensorKind,
    mode: Mode,
    source: Box<dyn SensorSource>,
    supervisor: ConnectionSupervisor,
    last_reading: Option<SensorReading>,
    last_error: Option<ReadError>,
    transitions: Vec<Transition>,
    status_tx: watch::Sender<ChannelStatus>,
}

impl SensorChannel {
    /// Build a channel and seed its status with one read attempt.
    ///
    /// A failed first read is not an error: the channel stays disconnected
    /// and keeps retrying on every poll.
    pub fn new(
        id: impl Into<String>,
        kind: SensorKind,
        mode: Mode,
        source: Box<dyn SensorSource>,
        demote_after: u32,
    ) -> Self {
        let id = id.into();
        let supervisor = ConnectionSupervisor::new(demote_after);
        let (status_tx, _) = watch::channel(ChannelStatus {
            id: id.clone(),
            kind,
            mode,
            connected: false,
            consecutive_failures: 0,
            last_values: Vec::new(),
            last_reading_time: None,
            last_error: None,
        });

        let mut channel = Self {
            id,
            kind,
            mode,
            source,
            supervisor,
            last_reading: None,
            last_error: None,
            transitions: Vec::new(),
            status_tx,
        };

        match channel.poll() {
            Ok(_) => debug!(channel = %channel.id, ?mode, "sensor initialised"),
            Err(e) => warn!(
                channel = %channel.id,
                ?mode,
                "initial sensor read failed, retrying every poll: {e}"
            ),
        }
        channel
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Read the sensor once and update connectivity from the outcome.
    pub fn poll(&mut self) -> Result<SensorReading, ReadError> {
        let captured_at = OffsetDateTime::now_utc();
        let outcome = match self.source.read() {
            Ok(values) if values.is_empty() => Err(ReadError::NoValue),
            Ok(values) if values.iter().any(|v| !v.value.is_finite()) => {
                Err(ReadError::NoValue)
            }
            other => other,
        };

        let result = match outcome {
            Ok(values) => {
                match self.mode {
                    Mode::Hardware => {
                        if let Some(t) = self.supervisor.record_success() {
                            info!(channel = %self.id, "sensor connected");
                            self.transitions.push(t);
                        }
                    }
                    Mode::Simulated => self.supervisor.record_simulated(),
                }
                let reading = SensorReading {
                    channel_id: self.id.clone(),
                    values,
                    captured_at,
                    connected: self.supervisor.connected(),
                };
                self.last_reading = Some(reading.clone());
                self.last_error = None;
                Ok(reading)
            }
            Err(e) => {
                if let Some(t) = self.supervisor.record_failure() {
                    warn!(channel = %self.id, "sensor disconnected: {e}");
                    self.transitions.push(t);
                } else {
                    debug!(
                        channel = %self.id,
                        failures = self.supervisor.consecutive_failures(),
                        "sensor read failed: {e}"
                    );
                }
                self.last_error = Some(e.clone());
                Err(e)
            }
        };

        self.status_tx.send_replace(self.get_status());
        result
    }

    /// Pure read of current state; never touches the hardware.
    pub fn get_status(&self) -> ChannelStatus {
        ChannelStatus {
            id: self.id.clone(),
            kind: self.kind,
            mode: self.mode,
            connected: self.supervisor.connected(),
            consecutive_failures: self.supervisor.consecutive_failures(),
            last_values: self
                .last_reading
                .as_ref()
                .map(|r| r.values.clone())
                .unwrap_or_default(),
            last_reading_time: self.last_reading.as_ref().map(|r| r.captured_at),
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    pub fn state(&self) -> SensorState {
        SensorState {
            mode: self.mode,
            connected: self.supervisor.connected(),
            consecutive_failures: self.supervisor.consecutive_failures(),
            last_reading: self.last_reading.clone(),
        }
    }

    /// Status updates published after every poll.
    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Connectivity transitions since the last call, oldest first.
    pub fn drain_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    pub fn set_watering(&mut self, on: bool) {
        self.source.set_watering(on);
    }
}

// ---------------------------------------------------------------------------
// Source construction
// ---------------------------------------------------------------------------

/// Hardware wiring for one channel.
#[derive(Debug, Clone, Copy)]
pub struct HardwarePins {
    pub i2c_address: u16,
    pub adc_channel: usize,
    pub calibration: Calibration,
    /// BCM pin of a DHT data line.
    pub data_pin: Option<u8>,
    pub dht_model: DhtModel,
}

/// Pick the source for a channel. Decided once, at construction.
pub fn open_source(kind: SensorKind, mode: Mode, pins: HardwarePins) -> Box<dyn SensorSource> {
    match (mode, kind) {
        (Mode::Simulated, _) => Box::new(SimulatedSource::new(kind)),
        (Mode::Hardware, SensorKind::TemperatureHumidity) => match pins.data_pin {
            Some(pin) => Box::new(DhtSource::new(DhtLine::new(pin), pins.dht_model)),
            None => Box::new(UnsupportedSource::new("DHT sensor without a data pin")),
        },
        (Mode::Hardware, _) => Box::new(AnalogSource::new(
            kind,
            AnalogInput::new(pins.i2c_address, pins.adc_channel),
            pins.calibration,
        )),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
