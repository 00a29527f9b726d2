//! TOML config file loading and validation for the link, pump, sensor
//! channels, threshold rules and schedules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::UtcOffset;

use crate::actuator::MAX_ACTIVATION;
use crate::auto_response::{Comparison, RuleAction, ThresholdRule};
use crate::scheduler::{parse_timezone, parse_utc_offset, ScheduleEntry, ScheduleZone};
use crate::sensor::{
    Calibration, DhtModel, HardwarePins, Metric, Mode, SensorKind, MAX_CHANNEL, RAW_MAX,
};
use crate::serial::DEFAULT_BAUD;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialSection,
    #[serde(default)]
    pub pump: PumpSection,
    #[serde(default)]
    pub polling: PollingSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub auto_response: AutoResponseSection,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    /// Absent means probe for a controller.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
    /// Wait after opening while the board resets.
    pub settle_ms: u64,
    /// STATUS probe period; 0 disables.
    pub health_check_secs: u64,
    /// Let the health check re-probe a link that fell back to simulation.
    pub auto_reprobe: bool,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD,
            response_timeout_ms: 1000,
            settle_ms: 2000,
            health_check_secs: 5,
            auto_reprobe: false,
        }
    }
}

impl SerialSection {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpDriver {
    Serial,
    Gpio,
    Simulated,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PumpSection {
    pub driver: PumpDriver,
    /// Many common relay boards are active-low.
    pub active_low: bool,
    pub gpio_pin: Option<i64>,
    pub default_duration_secs: f64,
    /// Apply commands locally when the controller cannot be reached.
    pub simulate_when_absent: bool,
}

impl Default for PumpSection {
    fn default() -> Self {
        Self {
            driver: PumpDriver::Serial,
            active_low: true,
            gpio_pin: None,
            default_duration_secs: 2.0,
            simulate_when_absent: true,
        }
    }
}

impl PumpSection {
    /// Falls back to two seconds when the configured value is unusable.
    pub fn default_duration(&self) -> Duration {
        activation(self.default_duration_secs).unwrap_or(Duration::from_secs(2))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub interval_secs: u64,
    /// Consecutive failed reads before a channel is reported disconnected.
    pub demote_after: u32,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            demote_after: 1,
        }
    }
}

impl PollingSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_secs: u64,
    /// IANA zone such as "Europe/Berlin". Follows daylight saving.
    pub timezone: Option<String>,
    /// Fixed offset such as "+02:00". Overrides `timezone`. With neither set
    /// the host's local offset is used.
    pub utc_offset: Option<String>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: 15,
            timezone: None,
            utc_offset: None,
        }
    }
}

impl SchedulerSection {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Zone schedules are evaluated in. Falls back to UTC when the local
    /// offset cannot be determined.
    pub fn zone(&self) -> ScheduleZone {
        if let Some(s) = &self.utc_offset {
            return ScheduleZone::Fixed(parse_utc_offset(s).unwrap_or(UtcOffset::UTC));
        }
        if let Some(tz) = self.timezone.as_deref().and_then(|s| parse_timezone(s).ok()) {
            return ScheduleZone::Named(tz);
        }
        ScheduleZone::Fixed(UtcOffset::current_local_offset().unwrap_or_else(|_| {
            tracing::warn!("local utc offset unavailable, scheduling in UTC");
            UtcOffset::UTC
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AutoResponseSection {
    pub enabled: bool,
}

impl Default for AutoResponseSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_mode() -> Mode {
    Mode::Simulated
}

fn default_i2c_address() -> u16 {
    0x48
}

fn default_raw_dry() -> i64 {
    Calibration::default().raw_dry
}

fn default_raw_wet() -> i64 {
    Calibration::default().raw_wet
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub id: String,
    pub kind: SensorKind,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub adc_channel: i64,
    #[serde(default = "default_i2c_address")]
    pub i2c_address: u16,
    #[serde(default = "default_raw_dry")]
    pub raw_dry: i64,
    #[serde(default = "default_raw_wet")]
    pub raw_wet: i64,
    /// BCM data pin of a hardware temperature/humidity sensor.
    #[serde(default)]
    pub pin: Option<i64>,
    #[serde(default)]
    pub dht_model: DhtModel,
}

impl ChannelEntry {
    pub fn pins(&self) -> HardwarePins {
        HardwarePins {
            i2c_address: self.i2c_address,
            adc_channel: usize::try_from(self.adc_channel).unwrap_or_default(),
            calibration: Calibration {
                raw_dry: self.raw_dry,
                raw_wet: self.raw_wet,
            },
            data_pin: self.pin.and_then(|p| u8::try_from(p).ok()),
            dht_model: self.dht_model,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleActionKind {
    #[default]
    Activate,
    Deactivate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub id: String,
    pub metric: Metric,
    pub comparison: Comparison,
    pub bound: f64,
    #[serde(default)]
    pub action: RuleActionKind,
    /// Activate only. Absent means the pump's default duration.
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub cooldown_secs: f64,
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

const TICK_RANGE: std::ops::RangeInclusive<u64> = 1..=60;

/// A configured activation length, if it is positive and at most a day.
fn activation(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero() && *d <= MAX_ACTIVATION)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_sections(&mut errors);
        self.validate_channels(&mut errors);
        self.validate_rules(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_sections(&self, errors: &mut Vec<String>) {
        let s = &self.serial;
        if s.port.as_deref().is_some_and(|p| p.trim().is_empty()) {
            errors.push("serial: port is empty (omit it to auto-probe)".into());
        }
        if s.baud_rate == 0 {
            errors.push("serial: baud_rate must be positive".into());
        }
        if s.response_timeout_ms == 0 {
            errors.push("serial: response_timeout_ms must be positive".into());
        }

        let p = &self.pump;
        if activation(p.default_duration_secs).is_none() {
            errors.push(format!(
                "pump: default_duration_secs must be positive and at most {}, got {}",
                MAX_ACTIVATION.as_secs(),
                p.default_duration_secs
            ));
        }
        match (p.driver, p.gpio_pin) {
            (PumpDriver::Gpio, None) => {
                errors.push("pump: driver \"gpio\" requires gpio_pin".into());
            }
            (_, Some(pin)) if !VALID_GPIO_PINS.contains(&pin) => {
                errors.push(format!(
                    "pump: gpio_pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
            _ => {}
        }

        if self.polling.interval_secs == 0 {
            errors.push("polling: interval_secs must be positive".into());
        }
        if self.polling.demote_after == 0 {
            errors.push("polling: demote_after must be at least 1".into());
        }

        if !TICK_RANGE.contains(&self.scheduler.tick_secs) {
            errors.push(format!(
                "scheduler: tick_secs {} out of range [1, 60]",
                self.scheduler.tick_secs
            ));
        }
        if let Some(Err(e)) = self.scheduler.utc_offset.as_deref().map(parse_utc_offset) {
            errors.push(format!("scheduler: {e}"));
        }
        if let Some(Err(e)) = self.scheduler.timezone.as_deref().map(parse_timezone) {
            errors.push(format!("scheduler: {e}"));
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, c) in self.channels.iter().enumerate() {
            let ctx = || {
                if c.id.is_empty() {
                    format!("channels[{i}]")
                } else {
                    format!("channel '{}'", c.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if c.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&c.id) {
                errors.push(format!("{}: duplicate channel id", ctx()));
            }

            // ── Wiring ──────────────────────────────────────────
            if !(0..=MAX_CHANNEL as i64).contains(&c.adc_channel) {
                errors.push(format!(
                    "{}: adc_channel {} out of range [0, {MAX_CHANNEL}]",
                    ctx(),
                    c.adc_channel
                ));
            }
            if c.i2c_address > 0x7f {
                errors.push(format!(
                    "{}: i2c_address 0x{:x} is not a 7-bit address",
                    ctx(),
                    c.i2c_address
                ));
            }

            if let Some(pin) = c.pin {
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "{}: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx()
                    ));
                } else if self.pump.driver == PumpDriver::Gpio && self.pump.gpio_pin == Some(pin) {
                    errors.push(format!("{}: pin {pin} is already the pump relay pin", ctx()));
                }
            }
            if c.kind == SensorKind::TemperatureHumidity
                && c.mode == Mode::Hardware
                && c.pin.is_none()
            {
                errors.push(format!(
                    "{}: hardware temperature_humidity channel requires pin",
                    ctx()
                ));
            }

            // ── ADC calibration bounds ──────────────────────────
            if c.kind == SensorKind::SoilMoisture {
                for (name, raw) in [("raw_dry", c.raw_dry), ("raw_wet", c.raw_wet)] {
                    if !(0..=RAW_MAX).contains(&raw) {
                        errors.push(format!(
                            "{}: {name} {raw} out of ADS1115 range [0, {RAW_MAX}]",
                            ctx()
                        ));
                    }
                }
                if c.raw_dry == c.raw_wet {
                    errors.push(format!(
                        "{}: raw_dry and raw_wet are both {}, calibration range is zero",
                        ctx(),
                        c.raw_dry
                    ));
                }
            }
        }
    }

    fn validate_rules(&self, errors: &mut Vec<String>) {
        let produced: HashSet<Metric> = self
            .channels
            .iter()
            .flat_map(|c| c.kind.metrics().iter().copied())
            .collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, r) in self.rules.iter().enumerate() {
            let ctx = || {
                if r.id.is_empty() {
                    format!("rules[{i}]")
                } else {
                    format!("rule '{}'", r.id)
                }
            };

            if r.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&r.id) {
                errors.push(format!("{}: duplicate rule id", ctx()));
            }

            if !produced.contains(&r.metric) {
                errors.push(format!(
                    "{}: no configured channel produces metric '{}'",
                    ctx(),
                    r.metric
                ));
            }
            if !r.bound.is_finite() {
                errors.push(format!("{}: bound must be a finite number", ctx()));
            }
            if let Some(d) = r.duration_secs {
                if activation(d).is_none() {
                    errors.push(format!(
                        "{}: duration_secs must be positive and at most {}, got {d}",
                        ctx(),
                        MAX_ACTIVATION.as_secs()
                    ));
                }
            }
            if Duration::try_from_secs_f64(r.cooldown_secs).is_err() {
                errors.push(format!(
                    "{}: cooldown_secs must be zero or positive, got {}",
                    ctx(),
                    r.cooldown_secs
                ));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || {
                if s.id.is_empty() {
                    format!("schedules[{i}]")
                } else {
                    format!("schedule '{}'", s.id)
                }
            };

            if s.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&s.id) {
                errors.push(format!("{}: duplicate schedule id", ctx()));
            }
            if s.duration().is_none() {
                errors.push(format!(
                    "{}: duration_secs must be positive and at most {}, got {}",
                    ctx(),
                    MAX_ACTIVATION.as_secs(),
                    s.duration_secs
                ));
            }
        }
    }

    /// Threshold rules in configuration order. Assumes a validated config.
    pub fn threshold_rules(&self) -> Vec<ThresholdRule> {
        self.rules
            .iter()
            .map(|r| ThresholdRule {
                id: r.id.clone(),
                metric: r.metric,
                comparison: r.comparison,
                bound: r.bound,
                action: match r.action {
                    RuleActionKind::Activate => RuleAction::Activate {
                        duration: r
                            .duration_secs
                            .and_then(activation)
                            .unwrap_or_else(|| self.pump.default_duration()),
                    },
                    RuleActionKind::Deactivate => RuleAction::Deactivate,
                },
                cooldown: Duration::try_from_secs_f64(r.cooldown_secs).unwrap_or(Duration::MAX),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::DayOfWeek;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_channel() -> ChannelEntry {
        ChannelEntry {
            id: "soil".into(),
            kind: SensorKind::SoilMoisture,
            mode: Mode::Simulated,
            adc_channel: 0,
            i2c_address: 0x48,
            raw_dry: 26000,
            raw_wet: 12000,
            pin: None,
            dht_model: DhtModel::Dht22,
        }
    }

    fn valid_rule() -> RuleEntry {
        RuleEntry {
            id: "dry".into(),
            metric: Metric::Moisture,
            comparison: Comparison::Below,
            bound: 30.0,
            action: RuleActionKind::Activate,
            duration_secs: Some(5.0),
            cooldown_secs: 300.0,
        }
    }

    fn valid_schedule() -> ScheduleEntry {
        ScheduleEntry {
            id: "morning".into(),
            time: "08:00".parse().unwrap(),
            days: vec![],
            duration_secs: 2.0,
            enabled: true,
        }
    }

    fn valid_config() -> Config {
        Config {
            channels: vec![valid_channel()],
            rules: vec![valid_rule()],
            schedules: vec![valid_schedule()],
            ..Config::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[serial]
port = "/dev/ttyACM0"
response_timeout_ms = 800

[pump]
driver = "serial"
default_duration_secs = 3.5

[polling]
interval_secs = 10

[scheduler]
tick_secs = 20
utc_offset = "+02:00"

[[channels]]
id = "soil"
kind = "soil_moisture"
mode = "hardware"
adc_channel = 1

[[channels]]
id = "air"
kind = "temperature_humidity"

[[rules]]
id = "dry"
metric = "moisture"
comparison = "<"
bound = 30
duration_secs = 5
cooldown_secs = 300

[[rules]]
id = "wet"
metric = "moisture"
comparison = "above"
bound = 80
action = "deactivate"

[[schedules]]
id = "morning"
time = "07:30"
days = ["mon", "wed", "fri"]
duration_secs = 10
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.response_timeout(), Duration::from_millis(800));
        assert_eq!(config.pump.driver, PumpDriver::Serial);
        assert!(config.pump.active_low);
        assert_eq!(config.channels[0].mode, Mode::Hardware);
        assert_eq!(config.channels[0].pins().adc_channel, 1);
        assert_eq!(config.channels[1].mode, Mode::Simulated);
        assert_eq!(config.rules[1].action, RuleActionKind::Deactivate);
        assert_eq!(
            config.schedules[0].days,
            vec![DayOfWeek::Mon, DayOfWeek::Wed, DayOfWeek::Fri]
        );
        assert_eq!(
            config.scheduler.zone(),
            ScheduleZone::Fixed(UtcOffset::from_hms(2, 0, 0).unwrap())
        );
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert!(config.channels.is_empty());
        assert_eq!(config.serial.port, None);
        assert_eq!(config.serial.health_check_secs, 5);
        assert_eq!(config.pump.default_duration(), Duration::from_secs(2));
        assert!(config.pump.simulate_when_absent);
        assert_eq!(config.polling.interval(), Duration::from_secs(30));
        assert_eq!(config.scheduler.tick(), Duration::from_secs(15));
        assert!(config.auto_response.enabled);
    }

    #[test]
    fn bundled_example_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../../../garden.toml")).unwrap();
        config.validate().unwrap();
        assert!(!config.channels.is_empty());
    }

    #[test]
    fn bad_time_fails_to_parse() {
        let toml_str = r#"
[[schedules]]
id = "x"
time = "25:00"
duration_secs = 1
"#;
        let err = toml::from_str::<Config>(toml_str).unwrap_err();
        assert!(err.to_string().contains("invalid time '25:00'"), "{err}");
    }

    // -- Conversion -------------------------------------------------------

    #[test]
    fn rules_fall_back_to_default_duration() {
        let mut cfg = valid_config();
        cfg.rules[0].duration_secs = None;
        cfg.pump.default_duration_secs = 4.0;
        let rules = cfg.threshold_rules();
        assert_eq!(
            rules[0].action,
            RuleAction::Activate {
                duration: Duration::from_secs(4)
            }
        );
        assert_eq!(rules[0].cooldown, Duration::from_secs(300));
    }

    // -- Validation: baseline ---------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn all_errors_are_reported_together() {
        let mut cfg = valid_config();
        cfg.channels[0].id = "".into();
        cfg.schedules[0].duration_secs = 0.0;
        cfg.scheduler.tick_secs = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("(3 errors)"), "{msg}");
    }

    // -- Validation: sections ---------------------------------------------

    #[test]
    fn tick_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.scheduler.tick_secs = 61;
        assert_validation_err(&cfg, "tick_secs 61 out of range");
    }

    #[test]
    fn bad_utc_offset_rejected() {
        let mut cfg = valid_config();
        cfg.scheduler.utc_offset = Some("two hours".into());
        assert_validation_err(&cfg, "invalid utc offset 'two hours'");
    }

    #[test]
    fn timezone_is_parsed_and_overridden_by_fixed_offset() {
        let mut cfg = valid_config();
        cfg.scheduler.timezone = Some("Europe/Berlin".into());
        cfg.validate().unwrap();
        assert_eq!(cfg.scheduler.zone().name(), Some("Europe/Berlin"));

        cfg.scheduler.utc_offset = Some("-05:00".into());
        assert_eq!(
            cfg.scheduler.zone(),
            ScheduleZone::Fixed(UtcOffset::from_hms(-5, 0, 0).unwrap())
        );

        cfg.scheduler.timezone = Some("Europe/Atlantis".into());
        assert_validation_err(&cfg, "unknown timezone 'Europe/Atlantis'");
    }

    #[test]
    fn gpio_driver_requires_pin() {
        let mut cfg = valid_config();
        cfg.pump.driver = PumpDriver::Gpio;
        assert_validation_err(&cfg, "requires gpio_pin");

        cfg.pump.gpio_pin = Some(1);
        assert_validation_err(&cfg, "gpio_pin 1 is not a valid BCM GPIO pin");

        cfg.pump.gpio_pin = Some(17);
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_default_duration_rejected() {
        let mut cfg = valid_config();
        cfg.pump.default_duration_secs = 0.0;
        assert_validation_err(&cfg, "default_duration_secs must be positive");
    }

    #[test]
    fn overlong_durations_rejected() {
        let mut cfg = valid_config();
        cfg.pump.default_duration_secs = 1e300;
        cfg.rules[0].duration_secs = Some(f64::INFINITY);
        cfg.rules[0].cooldown_secs = 1e300;
        cfg.schedules[0].duration_secs = 86_401.0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("(4 errors)"), "{msg}");
        assert!(msg.contains("default_duration_secs must be positive and at most 86400"));

        // Unvalidated values never panic on conversion.
        assert_eq!(cfg.pump.default_duration(), Duration::from_secs(2));
        let rules = cfg.threshold_rules();
        assert_eq!(
            rules[0].action,
            RuleAction::Activate {
                duration: Duration::from_secs(2)
            }
        );
        assert_eq!(rules[0].cooldown, Duration::MAX);
    }

    #[test]
    fn empty_port_rejected() {
        let mut cfg = valid_config();
        cfg.serial.port = Some(" ".into());
        assert_validation_err(&cfg, "port is empty");
    }

    // -- Validation: channels ---------------------------------------------

    #[test]
    fn channel_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.channels.push(valid_channel());
        assert_validation_err(&cfg, "duplicate channel id");
    }

    #[test]
    fn channel_adc_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].adc_channel = 4;
        assert_validation_err(&cfg, "adc_channel 4 out of range [0, 3]");
    }

    #[test]
    fn channel_zero_calibration_range_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].raw_wet = 26000;
        assert_validation_err(&cfg, "calibration range is zero");
    }

    #[test]
    fn channel_calibration_out_of_adc_range_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].raw_dry = 40000;
        assert_validation_err(&cfg, "raw_dry 40000 out of ADS1115 range");
    }

    #[test]
    fn hardware_dht_channel_requires_valid_pin() {
        let mut cfg = valid_config();
        cfg.channels.push(ChannelEntry {
            id: "air".into(),
            kind: SensorKind::TemperatureHumidity,
            mode: Mode::Hardware,
            ..valid_channel()
        });
        assert_validation_err(&cfg, "channel 'air': hardware temperature_humidity channel requires pin");

        cfg.channels[1].pin = Some(40);
        assert_validation_err(&cfg, "pin 40 is not a valid BCM GPIO pin");

        cfg.pump.driver = PumpDriver::Gpio;
        cfg.pump.gpio_pin = Some(4);
        cfg.channels[1].pin = Some(4);
        assert_validation_err(&cfg, "pin 4 is already the pump relay pin");

        cfg.channels[1].pin = Some(17);
        cfg.channels[1].dht_model = DhtModel::Dht11;
        cfg.validate().unwrap();
        let pins = cfg.channels[1].pins();
        assert_eq!(pins.data_pin, Some(17));
        assert_eq!(pins.dht_model, DhtModel::Dht11);
    }

    #[test]
    fn dht_fields_parse() {
        let config: Config = toml::from_str(
            r#"
[[channels]]
id = "air"
kind = "temperature_humidity"
mode = "hardware"
pin = 4
dht_model = "dht11"
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.channels[0].pins().data_pin, Some(4));
        assert_eq!(config.channels[0].dht_model, DhtModel::Dht11);
    }

    // -- Validation: rules & schedules ------------------------------------

    #[test]
    fn rule_on_unproduced_metric_rejected() {
        let mut cfg = valid_config();
        cfg.rules[0].metric = Metric::Co2;
        assert_validation_err(&cfg, "no configured channel produces metric 'co2'");
    }

    #[test]
    fn rule_negative_cooldown_rejected() {
        let mut cfg = valid_config();
        cfg.rules[0].cooldown_secs = -1.0;
        assert_validation_err(&cfg, "cooldown_secs must be zero or positive");
    }

    #[test]
    fn rule_zero_duration_rejected() {
        let mut cfg = valid_config();
        cfg.rules[0].duration_secs = Some(0.0);
        assert_validation_err(&cfg, "duration_secs must be positive");
    }

    #[test]
    fn schedule_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.schedules.push(valid_schedule());
        assert_validation_err(&cfg, "duplicate schedule id");
    }
}
