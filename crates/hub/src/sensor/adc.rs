//! ADS1115 16-bit ADC input over I2C.
//!
//! Single-ended reads at PGA ±4.096 V, 128 SPS, single-shot mode. The `adc`
//! feature gates the real rppal driver; without it every read reports
//! [`ReadError::Unsupported`] so hardware channels stay disconnected.

use crate::error::ReadError;

// ── ADS1115 register map ────────────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const REG_CONFIG: u8 = 0x01;

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for AINx vs GND.
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// Highest single-ended input index.
pub const MAX_CHANNEL: usize = 3;

/// Full-scale voltage for the configured PGA.
pub const FULL_SCALE_VOLTS: f64 = 4.096;

/// Largest single-ended conversion result.
pub const RAW_MAX: i64 = 32767;

/// Bit 15 of the config register reads back as 1 once a conversion is done.
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const OS_READY_BIT: u16 = 1 << 15;

/// Config register value for a single-ended read on `channel`.
fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel.min(MAX_CHANNEL)] << MUX_SHIFT)
}

// ---------------------------------------------------------------------------
// Real input (requires rppal + Raspberry Pi I2C)
// ---------------------------------------------------------------------------

#[cfg(feature = "adc")]
pub struct AnalogInput {
    address: u16,
    channel: usize,
    bus: Option<rppal::i2c::I2c>,
}

#[cfg(feature = "adc")]
impl AnalogInput {
    pub fn new(address: u16, channel: usize) -> Self {
        Self {
            address,
            channel,
            bus: None,
        }
    }

    /// Single-shot conversion. The bus is opened lazily and dropped on any
    /// error so the next read starts from a fresh handle.
    pub fn read_raw(&mut self) -> Result<i16, ReadError> {
        use std::{thread, time::Duration};

        /// Conversion time at 128 SPS is ~7.8 ms.
        const CONVERSION_WAIT: Duration = Duration::from_millis(9);
        const READY_POLLS: usize = 3;

        let result = (|| {
            if self.bus.is_none() {
                let mut i2c = rppal::i2c::I2c::new().map_err(bus_error)?;
                i2c.set_slave_address(self.address).map_err(bus_error)?;
                tracing::debug!(
                    addr = format_args!("0x{:02x}", self.address),
                    channel = self.channel,
                    "ads1115 bus opened"
                );
                self.bus = Some(i2c);
            }
            let Some(i2c) = self.bus.as_mut() else {
                return Err(ReadError::Bus("i2c bus unavailable".into()));
            };

            let config = config_for_channel(self.channel).to_be_bytes();
            i2c.block_write(REG_CONFIG, &config).map_err(bus_error)?;
            thread::sleep(CONVERSION_WAIT);

            let mut ready = false;
            for _ in 0..READY_POLLS {
                let mut buf = [0u8; 2];
                i2c.block_read(REG_CONFIG, &mut buf).map_err(bus_error)?;
                if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                    ready = true;
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
            if !ready {
                return Err(ReadError::Timeout);
            }

            let mut buf = [0u8; 2];
            i2c.block_read(REG_CONVERSION, &mut buf).map_err(bus_error)?;
            Ok(i16::from_be_bytes(buf))
        })();

        if result.is_err() {
            self.bus = None;
        }
        result
    }
}

#[cfg(feature = "adc")]
fn bus_error(e: rppal::i2c::Error) -> ReadError {
    ReadError::Bus(e.to_string())
}

// ---------------------------------------------------------------------------
// Stand-in when built without the `adc` feature
// ---------------------------------------------------------------------------

#[cfg(not(feature = "adc"))]
pub struct AnalogInput {
    address: u16,
    channel: usize,
}

#[cfg(not(feature = "adc"))]
impl AnalogInput {
    pub fn new(address: u16, channel: usize) -> Self {
        Self { address, channel }
    }

    pub fn read_raw(&mut self) -> Result<i16, ReadError> {
        tracing::trace!(
            addr = format_args!("0x{:02x}", self.address),
            channel = self.channel,
            "ads1115 read without adc support"
        );
        Err(ReadError::Unsupported("ADS1115 analog input"))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
