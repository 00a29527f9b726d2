//! Error values for the sensor, serial and actuator seams.
//!
//! None of these are fatal. Sensor and transport errors demote a connection
//! status, an activation rejection is an ordinary control-flow outcome.

use std::time::Duration;

use crate::actuator::ActivationSource;
use crate::serial::Command;

/// A failed sensor read. Transient by default: the channel keeps polling.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadError {
    /// The bus or device returned an error.
    #[error("bus error: {0}")]
    Bus(String),

    /// The device never signalled a finished conversion.
    #[error("read timed out")]
    Timeout,

    /// The device answered with nothing usable.
    #[error("sensor returned no value")]
    NoValue,

    /// A raw value outside the range the device can physically produce.
    #[error("raw value {0} out of range")]
    OutOfRange(i64),

    /// A frame arrived but its checksum byte disagrees with its payload.
    #[error("checksum mismatch: computed 0x{computed:02x}, received 0x{received:02x}")]
    Checksum { computed: u8, received: u8 },

    /// This build cannot talk to the requested hardware.
    #[error("{0} not supported in this build")]
    Unsupported(&'static str),
}

/// A failure on the controller link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Auto-probe found nothing that looks like a controller.
    #[error("no serial controller found")]
    NoPortFound,

    /// Opening the port failed (busy, missing, permissions).
    #[error("failed to open serial port {port}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// Write or read failed mid-exchange.
    #[error("serial i/o error")]
    Io(#[from] std::io::Error),

    /// No matching response line arrived in time.
    #[error("no {expected} response to {command} within {timeout:?}")]
    Timeout {
        command: Command,
        expected: &'static str,
        timeout: Duration,
    },

    /// The link fell back to simulation earlier; no hardware to talk to.
    #[error("controller hardware absent")]
    HardwareAbsent,

    /// The blocking worker carrying the exchange was lost.
    #[error("serial worker failed: {0}")]
    Worker(String),

    /// Driving the relay pin failed.
    #[error("relay error: {0}")]
    Relay(String),
}

/// Why an activation request was refused.
#[derive(Debug, thiserror::Error)]
pub enum Rejected {
    /// One activation is already in flight.
    #[error("pump already running ({holder})")]
    AlreadyOn { holder: ActivationSource },

    /// The link is gone and simulation fallback is disabled.
    #[error("pump controller unavailable")]
    LinkUnavailable(#[source] TransportError),

    /// Zero-length or overlong activations are refused.
    #[error("activation duration must be positive and at most 24h")]
    InvalidDuration,
}
