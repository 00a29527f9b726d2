//! Pump relay driven straight from a GPIO pin. The `gpio` feature gates the
//! real rppal driver; without it opening the relay fails and the pump falls
//! back to simulation.

use crate::error::TransportError;

/// Pin level that puts the relay in the requested state.
/// Active-low boards energise on LOW.
pub fn level_is_high(on: bool, active_low: bool) -> bool {
    on != active_low
}

// ---------------------------------------------------------------------------
// Real relay (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RelayPin {
    pin: rppal::gpio::OutputPin,
    gpio_pin: u8,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayPin {
    /// Claim the pin and drive the relay OFF before anything else.
    pub fn open(gpio_pin: u8, active_low: bool) -> Result<Self, TransportError> {
        let gpio = rppal::gpio::Gpio::new().map_err(|e| TransportError::Relay(e.to_string()))?;
        let pin = gpio
            .get(gpio_pin)
            .map_err(|e| TransportError::Relay(e.to_string()))?
            .into_output();

        let mut relay = Self {
            pin,
            gpio_pin,
            active_low,
        };
        relay.set(false)?;
        tracing::info!(gpio = gpio_pin, active_low, "pump relay ready");
        Ok(relay)
    }

    pub fn set(&mut self, on: bool) -> Result<(), TransportError> {
        if level_is_high(on, self.active_low) {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        tracing::debug!(gpio = self.gpio_pin, on, "pump relay set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stand-in when built without the `gpio` feature
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct RelayPin {
    gpio_pin: u8,
}

#[cfg(not(feature = "gpio"))]
impl RelayPin {
    pub fn open(gpio_pin: u8, _active_low: bool) -> Result<Self, TransportError> {
        tracing::trace!(gpio = gpio_pin, "relay requested without gpio support");
        Err(TransportError::Relay(format!(
            "gpio {gpio_pin} unavailable: built without gpio support"
        )))
    }

    pub fn set(&mut self, _on: bool) -> Result<(), TransportError> {
        Err(TransportError::Relay(format!(
            "gpio {} unavailable: built without gpio support",
            self.gpio_pin
        )))
    }
}
