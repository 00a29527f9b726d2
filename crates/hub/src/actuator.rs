//! The pump. One [`ActuatorDriver`] per process, shared by the auto-response
//! engine, the scheduler and manual commands.
//!
//! Every state change and every command to the output happens under one
//! lock, so two callers can never both believe they started the pump. Each
//! activation arms its own auto-off timer. Timers carry the generation they
//! were armed for; a timer from an activation that was since replaced or
//! cancelled finds a newer generation and does nothing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{Rejected, TransportError};
use crate::relay::RelayPin;
use crate::serial::{Command, SerialLink};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSource {
    Manual,
    AutoResponse,
    Schedule,
}

impl fmt::Display for ActivationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::AutoResponse => "auto_response",
            Self::Schedule => "schedule",
        })
    }
}

/// How a command was confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "response", rename_all = "snake_case")]
pub enum Ack {
    /// The controller or relay confirmed it. Carries the response line.
    Hardware(String),
    /// Applied locally only; nothing physical happened.
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorState {
    pub on: bool,
    pub source: Option<ActivationSource>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub activated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_off_at: Option<OffsetDateTime>,
    /// Acknowledgement of the most recent command.
    pub ack: Option<Ack>,
    pub default_duration_secs: f64,
}

/// An activation as requested by a caller.
#[derive(Debug, Clone, Copy)]
pub struct ActivationRequest {
    pub duration: Duration,
    pub source: ActivationSource,
    /// Replace a running activation. Honoured for manual requests only.
    pub override_running: bool,
}

/// Where ON/OFF actually goes.
pub enum PumpOutput {
    Serial {
        link: SerialLink,
        /// Treat a failed command as a local, simulated success.
        simulate_when_absent: bool,
    },
    Relay(RelayPin),
    Simulated,
}

impl PumpOutput {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Serial { .. } => "serial",
            Self::Relay(_) => "gpio",
            Self::Simulated => "simulated",
        }
    }
}

/// Longest single activation the driver accepts.
pub const MAX_ACTIVATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Checks `duration` and converts it to the span used for the off time.
fn off_span(duration: Duration) -> Result<time::Duration, Rejected> {
    if duration.is_zero() || duration > MAX_ACTIVATION {
        return Err(Rejected::InvalidDuration);
    }
    time::Duration::try_from(duration).map_err(|_| Rejected::InvalidDuration)
}

struct DriverInner {
    output: PumpOutput,
    state: ActuatorState,
    generation: u64,
    timer: Option<AbortHandle>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Cheap to clone; all clones drive the same pump.
#[derive(Clone)]
pub struct ActuatorDriver {
    inner: Arc<Mutex<DriverInner>>,
    status: Arc<watch::Sender<ActuatorState>>,
    events: SharedState,
}

impl ActuatorDriver {
    pub fn new(output: PumpOutput, default_duration: Duration, events: SharedState) -> Self {
        let state = ActuatorState {
            on: false,
            source: None,
            activated_at: None,
            scheduled_off_at: None,
            ack: None,
            default_duration_secs: default_duration.as_secs_f64(),
        };
        let (status, _) = watch::channel(state.clone());
        Self {
            inner: Arc::new(Mutex::new(DriverInner {
                output,
                state,
                generation: 0,
                timer: None,
            })),
            status: Arc::new(status),
            events,
        }
    }

    /// Snapshot of the current state. Never waits on the pump.
    pub fn status(&self) -> ActuatorState {
        self.status.borrow().clone()
    }

    pub fn is_on(&self) -> bool {
        self.status.borrow().on
    }

    pub fn subscribe(&self) -> watch::Receiver<ActuatorState> {
        self.status.subscribe()
    }

    pub fn default_duration(&self) -> Duration {
        Duration::from_secs_f64(self.status.borrow().default_duration_secs)
    }

    pub async fn set_default_duration(&self, duration: Duration) -> Result<(), Rejected> {
        off_span(duration)?;
        let mut inner = self.inner.lock().await;
        inner.state.default_duration_secs = duration.as_secs_f64();
        self.publish(&inner);
        info!(secs = duration.as_secs_f64(), "default pump duration changed");
        Ok(())
    }

    /// Start the pump for `duration`. Rejected while already running.
    pub async fn activate(
        &self,
        duration: Duration,
        source: ActivationSource,
    ) -> Result<Ack, Rejected> {
        self.request(ActivationRequest {
            duration,
            source,
            override_running: false,
        })
        .await
    }

    /// Manual start. `None` uses the default duration.
    pub async fn activate_manual(
        &self,
        duration: Option<Duration>,
        override_running: bool,
    ) -> Result<Ack, Rejected> {
        self.request(ActivationRequest {
            duration: duration.unwrap_or_else(|| self.default_duration()),
            source: ActivationSource::Manual,
            override_running,
        })
        .await
    }

    pub async fn request(&self, req: ActivationRequest) -> Result<Ack, Rejected> {
        // Checked before anything reaches the output.
        let span = off_span(req.duration)?;

        let mut inner = self.inner.lock().await;

        if inner.state.on {
            let holder = inner.state.source.unwrap_or(ActivationSource::Manual);
            if !(req.override_running && req.source == ActivationSource::Manual) {
                debug!(requested_by = %req.source, %holder, "activation rejected, pump busy");
                return Err(Rejected::AlreadyOn { holder });
            }
            info!(%holder, "manual override replaces running activation");
        }

        let ack = match drive(&mut inner.output, true).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(source = %req.source, "pump ON failed: {e}");
                self.events
                    .write()
                    .await
                    .record_error(format!("pump ON failed: {e}"));
                return Err(Rejected::LinkUnavailable(e));
            }
        };

        inner.generation += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }

        let now = OffsetDateTime::now_utc();
        inner.state.on = true;
        inner.state.source = Some(req.source);
        inner.state.activated_at = Some(now);
        inner.state.scheduled_off_at = now.checked_add(span);
        inner.state.ack = Some(ack.clone());

        let driver = self.clone();
        let generation = inner.generation;
        let duration = req.duration;
        inner.timer = Some(
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                driver.expire(generation).await;
            })
            .abort_handle(),
        );

        self.publish(&inner);
        drop(inner);

        let simulated = ack == Ack::Simulated;
        info!(
            source = %req.source,
            secs = duration.as_secs_f64(),
            simulated,
            "pump ON"
        );
        self.events.write().await.record_pump(format!(
            "pump ON ({}) for {:.1}s{}",
            req.source,
            duration.as_secs_f64(),
            if simulated { " [simulated]" } else { "" }
        ));
        Ok(ack)
    }

    /// Stop the pump and cancel its auto-off timer. A no-op when already off.
    ///
    /// State is cleared even when the OFF command fails; the error is still
    /// returned so callers can surface it.
    pub async fn deactivate(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if !inner.state.on {
            return Ok(());
        }
        self.switch_off(inner, "stopped").await
    }

    /// Flip the pump. Starting uses the default duration.
    pub async fn toggle(&self) -> Result<bool, Rejected> {
        if self.is_on() {
            self.deactivate().await.map_err(Rejected::LinkUnavailable)?;
            Ok(false)
        } else {
            self.activate_manual(None, false).await?;
            Ok(true)
        }
    }

    /// Send OFF regardless of the believed state. Used at startup and
    /// shutdown so the pump is known to be off.
    pub async fn force_off(&self) -> Result<Ack, TransportError> {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }

        let result = drive(&mut inner.output, false).await;
        let was_on = inner.state.on;
        clear(&mut inner.state);
        if let Ok(ack) = &result {
            inner.state.ack = Some(ack.clone());
        }
        self.publish(&inner);
        drop(inner);

        match &result {
            Ok(ack) => info!(
                driver_was_on = was_on,
                simulated = *ack == Ack::Simulated,
                "pump forced OFF"
            ),
            Err(e) => warn!("forcing pump OFF failed: {e}"),
        }
        result
    }

    /// Auto-off timer body. Stale generations are ignored.
    async fn expire(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || !inner.state.on {
            debug!(generation, "stale auto-off timer ignored");
            return;
        }
        inner.timer = None;
        inner.generation += 1;
        if let Err(e) = self.switch_off(inner, "auto-off").await {
            warn!("auto-off could not reach the pump: {e}");
        }
    }

    async fn switch_off(
        &self,
        mut inner: tokio::sync::MutexGuard<'_, DriverInner>,
        reason: &str,
    ) -> Result<(), TransportError> {
        let source = inner.state.source;
        let result = drive(&mut inner.output, false).await;
        clear(&mut inner.state);
        if let Ok(ack) = &result {
            inner.state.ack = Some(ack.clone());
        }
        self.publish(&inner);
        drop(inner);

        let mut events = self.events.write().await;
        match &result {
            Ok(_) => {
                info!(reason, source = ?source, "pump OFF");
                events.record_pump(format!("pump OFF ({reason})"));
            }
            Err(e) => {
                warn!(reason, "pump OFF not acknowledged: {e}");
                events.record_error(format!("pump OFF ({reason}) not acknowledged: {e}"));
            }
        }
        result.map(|_| ())
    }

    fn publish(&self, inner: &DriverInner) {
        self.status.send_replace(inner.state.clone());
    }
}

fn clear(state: &mut ActuatorState) {
    state.on = false;
    state.source = None;
    state.activated_at = None;
    state.scheduled_off_at = None;
}

async fn drive(output: &mut PumpOutput, on: bool) -> Result<Ack, TransportError> {
    let command = if on { Command::On } else { Command::Off };
    match output {
        PumpOutput::Serial {
            link,
            simulate_when_absent,
        } => match link.send(command).await {
            Ok(line) => Ok(Ack::Hardware(line)),
            Err(TransportError::HardwareAbsent) if *simulate_when_absent => Ok(Ack::Simulated),
            Err(e) if *simulate_when_absent => {
                warn!(%command, "controller did not confirm, applying locally: {e}");
                Ok(Ack::Simulated)
            }
            Err(e) => Err(e),
        },
        PumpOutput::Relay(pin) => {
            pin.set(on)?;
            Ok(Ack::Hardware(format!("RELAY:{command}")))
        }
        PumpOutput::Simulated => Ok(Ack::Simulated),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::tests::{Behaviour, FakeController};
    use crate::serial::LinkState;
    use crate::state::{EventKind, SystemState};
    use tokio::time::sleep;

    fn simulated() -> ActuatorDriver {
        ActuatorDriver::new(
            PumpOutput::Simulated,
            Duration::from_secs(2),
            SystemState::shared(),
        )
    }

    fn serial(fake: &FakeController, simulate_when_absent: bool) -> ActuatorDriver {
        ActuatorDriver::new(
            PumpOutput::Serial {
                link: fake.link(Duration::from_millis(200)),
                simulate_when_absent,
            },
            Duration::from_secs(2),
            SystemState::shared(),
        )
    }

    // -- Activation ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn activation_turns_off_after_duration() {
        let pump = simulated();
        let ack = pump.activate(Duration::from_secs(1), ActivationSource::AutoResponse).await;
        assert_eq!(ack.unwrap(), Ack::Simulated);

        let st = pump.status();
        assert!(st.on);
        assert_eq!(st.source, Some(ActivationSource::AutoResponse));
        assert!(st.scheduled_off_at > st.activated_at);

        sleep(Duration::from_millis(900)).await;
        assert!(pump.is_on());
        sleep(Duration::from_millis(200)).await;
        assert!(!pump.is_on());
        assert_eq!(pump.status().source, None);
    }

    #[tokio::test(start_paused = true)]
    async fn second_activation_is_rejected_while_running() {
        let pump = simulated();
        pump.activate(Duration::from_secs(5), ActivationSource::Schedule)
            .await
            .unwrap();

        let err = pump
            .activate(Duration::from_secs(5), ActivationSource::AutoResponse)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Rejected::AlreadyOn {
                holder: ActivationSource::Schedule
            }
        ));

        // Override only counts for manual requests.
        let err = pump
            .request(ActivationRequest {
                duration: Duration::from_secs(5),
                source: ActivationSource::Schedule,
                override_running: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Rejected::AlreadyOn { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_replaces_timer() {
        let pump = simulated();
        pump.activate(Duration::from_secs(10), ActivationSource::Schedule)
            .await
            .unwrap();

        sleep(Duration::from_secs(5)).await;
        pump.activate_manual(Some(Duration::from_secs(10)), true)
            .await
            .unwrap();
        assert_eq!(pump.status().source, Some(ActivationSource::Manual));

        // The schedule's timer would have fired at t=10.
        sleep(Duration::from_secs(6)).await;
        assert!(pump.is_on());

        sleep(Duration::from_secs(5)).await;
        assert!(!pump.is_on());
    }

    #[tokio::test]
    async fn zero_duration_is_rejected() {
        let pump = simulated();
        let err = pump
            .activate(Duration::ZERO, ActivationSource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, Rejected::InvalidDuration));
        assert!(!pump.is_on());
    }

    #[tokio::test]
    async fn overlong_duration_is_rejected_before_the_pump_is_driven() {
        let fake = FakeController::new(Behaviour::Healthy);
        let pump = serial(&fake, false);

        for duration in [
            Duration::MAX,
            Duration::from_secs(u64::MAX / 2),
            MAX_ACTIVATION + Duration::from_secs(1),
        ] {
            let err = pump
                .activate(duration, ActivationSource::Manual)
                .await
                .unwrap_err();
            assert!(matches!(err, Rejected::InvalidDuration));
        }
        assert!(!pump.is_on());
        assert!(fake.written().is_empty());

        // The bound itself is allowed.
        pump.activate(MAX_ACTIVATION, ActivationSource::Manual)
            .await
            .unwrap();
        let st = pump.status();
        let off_at = st.scheduled_off_at.unwrap();
        assert_eq!(off_at - st.activated_at.unwrap(), time::Duration::hours(24));
        pump.deactivate().await.unwrap();
    }

    #[tokio::test]
    async fn overlong_default_duration_is_rejected() {
        let pump = simulated();
        assert!(matches!(
            pump.set_default_duration(Duration::from_secs(25 * 3600)).await,
            Err(Rejected::InvalidDuration)
        ));
        assert_eq!(pump.default_duration(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_activation_uses_default_duration() {
        let pump = simulated();
        pump.set_default_duration(Duration::from_secs(3)).await.unwrap();
        pump.activate_manual(None, false).await.unwrap();

        sleep(Duration::from_millis(2900)).await;
        assert!(pump.is_on());
        sleep(Duration::from_millis(200)).await;
        assert!(!pump.is_on());

        assert!(matches!(
            pump.set_default_duration(Duration::ZERO).await,
            Err(Rejected::InvalidDuration)
        ));
        assert_eq!(pump.default_duration(), Duration::from_secs(3));
    }

    // -- Deactivation -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn manual_off_cancels_pending_timer() {
        let pump = simulated();
        pump.activate(Duration::from_secs(10), ActivationSource::Schedule)
            .await
            .unwrap();
        sleep(Duration::from_secs(1)).await;
        pump.deactivate().await.unwrap();
        assert!(!pump.is_on());

        // A fresh activation must not be cut short by the first timer.
        sleep(Duration::from_secs(1)).await;
        pump.activate(Duration::from_secs(10), ActivationSource::Manual)
            .await
            .unwrap();
        sleep(Duration::from_secs(9)).await;
        assert!(pump.is_on());
        sleep(Duration::from_secs(2)).await;
        assert!(!pump.is_on());
    }

    #[tokio::test]
    async fn scenario_e_deactivate_twice_is_ok() {
        let pump = simulated();
        pump.activate(Duration::from_secs(30), ActivationSource::Manual)
            .await
            .unwrap();
        assert!(pump.deactivate().await.is_ok());
        assert!(pump.deactivate().await.is_ok());
        assert!(!pump.status().on);
    }

    #[tokio::test]
    async fn toggle_flips_state() {
        let pump = simulated();
        assert!(pump.toggle().await.unwrap());
        assert_eq!(pump.status().source, Some(ActivationSource::Manual));
        assert!(!pump.toggle().await.unwrap());
        assert!(!pump.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_timer_from_old_generation_is_ignored() {
        let pump = simulated();
        pump.activate(Duration::from_secs(1), ActivationSource::Manual)
            .await
            .unwrap();
        pump.deactivate().await.unwrap();
        pump.activate(Duration::from_secs(60), ActivationSource::Manual)
            .await
            .unwrap();

        // Calling the old generation's expiry directly is harmless.
        pump.expire(1).await;
        assert!(pump.is_on());

        sleep(Duration::from_secs(61)).await;
        assert!(!pump.is_on());
    }

    // -- Outputs ------------------------------------------------------------

    #[tokio::test]
    async fn serial_output_reports_hardware_ack() {
        let fake = FakeController::new(Behaviour::Healthy);
        let pump = serial(&fake, false);

        let ack = pump
            .activate(Duration::from_secs(30), ActivationSource::Manual)
            .await
            .unwrap();
        assert_eq!(ack, Ack::Hardware("PUMP:ON".into()));
        pump.deactivate().await.unwrap();
        assert_eq!(pump.status().ack, Some(Ack::Hardware("PUMP:OFF".into())));
        assert_eq!(fake.written(), vec!["ON", "OFF"]);
    }

    #[tokio::test]
    async fn scenario_c_unreachable_link_falls_back_to_simulated() {
        let fake = FakeController::unreachable();
        let link = fake.link(Duration::from_millis(200));

        assert!(link.send(Command::Status).await.is_err());
        assert_eq!(link.state(), LinkState::Simulated);

        let pump = ActuatorDriver::new(
            PumpOutput::Serial {
                link: link.clone(),
                simulate_when_absent: true,
            },
            Duration::from_secs(2),
            SystemState::shared(),
        );
        let ack = pump
            .activate(Duration::from_secs(30), ActivationSource::AutoResponse)
            .await
            .unwrap();

        assert_eq!(ack, Ack::Simulated);
        let st = pump.status();
        assert!(st.on);
        assert_eq!(st.ack, Some(Ack::Simulated));
        assert!(fake.written().is_empty());
    }

    #[tokio::test]
    async fn unreachable_link_without_fallback_rejects() {
        let fake = FakeController::unreachable();
        let pump = serial(&fake, false);
        let err = pump
            .activate(Duration::from_secs(30), ActivationSource::Schedule)
            .await
            .unwrap_err();
        assert!(matches!(err, Rejected::LinkUnavailable(_)));
        assert!(!pump.is_on());
    }

    #[tokio::test]
    async fn failed_off_still_clears_state() {
        let fake = FakeController::new(Behaviour::Healthy);
        let pump = serial(&fake, false);
        pump.activate(Duration::from_secs(30), ActivationSource::Manual)
            .await
            .unwrap();

        fake.set_behaviour(Behaviour::Broken);
        assert!(pump.deactivate().await.is_err());
        assert!(!pump.is_on());
    }

    #[tokio::test]
    async fn force_off_sends_off_even_when_idle() {
        let fake = FakeController::new(Behaviour::Healthy);
        let pump = serial(&fake, true);
        let ack = pump.force_off().await.unwrap();
        assert_eq!(ack, Ack::Hardware("PUMP:OFF".into()));
        assert_eq!(fake.written(), vec!["OFF"]);
    }

    #[tokio::test]
    async fn pump_changes_are_recorded_as_events() {
        let events = SystemState::shared();
        let pump = ActuatorDriver::new(PumpOutput::Simulated, Duration::from_secs(2), events.clone());
        pump.activate(Duration::from_secs(30), ActivationSource::Schedule)
            .await
            .unwrap();
        pump.deactivate().await.unwrap();

        let recent = events.read().await.recent_events();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|e| e.kind == EventKind::Pump));
        assert_eq!(recent[0].detail, "pump OFF (stopped)");
        assert!(recent[1].detail.starts_with("pump ON (schedule) for 30.0s"));
    }

    #[test]
    fn source_names() {
        assert_eq!(ActivationSource::AutoResponse.to_string(), "auto_response");
        assert_eq!(PumpOutput::Simulated.describe(), "simulated");
    }
}
