//! Runtime wiring. Every component is built once from the config and handed
//! to the loops that need it; nothing is global.
//!
//! Background tasks:
//! - one poll loop per sensor channel, feeding the auto-response engine
//! - the scheduler tick
//! - the link monitor (transition events and the periodic STATUS probe)
//!
//! Auto-off timers are spawned by the actuator itself.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actuator::{Ack, ActuatorDriver, PumpOutput};
use crate::auto_response::{AutoResponseEngine, ThresholdRule};
use crate::config::{Config, PumpDriver};
use crate::error::{Rejected, TransportError};
use crate::relay::RelayPin;
use crate::scheduler::{self, ScheduleEntry, ScheduleZone, Scheduler};
use crate::sensor::{open_source, ChannelStatus, SensorChannel, Transition};
use crate::serial::{LinkState, SerialConnector, SerialLink};
use crate::state::{SharedState, StatusResponse, SystemState};

/// Loop periods and link policy.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub poll_interval: Duration,
    pub scheduler_tick: Duration,
    /// `None` disables the periodic STATUS probe.
    pub health_check: Option<Duration>,
    pub auto_reprobe: bool,
    pub auto_response_enabled: bool,
}

impl Settings {
    fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.polling.interval(),
            scheduler_tick: config.scheduler.tick(),
            health_check: (config.serial.health_check_secs > 0)
                .then(|| Duration::from_secs(config.serial.health_check_secs)),
            auto_reprobe: config.serial.auto_reprobe,
            auto_response_enabled: config.auto_response.enabled,
        }
    }
}

/// Everything a running garden needs. Build once, share by reference.
pub struct Garden {
    channels: std::sync::Mutex<Vec<SensorChannel>>,
    channel_status: Vec<watch::Receiver<ChannelStatus>>,
    actuator: ActuatorDriver,
    link: Option<SerialLink>,
    engine: Arc<AutoResponseEngine>,
    scheduler: Arc<Scheduler>,
    events: SharedState,
    settings: Settings,
    shutdown: watch::Sender<bool>,
}

impl Garden {
    /// Build every component from a validated config.
    pub async fn build(config: &Config) -> Result<Self> {
        let events = SystemState::shared();

        let (output, link) = match config.pump.driver {
            PumpDriver::Serial => {
                let connector = SerialConnector::new(
                    config.serial.port.clone(),
                    config.serial.baud_rate,
                    config.serial.settle(),
                );
                let link = SerialLink::new(connector, config.serial.response_timeout());
                let output = PumpOutput::Serial {
                    link: link.clone(),
                    simulate_when_absent: config.pump.simulate_when_absent,
                };
                (output, Some(link))
            }
            PumpDriver::Gpio => {
                let pin = config
                    .pump
                    .gpio_pin
                    .and_then(|p| u8::try_from(p).ok())
                    .context("pump gpio_pin missing or out of range")?;
                match RelayPin::open(pin, config.pump.active_low) {
                    Ok(relay) => (PumpOutput::Relay(relay), None),
                    Err(e) if config.pump.simulate_when_absent => {
                        warn!("pump relay unavailable, simulating: {e}");
                        (PumpOutput::Simulated, None)
                    }
                    Err(e) => return Err(e).context("failed to open pump relay"),
                }
            }
            PumpDriver::Simulated => (PumpOutput::Simulated, None),
        };
        info!(driver = output.describe(), "pump output selected");

        let actuator = ActuatorDriver::new(output, config.pump.default_duration(), events.clone());

        // Opening a channel takes its first reading, which may block on the bus.
        let specs: Vec<_> = config
            .channels
            .iter()
            .map(|c| (c.id.clone(), c.kind, c.mode, c.pins()))
            .collect();
        let demote_after = config.polling.demote_after;
        let channels = tokio::task::spawn_blocking(move || {
            specs
                .into_iter()
                .map(|(id, kind, mode, pins)| {
                    SensorChannel::new(id, kind, mode, open_source(kind, mode, pins), demote_after)
                })
                .collect::<Vec<_>>()
        })
        .await
        .context("sensor channel setup failed")?;

        Ok(Self::assemble(
            channels,
            actuator,
            link,
            config.threshold_rules(),
            config.schedules.clone(),
            config.scheduler.zone(),
            Settings::from_config(config),
            events,
        ))
    }

    /// Assemble a garden from already-built parts.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        channels: Vec<SensorChannel>,
        actuator: ActuatorDriver,
        link: Option<SerialLink>,
        rules: Vec<ThresholdRule>,
        schedules: Vec<ScheduleEntry>,
        zone: ScheduleZone,
        settings: Settings,
        events: SharedState,
    ) -> Self {
        let channel_status = channels.iter().map(SensorChannel::subscribe).collect();
        let engine = AutoResponseEngine::new(rules, actuator.clone(), events.clone());
        engine.set_enabled(settings.auto_response_enabled);
        let scheduler = Scheduler::new(schedules, zone, actuator.clone(), events.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            channels: std::sync::Mutex::new(channels),
            channel_status,
            actuator,
            link,
            engine: Arc::new(engine),
            scheduler: Arc::new(scheduler),
            events,
            settings,
            shutdown,
        }
    }

    pub fn actuator(&self) -> &ActuatorDriver {
        &self.actuator
    }

    pub fn events(&self) -> &SharedState {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Drive the pump OFF, then spawn every background loop.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.actuator.force_off().await {
            warn!("could not confirm pump OFF at startup: {e}");
        }

        let channels = match self.channels.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut tasks = Vec::new();
        for channel in channels {
            tasks.push(tokio::spawn(run_channel(
                channel,
                Arc::clone(&self.engine),
                self.actuator.clone(),
                self.events.clone(),
                self.settings.poll_interval,
                self.shutdown.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(scheduler::run(
            Arc::clone(&self.scheduler),
            self.settings.scheduler_tick,
            self.shutdown.subscribe(),
        )));

        if let Some(link) = &self.link {
            tasks.push(tokio::spawn(run_link_monitor(
                link.clone(),
                self.events.clone(),
                self.settings,
                self.shutdown.subscribe(),
            )));
        }

        self.events
            .write()
            .await
            .record_system(format!("garden started with {} channel(s)", self.channel_status.len()));
        info!(channels = self.channel_status.len(), "garden started");
        tasks
    }

    /// Stop every loop, wait for them, then drive the pump OFF.
    pub async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        self.shutdown.send_replace(true);
        for task in tasks {
            if let Err(e) = task.await {
                error!("background task ended abnormally: {e}");
            }
        }
        if let Err(e) = self.actuator.force_off().await {
            warn!("could not confirm pump OFF at shutdown: {e}");
        }
        self.events
            .write()
            .await
            .record_system("garden stopped".to_string());
        info!("garden stopped");
    }

    // -----------------------------------------------------------------------
    // Status surface
    // -----------------------------------------------------------------------

    /// Snapshot of everything. Never waits on the pump or the serial link.
    pub async fn status(&self) -> StatusResponse {
        let schedule = self.scheduler.status();
        let auto_response = self.engine.status();

        let events = self.events.read().await;
        StatusResponse {
            uptime_secs: events.uptime_secs(),
            channels: self
                .channel_status
                .iter()
                .map(|rx| rx.borrow().clone())
                .collect(),
            actuator: self.actuator.status(),
            link: self.link.as_ref().map(SerialLink::status),
            schedule,
            auto_response,
            events: events.recent_events(),
        }
    }

    // -----------------------------------------------------------------------
    // Command surface
    // -----------------------------------------------------------------------

    /// Manual start. `None` uses the default duration.
    pub async fn activate(
        &self,
        duration: Option<Duration>,
        override_running: bool,
    ) -> Result<Ack, Rejected> {
        self.actuator.activate_manual(duration, override_running).await
    }

    pub async fn deactivate(&self) -> Result<(), TransportError> {
        self.actuator.deactivate().await
    }

    pub async fn toggle(&self) -> Result<bool, Rejected> {
        self.actuator.toggle().await
    }

    pub async fn set_default_duration(&self, duration: Duration) -> Result<(), Rejected> {
        self.actuator.set_default_duration(duration).await
    }

    /// Add a schedule entry, replacing one with the same id.
    pub async fn add_schedule(&self, entry: ScheduleEntry) -> Result<bool> {
        entry.validate().map_err(|e| anyhow!(e))?;
        let detail = format!("schedule '{}' set for {}", entry.id, entry.time);
        let replaced = self.scheduler.add(entry);
        self.events.write().await.record_scheduler(detail);
        Ok(replaced)
    }

    pub async fn remove_schedule(&self, id: &str) -> bool {
        let removed = self.scheduler.remove(id);
        if removed {
            self.events
                .write()
                .await
                .record_scheduler(format!("schedule '{id}' removed"));
        }
        removed
    }

    pub async fn set_schedule_enabled(&self, id: &str, enabled: bool) -> bool {
        let found = self.scheduler.set_enabled(id, enabled);
        if found {
            self.events.write().await.record_scheduler(format!(
                "schedule '{id}' {}",
                if enabled { "enabled" } else { "disabled" }
            ));
        }
        found
    }

    pub async fn set_auto_response(&self, enabled: bool) {
        self.engine.set_enabled(enabled);
        self.events.write().await.record_auto_response(format!(
            "auto-response {}",
            if enabled { "enabled" } else { "disabled" }
        ));
    }

    /// Re-probe the serial controller. Fails when the pump is not on a
    /// serial link.
    pub async fn reprobe_link(&self) -> Result<(), TransportError> {
        match &self.link {
            Some(link) => link.reprobe().await,
            None => Err(TransportError::HardwareAbsent),
        }
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Poll one channel forever. Reads run on the blocking pool; evaluation
/// happens after each poll and before the next one.
async fn run_channel(
    mut channel: SensorChannel,
    engine: Arc<AutoResponseEngine>,
    actuator: ActuatorDriver,
    events: SharedState,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = channel.id().to_string();
    let mut pump = actuator.subscribe();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(channel = %id, period_secs = period.as_secs_f64(), "poll loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let watering = pump.borrow_and_update().on;
        let joined = tokio::task::spawn_blocking(move || {
            channel.set_watering(watering);
            let result = channel.poll();
            let transitions = channel.drain_transitions();
            (channel, result, transitions)
        })
        .await;

        let (returned, result, transitions) = match joined {
            Ok(parts) => parts,
            Err(e) => {
                error!(channel = %id, "sensor poll task failed, channel stopped: {e}");
                events
                    .write()
                    .await
                    .record_error(format!("sensor '{id}' poll task failed: {e}"));
                return;
            }
        };
        channel = returned;

        if !transitions.is_empty() {
            let mut ev = events.write().await;
            for t in transitions {
                ev.record_sensor(match t {
                    Transition::Connected => format!("sensor '{id}' connected"),
                    Transition::Disconnected => format!("sensor '{id}' disconnected"),
                });
            }
        }

        if let Ok(reading) = result {
            engine.evaluate(&reading).await;
        }
    }
    debug!(channel = %id, "poll loop stopped");
}

/// Record link transitions and probe the controller periodically.
async fn run_link_monitor(
    link: SerialLink,
    events: SharedState,
    settings: Settings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut status = link.subscribe();
    let mut last = status.borrow_and_update().state;

    let period = settings.health_check.unwrap_or(Duration::from_secs(3600));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately; startup already talked to the link.
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.state == last || current.state == LinkState::Connecting {
                    continue;
                }
                last = current.state;
                let detail = match current.state {
                    LinkState::Connected => format!(
                        "link connected on {}",
                        current.port.as_deref().unwrap_or("unknown port")
                    ),
                    LinkState::Disconnected => format!(
                        "link lost: {}",
                        current.last_error.as_deref().unwrap_or("unknown error")
                    ),
                    LinkState::Simulated => "no controller found, pump simulated".to_string(),
                    LinkState::Connecting => continue,
                };
                events.write().await.record_link(detail);
            }
            _ = ticker.tick(), if settings.health_check.is_some() => {
                match link.state() {
                    LinkState::Connected | LinkState::Disconnected => {
                        if let Err(e) = link.query_status().await {
                            debug!("link health check failed: {e}");
                        }
                    }
                    LinkState::Simulated if settings.auto_reprobe => {
                        if let Err(e) = link.reprobe().await {
                            debug!("controller re-probe failed: {e}");
                        }
                    }
                    _ => {}
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("link monitor stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
