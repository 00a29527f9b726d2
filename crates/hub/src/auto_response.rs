//! Threshold rules evaluated against every new reading.
//!
//! Rules run in configuration order. An activate rule fires only when its
//! bound is crossed, its own cooldown has elapsed and the pump is off. When
//! two rules cross in the same cycle the first to start the pump wins; the
//! rest see a busy pump and are skipped, never queued.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actuator::{ActivationSource, ActuatorDriver};
use crate::error::Rejected;
use crate::sensor::{Metric, SensorReading};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[serde(alias = "<")]
    Below,
    #[serde(alias = ">")]
    Above,
}

impl Comparison {
    pub fn crossed(self, value: f64, bound: f64) -> bool {
        match self {
            Self::Below => value < bound,
            Self::Above => value > bound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleAction {
    /// Start the pump for this long.
    Activate { duration: Duration },
    /// Stop a running pump.
    Deactivate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub id: String,
    pub metric: Metric,
    pub comparison: Comparison,
    pub bound: f64,
    pub action: RuleAction,
    /// Minimum time between two activations by this rule.
    pub cooldown: Duration,
}

/// Last trigger of one rule.
#[derive(Debug, Clone)]
pub struct CooldownWindow {
    pub min_interval: Duration,
    last_trigger: Option<Instant>,
    last_trigger_wall: Option<OffsetDateTime>,
}

impl CooldownWindow {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_trigger: None,
            last_trigger_wall: None,
        }
    }

    pub fn permits(&self, now: Instant) -> bool {
        self.last_trigger
            .map_or(true, |t| now.saturating_duration_since(t) >= self.min_interval)
    }

    pub fn record(&mut self, now: Instant) {
        self.last_trigger = Some(now);
        self.last_trigger_wall = Some(OffsetDateTime::now_utc());
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.last_trigger.map_or(Duration::ZERO, |t| {
            self.min_interval
                .saturating_sub(now.saturating_duration_since(t))
        })
    }
}

// ---------------------------------------------------------------------------
// Outcomes & status
// ---------------------------------------------------------------------------

/// What happened to one crossed rule in an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Activated { rule: String },
    Deactivated { rule: String },
    /// Crossed but inside the cooldown window. Normal steady state.
    CoolingDown { rule: String, remaining: Duration },
    /// Crossed while the pump was already running.
    Busy { rule: String },
    /// The pump refused for another reason.
    Failed { rule: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub id: String,
    pub metric: Metric,
    pub comparison: Comparison,
    pub bound: f64,
    pub action: &'static str,
    pub duration_secs: Option<f64>,
    pub cooldown_secs: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_triggered_at: Option<OffsetDateTime>,
    pub cooldown_remaining_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoResponseStatus {
    pub enabled: bool,
    pub rules: Vec<RuleStatus>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Shared by every channel loop. Cooldowns are claimed under a short lock
/// that is released before the pump is commanded.
pub struct AutoResponseEngine {
    rules: Vec<ThresholdRule>,
    windows: StdMutex<Vec<CooldownWindow>>,
    actuator: ActuatorDriver,
    events: SharedState,
    enabled: AtomicBool,
}

impl AutoResponseEngine {
    pub fn new(rules: Vec<ThresholdRule>, actuator: ActuatorDriver, events: SharedState) -> Self {
        let windows = rules.iter().map(|r| CooldownWindow::new(r.cooldown)).collect();
        Self {
            rules,
            windows: StdMutex::new(windows),
            actuator,
            events,
            enabled: AtomicBool::new(true),
        }
    }

    fn windows(&self) -> MutexGuard<'_, Vec<CooldownWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::Relaxed) != enabled {
            info!(enabled, "auto-response toggled");
        }
    }

    pub async fn evaluate(&self, reading: &SensorReading) -> Vec<RuleOutcome> {
        self.evaluate_at(reading, Instant::now()).await
    }

    /// Evaluate every rule whose metric the reading carries.
    pub async fn evaluate_at(&self, reading: &SensorReading, now: Instant) -> Vec<RuleOutcome> {
        if !self.enabled() {
            return Vec::new();
        }

        let mut outcomes = Vec::new();
        for (index, rule) in self.rules.iter().enumerate() {
            let Some(value) = reading.value(rule.metric) else {
                continue;
            };
            if !rule.comparison.crossed(value, rule.bound) {
                continue;
            }

            let outcome = match rule.action {
                RuleAction::Activate { duration } => {
                    self.try_activate(index, rule, duration, now).await
                }
                RuleAction::Deactivate => {
                    if !self.actuator.is_on() {
                        continue;
                    }
                    match self.actuator.deactivate().await {
                        Ok(()) => RuleOutcome::Deactivated {
                            rule: rule.id.clone(),
                        },
                        Err(e) => RuleOutcome::Failed {
                            rule: rule.id.clone(),
                            reason: e.to_string(),
                        },
                    }
                }
            };

            match &outcome {
                RuleOutcome::Activated { rule: id } | RuleOutcome::Deactivated { rule: id } => {
                    info!(
                        rule = %id,
                        channel = %reading.channel_id,
                        metric = %rule.metric,
                        value,
                        bound = rule.bound,
                        "auto-response fired"
                    );
                    self.events.write().await.record_auto_response(format!(
                        "rule '{id}' fired: {} {value} crossed {}",
                        rule.metric, rule.bound
                    ));
                }
                RuleOutcome::CoolingDown { rule: id, remaining } => debug!(
                    rule = %id,
                    remaining_secs = remaining.as_secs(),
                    "rule crossed inside cooldown"
                ),
                RuleOutcome::Busy { rule: id } => {
                    debug!(rule = %id, "rule crossed while pump running")
                }
                RuleOutcome::Failed { rule: id, reason } => {
                    warn!(rule = %id, "auto-response action failed: {reason}");
                    self.events
                        .write()
                        .await
                        .record_error(format!("rule '{id}' failed: {reason}"));
                }
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Claims the rule's cooldown, then starts the pump. A refused start
    /// hands the claim back.
    async fn try_activate(
        &self,
        index: usize,
        rule: &ThresholdRule,
        duration: Duration,
        now: Instant,
    ) -> RuleOutcome {
        let claimed = {
            let mut windows = self.windows();
            let window = &mut windows[index];
            if !window.permits(now) {
                return RuleOutcome::CoolingDown {
                    rule: rule.id.clone(),
                    remaining: window.remaining(now),
                };
            }
            if self.actuator.is_on() {
                return RuleOutcome::Busy {
                    rule: rule.id.clone(),
                };
            }
            let previous = window.clone();
            window.record(now);
            previous
        };

        match self
            .actuator
            .activate(duration, ActivationSource::AutoResponse)
            .await
        {
            Ok(_) => RuleOutcome::Activated {
                rule: rule.id.clone(),
            },
            Err(e) => {
                self.windows()[index] = claimed;
                match e {
                    Rejected::AlreadyOn { .. } => RuleOutcome::Busy {
                        rule: rule.id.clone(),
                    },
                    e => RuleOutcome::Failed {
                        rule: rule.id.clone(),
                        reason: e.to_string(),
                    },
                }
            }
        }
    }

    pub fn status(&self) -> AutoResponseStatus {
        let now = Instant::now();
        let windows = self.windows();
        AutoResponseStatus {
            enabled: self.enabled(),
            rules: self
                .rules
                .iter()
                .zip(windows.iter())
                .map(|(rule, window)| {
                    let (action, duration_secs) = match rule.action {
                        RuleAction::Activate { duration } => {
                            ("activate", Some(duration.as_secs_f64()))
                        }
                        RuleAction::Deactivate => ("deactivate", None),
                    };
                    RuleStatus {
                        id: rule.id.clone(),
                        metric: rule.metric,
                        comparison: rule.comparison,
                        bound: rule.bound,
                        action,
                        duration_secs,
                        cooldown_secs: rule.cooldown.as_secs_f64(),
                        last_triggered_at: window.last_trigger_wall,
                        cooldown_remaining_secs: window.remaining(now).as_secs_f64(),
                    }
                })
                .collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
