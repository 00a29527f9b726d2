//! Time-of-day scheduler: starts the pump at configured times on configured
//! weekdays, independent of sensor readings.
//!
//! Each entry remembers the minute it last fired, so a tick interval finer
//! than a minute never fires an entry twice. Ticks also look back over the
//! minutes since the previous tick (up to [`CATCH_UP_MINUTES`]), so a late
//! tick does not skip a run.
//!
//! An entry that comes due while the pump is already running is marked as
//! fired anyway and is not retried in that minute.
//!
//! Times are wall-clock times in a [`ScheduleZone`]. A named zone is
//! resolved on every tick, so entries keep their local time across
//! daylight-saving changes.

use chrono::{Offset, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset, Weekday};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actuator::{ActivationSource, ActuatorDriver, MAX_ACTIVATION};
use crate::error::Rejected;
use crate::state::SharedState;

/// Furthest a late tick looks back for missed minutes.
pub const CATCH_UP_MINUTES: i64 = 5;

// ---------------------------------------------------------------------------
// Time of day & weekdays
// ---------------------------------------------------------------------------

/// Wall-clock minute, "HH:MM".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn of(dt: OffsetDateTime) -> Self {
        Self {
            hour: dt.hour(),
            minute: dt.minute(),
        }
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid time '{s}', expected HH:MM");
        let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(bad());
        }
        let hour: u8 = h.parse().map_err(|_| bad())?;
        let minute: u8 = m.parse().map_err(|_| bad())?;
        Self::new(hour, minute).ok_or_else(bad)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    #[serde(alias = "monday")]
    Mon,
    #[serde(alias = "tuesday")]
    Tue,
    #[serde(alias = "wednesday")]
    Wed,
    #[serde(alias = "thursday")]
    Thu,
    #[serde(alias = "friday")]
    Fri,
    #[serde(alias = "saturday")]
    Sat,
    #[serde(alias = "sunday")]
    Sun,
}

impl From<Weekday> for DayOfWeek {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Monday => Self::Mon,
            Weekday::Tuesday => Self::Tue,
            Weekday::Wednesday => Self::Wed,
            Weekday::Thursday => Self::Thu,
            Weekday::Friday => Self::Fri,
            Weekday::Saturday => Self::Sat,
            Weekday::Sunday => Self::Sun,
        }
    }
}

/// Parse a fixed UTC offset such as "+02:00" or "-05:30".
pub fn parse_utc_offset(s: &str) -> Result<UtcOffset, String> {
    let format = time::macros::format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(s.trim(), &format).map_err(|e| format!("invalid utc offset '{s}': {e}"))
}

/// "+HH:MM" rendering of an offset.
pub fn format_utc_offset(offset: UtcOffset) -> String {
    let (h, m, _) = offset.as_hms();
    let sign = if offset.is_negative() { '-' } else { '+' };
    format!("{sign}{:02}:{:02}", h.unsigned_abs(), m.unsigned_abs())
}

/// Parse an IANA zone name such as "Europe/Berlin".
pub fn parse_timezone(s: &str) -> Result<Tz, String> {
    s.trim()
        .parse::<Tz>()
        .map_err(|_| format!("unknown timezone '{s}'"))
}

/// The clock schedule times are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    /// Same offset all year.
    Fixed(UtcOffset),
    /// Offset follows the zone's daylight-saving rules.
    Named(Tz),
}

impl ScheduleZone {
    /// Offset in effect at `instant`.
    pub fn offset_at(&self, instant: OffsetDateTime) -> UtcOffset {
        match self {
            Self::Fixed(offset) => *offset,
            Self::Named(tz) => chrono::DateTime::from_timestamp(instant.unix_timestamp(), 0)
                .map(|utc| tz.offset_from_utc_datetime(&utc.naive_utc()).fix().local_minus_utc())
                .and_then(|secs| UtcOffset::from_whole_seconds(secs).ok())
                .unwrap_or(UtcOffset::UTC),
        }
    }

    /// `instant` as wall-clock time in this zone.
    pub fn localize(&self, instant: OffsetDateTime) -> OffsetDateTime {
        instant.to_offset(self.offset_at(instant))
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Fixed(_) => None,
            Self::Named(tz) => Some(tz.name()),
        }
    }
}

impl From<UtcOffset> for ScheduleZone {
    fn from(offset: UtcOffset) -> Self {
        Self::Fixed(offset)
    }
}

impl From<Tz> for ScheduleZone {
    fn from(tz: Tz) -> Self {
        Self::Named(tz)
    }
}

impl fmt::Display for ScheduleZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(offset) => f.write_str(&format_utc_offset(*offset)),
            Self::Named(tz) => f.write_str(tz.name()),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub time: TimeOfDay,
    /// Empty means every day.
    #[serde(default)]
    pub days: Vec<DayOfWeek>,
    pub duration_secs: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScheduleEntry {
    pub fn runs_on(&self, day: DayOfWeek) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    /// `None` unless the duration is a usable activation length.
    pub fn duration(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.duration_secs)
            .ok()
            .filter(|d| !d.is_zero() && *d <= MAX_ACTIVATION)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("schedule id must not be empty".into());
        }
        if self.duration().is_none() {
            return Err(format!(
                "schedule '{}': duration_secs must be positive and at most {}",
                self.id,
                MAX_ACTIVATION.as_secs()
            ));
        }
        Ok(())
    }

    fn due_at(&self, minute: OffsetDateTime) -> bool {
        self.enabled && self.time == TimeOfDay::of(minute) && self.runs_on(minute.weekday().into())
    }

    /// Next start strictly after `now`, in the zone's offset at that start.
    pub fn next_fire(&self, now: OffsetDateTime, zone: &ScheduleZone) -> Option<OffsetDateTime> {
        if !self.enabled {
            return None;
        }
        let now = zone.localize(now);
        (0..=7).find_map(|d| {
            let date = now.date().checked_add(time::Duration::days(d))?;
            let wall = date.with_hms(self.time.hour, self.time.minute, 0).ok()?;
            let guess = wall.assume_offset(now.offset());
            let at = wall.assume_offset(zone.offset_at(guess));
            (at > now && self.runs_on(date.weekday().into())).then_some(at)
        })
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    #[serde(flatten)]
    pub entry: ScheduleEntry,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_fire: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_fired: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextFire {
    pub entry: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    /// Offset in effect right now.
    pub utc_offset: String,
    pub timezone: Option<String>,
    pub entries: Vec<EntryStatus>,
    pub next_fire: Option<NextFire>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Fired { entry: String },
    /// Due, but the pump refused. Counts as fired for that minute.
    Skipped { entry: String, reason: String },
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Slot {
    entry: ScheduleEntry,
    /// Start of the minute this entry last fired in.
    last_fired: Option<OffsetDateTime>,
}

#[derive(Default)]
struct Book {
    slots: Vec<Slot>,
    last_tick: Option<OffsetDateTime>,
}

/// A firing decided under the book lock, carried out after it is released.
struct Due {
    id: String,
    at: TimeOfDay,
    duration: Option<Duration>,
}

/// Shared by the tick loop and the command surface. The book lock is only
/// held for bookkeeping, never across a pump command.
pub struct Scheduler {
    book: StdMutex<Book>,
    actuator: ActuatorDriver,
    events: SharedState,
    zone: ScheduleZone,
}

impl Scheduler {
    pub fn new(
        entries: Vec<ScheduleEntry>,
        zone: impl Into<ScheduleZone>,
        actuator: ActuatorDriver,
        events: SharedState,
    ) -> Self {
        Self {
            book: StdMutex::new(Book {
                slots: entries
                    .into_iter()
                    .map(|entry| Slot {
                        entry,
                        last_fired: None,
                    })
                    .collect(),
                last_tick: None,
            }),
            actuator,
            events,
            zone: zone.into(),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// Current wall-clock time in the scheduler's zone.
    pub fn now(&self) -> OffsetDateTime {
        self.zone.localize(OffsetDateTime::now_utc())
    }

    pub async fn tick(&self) -> Vec<FireOutcome> {
        self.tick_at(OffsetDateTime::now_utc()).await
    }

    /// Fire every entry due in the minutes since the previous tick.
    pub async fn tick_at(&self, now: OffsetDateTime) -> Vec<FireOutcome> {
        let due = self.collect_due(floor_minute(now));
        let mut outcomes = Vec::with_capacity(due.len());
        for d in due {
            outcomes.push(self.fire(d).await);
        }
        outcomes
    }

    /// Walks the minutes since the last tick and marks what comes due.
    fn collect_due(&self, current: OffsetDateTime) -> Vec<Due> {
        let one_minute = time::Duration::minutes(1);
        let mut book = self.book();

        let mut minute = match book.last_tick {
            Some(prev) if prev < current => {
                (prev + one_minute).max(current - time::Duration::minutes(CATCH_UP_MINUTES))
            }
            _ => current,
        };
        book.last_tick = Some(current);

        let mut due = Vec::new();
        while minute <= current {
            // Resolved per minute so a daylight-saving change mid catch-up is honoured.
            let local = self.zone.localize(minute);
            for slot in &mut book.slots {
                if !slot.entry.due_at(local) || slot.last_fired == Some(minute) {
                    continue;
                }
                slot.last_fired = Some(local);
                due.push(Due {
                    id: slot.entry.id.clone(),
                    at: slot.entry.time,
                    duration: slot.entry.duration(),
                });
            }
            minute += one_minute;
        }
        due
    }

    async fn fire(&self, due: Due) -> FireOutcome {
        let Due { id, at, duration } = due;
        let result = match duration {
            Some(duration) => self
                .actuator
                .activate(duration, ActivationSource::Schedule)
                .await
                .map(|_| duration),
            None => Err(Rejected::InvalidDuration),
        };
        match result {
            Ok(duration) => {
                info!(entry = %id, %at, secs = duration.as_secs_f64(), "schedule fired");
                self.events
                    .write()
                    .await
                    .record_scheduler(format!("schedule '{id}' fired at {at}"));
                FireOutcome::Fired { entry: id }
            }
            Err(e) => {
                match &e {
                    Rejected::AlreadyOn { .. } => {
                        info!(entry = %id, "schedule due while pump running, skipped")
                    }
                    _ => warn!(entry = %id, "schedule could not start pump: {e}"),
                }
                self.events
                    .write()
                    .await
                    .record_scheduler(format!("schedule '{id}' skipped: {e}"));
                FireOutcome::Skipped {
                    entry: id,
                    reason: e.to_string(),
                }
            }
        }
    }

    // -- Management --------------------------------------------------------

    /// Insert an entry, replacing one with the same id. Returns whether an
    /// entry was replaced.
    pub fn add(&self, entry: ScheduleEntry) -> bool {
        let mut book = self.book();
        if let Some(slot) = book.slots.iter_mut().find(|s| s.entry.id == entry.id) {
            debug!(entry = %entry.id, "schedule entry replaced");
            slot.entry = entry;
            true
        } else {
            debug!(entry = %entry.id, "schedule entry added");
            book.slots.push(Slot {
                entry,
                last_fired: None,
            });
            false
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut book = self.book();
        let before = book.slots.len();
        book.slots.retain(|s| s.entry.id != id);
        book.slots.len() != before
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.book().slots.iter_mut().find(|s| s.entry.id == id) {
            Some(slot) => {
                slot.entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.book().slots.iter().map(|s| s.entry.clone()).collect()
    }

    pub fn status(&self) -> ScheduleStatus {
        self.status_at(OffsetDateTime::now_utc())
    }

    pub fn status_at(&self, now: OffsetDateTime) -> ScheduleStatus {
        let now = self.zone.localize(now);
        let entries: Vec<EntryStatus> = self
            .book()
            .slots
            .iter()
            .map(|s| EntryStatus {
                entry: s.entry.clone(),
                next_fire: s.entry.next_fire(now, &self.zone),
                last_fired: s.last_fired,
            })
            .collect();
        let next_fire = entries
            .iter()
            .filter_map(|e| e.next_fire.map(|at| (at, &e.entry.id)))
            .min_by_key(|(at, _)| *at)
            .map(|(at, id)| NextFire {
                entry: id.clone(),
                at,
            });
        ScheduleStatus {
            utc_offset: format_utc_offset(now.offset()),
            timezone: self.zone.name().map(str::to_string),
            entries,
            next_fire,
        }
    }
}

fn floor_minute(dt: OffsetDateTime) -> OffsetDateTime {
    dt - time::Duration::seconds(i64::from(dt.second()))
        - time::Duration::nanoseconds(i64::from(dt.nanosecond()))
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run the scheduler until `shutdown` flips. Spawned from the runtime.
pub async fn run(scheduler: Arc<Scheduler>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        entries = scheduler.entries().len(),
        tick_secs = tick.as_secs(),
        zone = %scheduler.zone(),
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcomes = scheduler.tick().await;
                if !outcomes.is_empty() {
                    debug!(?outcomes, "scheduler tick");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("scheduler stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
