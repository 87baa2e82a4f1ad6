//! Trading week anchor: Sunday 19:00 America/New_York, DST-aware.

#[cfg(test)]
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};
use chrono_tz::America::New_York;

const OPEN_HOUR: u32 = 19;

/// Source of "now" for the state machine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
#[cfg(test)]
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// The trading week containing an instant, plus the part of it the basket may be held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekWindow {
    /// RFC 3339 UTC timestamp of the weekly open
    pub week_id: String,
    pub open: DateTime<Utc>,
    /// End of the holding window: `open + window_hours`, capped at the next weekly open
    pub close: DateTime<Utc>,
    pub next_open: DateTime<Utc>,
}

impl WeekWindow {
    /// Week whose open is the latest Sunday 19:00 New York time at or before `now`.
    pub fn containing(now: DateTime<Utc>, window_hours: u32) -> Result<Self> {
        let local = now.with_timezone(&New_York);
        let days_since_sunday = local.weekday().num_days_from_sunday() as i64;
        let mut sunday = local.date_naive() - Duration::days(days_since_sunday);
        let mut open = sunday_open(sunday)?;
        if now < open {
            sunday -= Duration::days(7);
            open = sunday_open(sunday)?;
        }
        let next_open = sunday_open(sunday + Duration::days(7))?;
        let close = (open + Duration::hours(window_hours as i64)).min(next_open);

        Ok(Self {
            week_id: open.to_rfc3339_opts(SecondsFormat::Millis, true),
            open,
            close,
            next_open,
        })
    }

    /// Inside `[open, close)`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        now >= self.open && now < self.close
    }
}

fn sunday_open(date: NaiveDate) -> Result<DateTime<Utc>> {
    let naive = date
        .and_hms_opt(OPEN_HOUR, 0, 0)
        .context("Invalid weekly open time")?;
    let local = New_York
        .from_local_datetime(&naive)
        .earliest()
        .with_context(|| format!("No New York time for {}", naive))?;
    Ok(local.with_timezone(&Utc))
}
