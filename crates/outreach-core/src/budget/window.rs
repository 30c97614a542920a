//! Fixed UTC hour/day send counters.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

pub fn hour_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::hours(1)).unwrap_or(t)
}

pub fn day_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::days(1)).unwrap_or(t)
}

/// Counts of grants handed out in the current hour and day windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWindow {
    #[serde(default)]
    pub hour_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hour_count: u32,
    #[serde(default)]
    pub day_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub day_count: u32,
}

impl BudgetWindow {
    /// Reset whichever counters belong to a window that has ended.
    pub fn roll(&mut self, now: DateTime<Utc>) {
        let hour = hour_floor(now);
        if self.hour_start != Some(hour) {
            self.hour_start = Some(hour);
            self.hour_count = 0;
        }
        let day = day_floor(now);
        if self.day_start != Some(day) {
            self.day_start = Some(day);
            self.day_count = 0;
        }
    }

    /// Remaining `(hourly, daily)` budget at `now`.
    pub fn remaining(&mut self, now: DateTime<Utc>, hourly_cap: u32, daily_cap: u32) -> (u32, u32) {
        self.roll(now);
        (
            hourly_cap.saturating_sub(self.hour_count),
            daily_cap.saturating_sub(self.day_count),
        )
    }

    /// Grant up to `requested` sends and count them against both windows.
    pub fn grant(
        &mut self,
        now: DateTime<Utc>,
        requested: u32,
        hourly_cap: u32,
        daily_cap: u32,
    ) -> u32 {
        let (hourly, daily) = self.remaining(now, hourly_cap, daily_cap);
        let granted = requested.min(hourly).min(daily);
        self.hour_count += granted;
        self.day_count += granted;
        granted
    }

    /// Give back `count` unused grants made at `reserved_at`. A window that
    /// has rolled over since then is left alone.
    pub fn release(&mut self, count: u32, reserved_at: DateTime<Utc>) {
        if self.hour_start == Some(hour_floor(reserved_at)) {
            self.hour_count = self.hour_count.saturating_sub(count);
        }
        if self.day_start == Some(day_floor(reserved_at)) {
            self.day_count = self.day_count.saturating_sub(count);
        }
    }
}
