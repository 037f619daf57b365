// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use super::error::SchedulerError;

/// How late a fire may be before it is reported as a misfire.
pub const MISFIRE_GRACE: Duration = Duration::from_secs(1);

/// A cron schedule evaluated in UTC.
///
/// Accepts 6/7-field expressions (seconds first, weekdays 1-7 from Sunday)
/// and classic 5-field ones, which get a `0` seconds field and have their
/// weekdays renumbered from 0-7 (Sunday is 0 and 7). `?` is read as `*`.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use replica_sync::scheduler::DailySchedule;
///
/// let schedule = DailySchedule::parse("30 2 * * ?").unwrap();
/// let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
/// assert_eq!(schedule.next_after(after), Some(Utc.with_ymd_and_hms(2026, 3, 2, 2, 30, 0).unwrap()));
/// ```
#[derive(Debug, Clone)]
pub struct DailySchedule {
    expr: String,
    schedule: Schedule,
}

impl DailySchedule {
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let normalised = normalise(expr);
        let schedule = Schedule::from_str(&normalised).map_err(|e| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Whether a fire scheduled for `scheduled` and taken at `now` missed its
    /// slot. A misfire still fires, once, immediately.
    #[must_use]
    pub fn is_misfire(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - scheduled)
            .to_std()
            .map(|late| late > MISFIRE_GRACE)
            .unwrap_or(false)
    }
}

fn normalise(expr: &str) -> String {
    let mut fields: Vec<String> = expr
        .split_whitespace()
        .map(|f| if f == "?" { "*".to_string() } else { f.to_string() })
        .collect();
    if fields.len() == 5 {
        fields[4] = classic_day_of_week(&fields[4]);
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

fn classic_day_of_week(field: &str) -> String {
    field.split(',').map(classic_day_item).collect::<Vec<_>>().join(",")
}

fn classic_day_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, format!("/{step}")),
        None => (item, String::new()),
    };
    match range.split_once('-') {
        // Ranges may close the week on 7
        Some((lo, "7")) if step.is_empty() => format!("{}-7,1", shift_day(lo)),
        Some((lo, hi)) => format!("{}-{}{step}", shift_day(lo), shift_day(hi)),
        None => format!("{}{step}", shift_day(range)),
    }
}

/// 0..=7 with Sunday as 0 and 7 becomes 1..=7 with Sunday as 1. Names and
/// wildcards pass through.
fn shift_day(day: &str) -> String {
    match day.parse::<u8>() {
        Ok(n) if n <= 7 => (n % 7 + 1).to_string(),
        _ => day.to_string(),
    }
}
