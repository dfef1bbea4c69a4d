//! Lightweight cron expression parser for `Schedule` triggers.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field syntax: *, */N, N, A-B, A-B/N and comma lists of those.
//! Example: "0 9 * * 1" = every Monday at 9:00 UTC
//!
//! When both DOM and DOW are restricted a day matches if either does,
//! as in classic cron.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

use crate::error::{SchedulerError, SchedulerResult};

/// Parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a 5-field expression.
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(SchedulerError::InvalidRule(format!(
                "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }

        let mut days_of_week = parse_field(parts[4], 0, 7)?;
        // 7 is an alias for Sunday.
        if days_of_week.remove(&7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days_of_month: parse_field(parts[2], 1, 31)?,
            months: parse_field(parts[3], 1, 12)?,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    fn day_matches(&self, at: &DateTime<Utc>) -> bool {
        if !self.months.contains(&at.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&at.day());
        let dow = self.days_of_week.contains(&at.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Whether the minute containing `at` is a scheduled slot.
    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        self.day_matches(at) && self.hours.contains(&at.hour()) && self.minutes.contains(&at.minute())
    }

    /// First scheduled minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
        // Four years covers every Feb-29-only schedule.
        let horizon = after + Duration::days(366 * 4);

        while candidate <= horizon {
            if !self.day_matches(&candidate) {
                let start_of_day = candidate.duration_trunc(Duration::days(1)).ok()?;
                candidate = start_of_day + Duration::days(1);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                let start_of_hour = candidate.duration_trunc(Duration::hours(1)).ok()?;
                candidate = start_of_hour + Duration::hours(1);
                continue;
            }
            if self.minutes.contains(&candidate.minute()) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }

    /// Whether a slot falls within `(from, to]`.
    pub fn fires_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.next_after(from).is_some_and(|slot| slot <= to)
    }
}

/// Parse a cron field into its matching values.
fn parse_field(field: &str, min: u32, max: u32) -> SchedulerResult<BTreeSet<u32>> {
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let part = part.trim();
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid(field))?;
                if step == 0 {
                    return Err(invalid(field));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid(field))?;
            let b: u32 = b.parse().map_err(|_| invalid(field))?;
            (a, b)
        } else {
            let n: u32 = range.parse().map_err(|_| invalid(field))?;
            // "N/step" runs from N to the field maximum.
            if part.contains('/') { (n, max) } else { (n, n) }
        };

        if start < min || end > max || start > end {
            return Err(invalid(field));
        }
        values.extend((start..=end).step_by(step as usize));
    }
    Ok(values)
}

fn invalid(field: &str) -> SchedulerError {
    SchedulerError::InvalidRule(format!("invalid cron field '{field}'"))
}
