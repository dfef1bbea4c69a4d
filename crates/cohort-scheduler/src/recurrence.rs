//! Recurrence calculator: pattern + anchor date → next due date(s).
//!
//! Built-in kinds are pure date arithmetic. `Custom` patterns name a rule
//! function registered on the calculator; the calculator treats it as opaque
//! and only checks that it moves strictly forward.
//!
//! Weekday indices run 0 = Sunday … 6 = Saturday.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};

/// Base unit of a recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    Custom,
}

/// When a recurrence stops producing occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndCondition {
    /// Last permitted date (inclusive).
    Until { end_date: NaiveDate },
    /// Total number of occurrences.
    Count { max_occurrences: u32 },
}

/// How often something repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub kind: RecurrenceKind,
    /// Multiplier of the base unit (every N days/weeks/months…).
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Weekly only.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub days_of_week: BTreeSet<u8>,
    /// Monthly (required) and Quarterly (defaults to the anchor's day).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u8>,
    /// Custom only: name of a rule registered on the calculator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EndCondition>,
}

fn default_interval() -> u32 {
    1
}

impl RecurrencePattern {
    fn base(kind: RecurrenceKind, interval: u32) -> Self {
        Self {
            kind,
            interval,
            days_of_week: BTreeSet::new(),
            day_of_month: None,
            custom_rule: None,
            end: None,
        }
    }

    pub fn daily(interval: u32) -> Self {
        Self::base(RecurrenceKind::Daily, interval)
    }

    pub fn weekly(interval: u32, days: impl IntoIterator<Item = u8>) -> Self {
        Self {
            days_of_week: days.into_iter().collect(),
            ..Self::base(RecurrenceKind::Weekly, interval)
        }
    }

    pub fn monthly(interval: u32, day_of_month: u8) -> Self {
        Self {
            day_of_month: Some(day_of_month),
            ..Self::base(RecurrenceKind::Monthly, interval)
        }
    }

    pub fn quarterly(interval: u32) -> Self {
        Self::base(RecurrenceKind::Quarterly, interval)
    }

    pub fn yearly(interval: u32) -> Self {
        Self::base(RecurrenceKind::Yearly, interval)
    }

    pub fn custom(rule: &str) -> Self {
        Self {
            custom_rule: Some(rule.to_string()),
            ..Self::base(RecurrenceKind::Custom, 1)
        }
    }

    /// Stop after `end_date` (inclusive).
    pub fn until(mut self, end_date: NaiveDate) -> Self {
        self.end = Some(EndCondition::Until { end_date });
        self
    }

    /// Stop after `max_occurrences` occurrences.
    pub fn count(mut self, max_occurrences: u32) -> Self {
        self.end = Some(EndCondition::Count { max_occurrences });
        self
    }

    /// Check structural invariants that don't depend on registered rules.
    pub fn validate_structure(&self) -> SchedulerResult<()> {
        if self.interval == 0 {
            return Err(SchedulerError::InvalidPattern("interval must be >= 1".into()));
        }
        match self.kind {
            RecurrenceKind::Weekly => {
                if self.days_of_week.is_empty() {
                    return Err(SchedulerError::InvalidPattern(
                        "weekly pattern needs at least one weekday".into(),
                    ));
                }
                if let Some(bad) = self.days_of_week.iter().find(|d| **d > 6) {
                    return Err(SchedulerError::InvalidPattern(format!(
                        "weekday index out of range: {bad}"
                    )));
                }
            }
            RecurrenceKind::Monthly => match self.day_of_month {
                Some(day) if (1..=31).contains(&day) => {}
                Some(day) => {
                    return Err(SchedulerError::InvalidPattern(format!(
                        "day of month out of range: {day}"
                    )));
                }
                None => {
                    return Err(SchedulerError::InvalidPattern(
                        "monthly pattern needs a day of month".into(),
                    ));
                }
            },
            RecurrenceKind::Quarterly => {
                if let Some(day) = self.day_of_month
                    && !(1..=31).contains(&day)
                {
                    return Err(SchedulerError::InvalidPattern(format!(
                        "day of month out of range: {day}"
                    )));
                }
            }
            RecurrenceKind::Custom => {
                if self.custom_rule.as_deref().is_none_or(str::is_empty) {
                    return Err(SchedulerError::InvalidPattern(
                        "custom pattern needs a rule name".into(),
                    ));
                }
            }
            RecurrenceKind::Daily | RecurrenceKind::Yearly => {}
        }
        Ok(())
    }
}

/// Caller-supplied next-date function for `Custom` patterns.
pub type CustomRule = Arc<dyn Fn(NaiveDate) -> NaiveDate + Send + Sync>;

/// Computes occurrence dates for recurrence patterns.
#[derive(Default)]
pub struct RecurrenceCalculator {
    custom: RwLock<HashMap<String, CustomRule>>,
}

impl RecurrenceCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named rule usable by `Custom` patterns.
    pub fn register_rule<F>(&self, name: &str, rule: F)
    where
        F: Fn(NaiveDate) -> NaiveDate + Send + Sync + 'static,
    {
        tracing::debug!("📐 Custom recurrence rule registered: {name}");
        self.custom
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(rule));
    }

    /// Full validation, including that custom rules are registered.
    pub fn validate(&self, pattern: &RecurrencePattern) -> SchedulerResult<()> {
        pattern.validate_structure()?;
        if pattern.kind == RecurrenceKind::Custom {
            self.custom_rule(pattern)?;
        }
        Ok(())
    }

    fn custom_rule(&self, pattern: &RecurrencePattern) -> SchedulerResult<CustomRule> {
        let name = pattern.custom_rule.as_deref().unwrap_or_default();
        self.custom
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidPattern(format!("unknown custom rule: {name}")))
    }

    /// Next occurrence strictly after `anchor`. End conditions are not applied here.
    pub fn next_occurrence(
        &self,
        pattern: &RecurrencePattern,
        anchor: NaiveDate,
    ) -> SchedulerResult<NaiveDate> {
        self.validate(pattern)?;
        match pattern.kind {
            RecurrenceKind::Daily => add_days(anchor, u64::from(pattern.interval)),
            RecurrenceKind::Weekly => next_weekly(pattern, anchor),
            RecurrenceKind::Monthly => {
                let day = pattern.day_of_month.unwrap_or(1);
                add_months_clamped(anchor, pattern.interval, u32::from(day))
            }
            RecurrenceKind::Quarterly => {
                let day = pattern
                    .day_of_month
                    .map(u32::from)
                    .unwrap_or_else(|| anchor.day());
                let months = pattern.interval.checked_mul(3).ok_or_else(out_of_range)?;
                add_months_clamped(anchor, months, day)
            }
            RecurrenceKind::Yearly => {
                let year = i32::try_from(pattern.interval)
                    .ok()
                    .and_then(|n| anchor.year().checked_add(n))
                    .ok_or_else(out_of_range)?;
                let day = anchor.day().min(days_in_month(year, anchor.month()));
                NaiveDate::from_ymd_opt(year, anchor.month(), day).ok_or_else(out_of_range)
            }
            RecurrenceKind::Custom => {
                let rule = self.custom_rule(pattern)?;
                let next = rule(anchor);
                if next <= anchor {
                    return Err(SchedulerError::InvalidPattern(format!(
                        "custom rule returned {next}, not after anchor {anchor}"
                    )));
                }
                Ok(next)
            }
        }
    }

    /// Lazily enumerate occurrences after `anchor` up to `window_end` (inclusive),
    /// honouring the pattern's end condition. Each call starts over from `anchor`.
    pub fn occurrences_between(
        &self,
        pattern: &RecurrencePattern,
        anchor: NaiveDate,
        window_end: NaiveDate,
    ) -> SchedulerResult<Occurrences<'_>> {
        self.validate(pattern)?;
        match pattern.end {
            Some(EndCondition::Until { end_date }) if anchor >= end_date => {
                return Err(SchedulerError::ExhaustedPattern(format!(
                    "anchor {anchor} is not before end date {end_date}"
                )));
            }
            Some(EndCondition::Count { max_occurrences: 0 }) => {
                return Err(SchedulerError::ExhaustedPattern(
                    "pattern allows no occurrences".into(),
                ));
            }
            _ => {}
        }
        Ok(Occurrences {
            calculator: self,
            pattern: pattern.clone(),
            current: anchor,
            window_end,
            emitted: 0,
            done: false,
        })
    }

    /// Fail with `ExhaustedPattern` if `due` may not be emitted after
    /// `generated` earlier occurrences.
    pub fn ensure_within_end(
        &self,
        pattern: &RecurrencePattern,
        due: NaiveDate,
        generated: u32,
    ) -> SchedulerResult<()> {
        match pattern.end {
            Some(EndCondition::Count { max_occurrences }) if generated >= max_occurrences => {
                Err(SchedulerError::ExhaustedPattern(format!(
                    "all {max_occurrences} occurrences generated"
                )))
            }
            Some(EndCondition::Until { end_date }) if due > end_date => {
                Err(SchedulerError::ExhaustedPattern(format!(
                    "{due} is past end date {end_date}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Iterator returned by [`RecurrenceCalculator::occurrences_between`].
pub struct Occurrences<'a> {
    calculator: &'a RecurrenceCalculator,
    pattern: RecurrencePattern,
    current: NaiveDate,
    window_end: NaiveDate,
    emitted: u32,
    done: bool,
}

impl Iterator for Occurrences<'_> {
    type Item = SchedulerResult<NaiveDate>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(EndCondition::Count { max_occurrences }) = self.pattern.end
            && self.emitted >= max_occurrences
        {
            self.done = true;
            return None;
        }
        let next = match self.calculator.next_occurrence(&self.pattern, self.current) {
            Ok(next) => next,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let past_end = matches!(
            self.pattern.end,
            Some(EndCondition::Until { end_date }) if next > end_date
        );
        if next > self.window_end || past_end {
            self.done = true;
            return None;
        }
        self.current = next;
        self.emitted += 1;
        Some(Ok(next))
    }
}

fn out_of_range() -> SchedulerError {
    SchedulerError::InvalidPattern("date out of range".into())
}

fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

fn add_days(date: NaiveDate, days: u64) -> SchedulerResult<NaiveDate> {
    date.checked_add_days(Days::new(days)).ok_or_else(out_of_range)
}

/// Next configured weekday after `anchor`; crossing the week boundary (the
/// lowest configured weekday) skips `interval - 1` extra weeks.
fn next_weekly(pattern: &RecurrencePattern, anchor: NaiveDate) -> SchedulerResult<NaiveDate> {
    let first_day = pattern
        .days_of_week
        .first()
        .copied()
        .ok_or_else(|| SchedulerError::InvalidPattern("no weekdays".into()))?;

    let mut candidate = add_days(anchor, 1)?;
    while !pattern.days_of_week.contains(&weekday_index(candidate)) {
        candidate = add_days(candidate, 1)?;
    }

    if pattern.interval > 1 && weekday_index(candidate) == first_day {
        candidate = add_days(candidate, u64::from(pattern.interval - 1) * 7)?;
    }
    Ok(candidate)
}

/// `day` of the month `months` after `anchor`'s month, clamped to that month's length.
fn add_months_clamped(anchor: NaiveDate, months: u32, day: u32) -> SchedulerResult<NaiveDate> {
    let target = anchor
        .with_day(1)
        .and_then(|first| first.checked_add_months(Months::new(months)))
        .ok_or_else(out_of_range)?;
    let day = day.min(days_in_month(target.year(), target.month()));
    NaiveDate::from_ymd_opt(target.year(), target.month(), day).ok_or_else(out_of_range)
}

pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
