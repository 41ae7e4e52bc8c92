//! Next-run computation.
//!
//! Supports standard 5-field cron syntax:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ ┌───────────── day of week (0-6, 0=Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//! with `,` lists, `-` ranges and `/` steps per field.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike, Utc};

use crate::cron::types::Schedule;
use crate::error::CronError;

/// Grace window for overdue one-shot jobs.
const OVERDUE_GRACE_MS: i64 = 1_000;

/// Fallback delay when a cron expression fails to parse at fire time.
const PARSE_FAILURE_DELAY_MS: i64 = 60_000;

/// Compute the next fire time for a schedule, in ms since epoch.
///
/// - `at(t)` in the future fires at `t`; an overdue one-shot is shifted to
///   `now + 1s` so it still fires once.
/// - `every(e, anchor?)` fires at the next interval boundary measured from
///   the anchor (defaulting to `now`).
/// - `cron(expr, tz?)` fires at the next matching minute; a malformed
///   expression degrades to `now + 60s`.
pub fn next_run_at_ms(schedule: &Schedule, now_ms: i64) -> i64 {
    match schedule {
        Schedule::At { at_ms } => {
            if *at_ms > now_ms {
                *at_ms
            } else {
                now_ms + OVERDUE_GRACE_MS
            }
        }
        Schedule::Every { every_ms, anchor_ms } => {
            let every = (*every_ms).max(1);
            let anchor = anchor_ms.unwrap_or(now_ms);
            anchor + ((now_ms - anchor).div_euclid(every) + 1) * every
        }
        Schedule::Cron { expr, tz } => match CronExpression::parse(expr) {
            Ok(parsed) => parsed
                .next_after_ms(now_ms, tz.as_deref())
                .unwrap_or(now_ms + PARSE_FAILURE_DELAY_MS),
            Err(e) => {
                tracing::warn!("Unparseable cron expression {:?}: {}", expr, e);
                now_ms + PARSE_FAILURE_DELAY_MS
            }
        },
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>,
}

impl CronExpression {
    /// Parse an expression like `*/5 * * * *` or `30 2 * * 1-5`.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::InvalidSchedule(format!(
                "expected 5 fields, got {}",
                parts.len()
            )));
        }

        Ok(Self {
            minutes: parse_field(parts[0], 0, 59, "minute")?,
            hours: parse_field(parts[1], 0, 23, "hour")?,
            days: parse_field(parts[2], 1, 31, "day")?,
            months: parse_field(parts[3], 1, 12, "month")?,
            weekdays: parse_field(parts[4], 0, 6, "weekday")?,
        })
    }

    fn matches<Tz: TimeZone>(&self, dt: &DateTime<Tz>) -> bool {
        self.minutes.contains(&dt.minute())
            && self.hours.contains(&dt.hour())
            && self.days.contains(&dt.day())
            && self.months.contains(&dt.month())
            && self
                .weekdays
                .contains(&dt.weekday().num_days_from_sunday())
    }

    /// The next matching minute strictly after `now_ms`.
    ///
    /// `tz` may carry a fixed `+HH:MM` / `-HH:MM` offset; anything else
    /// evaluates in UTC.
    pub fn next_after_ms(&self, now_ms: i64, tz: Option<&str>) -> Option<i64> {
        let offset = match tz.and_then(parse_fixed_offset) {
            Some(offset) => offset,
            None => FixedOffset::east_opt(0)?,
        };
        let now = Utc
            .timestamp_millis_opt(now_ms)
            .single()?
            .with_timezone(&offset);

        // Walk minute by minute; four years bounds leap-year edge cases.
        let mut current = (now + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let max_iterations = 4 * 366 * 24 * 60;
        for _ in 0..max_iterations {
            if self.matches(&current) {
                return Some(current.timestamp_millis());
            }
            current = current + Duration::minutes(1);
        }
        None
    }
}

fn parse_fixed_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    let (sign, rest) = match tz.strip_prefix('+') {
        Some(rest) => (1, rest),
        None => (-1, tz.strip_prefix('-')?),
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    name: &str,
) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(CronError::InvalidSchedule(format!(
                "empty {} component",
                name
            )));
        }

        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str.parse().map_err(|_| {
                    CronError::InvalidSchedule(format!(
                        "invalid step {:?} in {}",
                        step_str, name
                    ))
                })?;
                if step == 0 {
                    return Err(CronError::InvalidSchedule(format!(
                        "step cannot be 0 in {}",
                        name
                    )));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| {
                CronError::InvalidSchedule(format!("invalid range start in {}", name))
            })?;
            let hi: u32 = hi.parse().map_err(|_| {
                CronError::InvalidSchedule(format!("invalid range end in {}", name))
            })?;
            (lo, hi)
        } else {
            let value: u32 = range_part.parse().map_err(|_| {
                CronError::InvalidSchedule(format!(
                    "invalid value {:?} in {}",
                    range_part, name
                ))
            })?;
            (value, value)
        };

        if start < min || end > max || start > end {
            return Err(CronError::InvalidSchedule(format!(
                "range {}-{} out of bounds ({}-{}) in {}",
                start, end, min, max, name
            )));
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            values.insert(value);
            value += step;
        }
    }

    Ok(values)
}
