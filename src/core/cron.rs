//! Cron expressions - five-field Unix grammar and next-fire computation
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each field is a
//! comma list of `*`, `*/N`, literals, ranges `a-b` and stepped ranges
//! `a-b/N`. Month and weekday fields also accept three-letter names, and
//! `7` is Sunday like `0`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Cron expression parse error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// How far ahead `next_after` searches before giving up (e.g. `0 0 30 2 *`)
const SEARCH_YEARS: i32 = 5;

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};

const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};

const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};

const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
};

const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

impl FieldSpec {
    fn error(&self, value: &str, reason: impl Into<String>) -> CronError {
        CronError::Field {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn value(&self, field: &str, token: &str) -> Result<u32, CronError> {
        let lower = token.to_ascii_lowercase();
        if let Some(pos) = self.names.iter().position(|n| *n == lower) {
            return Ok(self.min + pos as u32);
        }

        let value: u32 = token
            .parse()
            .map_err(|_| self.error(field, format!("'{}' is not a number", token)))?;

        if value < self.min || value > self.max {
            return Err(self.error(
                field,
                format!("{} is outside {}-{}", value, self.min, self.max),
            ));
        }
        Ok(value)
    }

    /// Parse one field into a bitmask of allowed values
    fn parse(&self, field: &str) -> Result<u64, CronError> {
        let mut mask = 0u64;

        for part in field.split(',') {
            if part.is_empty() {
                return Err(self.error(field, "empty list element"));
            }

            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| self.error(field, format!("bad step '{}'", step)))?;
                    if step == 0 {
                        return Err(self.error(field, "step must be greater than zero"));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (lo, hi) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (lo, hi) = (self.value(field, a)?, self.value(field, b)?);
                if lo > hi {
                    return Err(self.error(field, format!("range {}-{} is reversed", lo, hi)));
                }
                (lo, hi)
            } else {
                let v = self.value(field, range)?;
                // `5/15` means "from 5 to the end, every 15"
                if step.is_some() {
                    (v, self.max)
                } else {
                    (v, v)
                }
            };

            for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
                mask |= 1 << v;
            }
        }

        Ok(mask)
    }
}

/// A parsed cron schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a five-field expression
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = DAY_OF_WEEK.parse(fields[4])?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: MINUTE.parse(fields[0])?,
            hours: HOUR.parse(fields[1])?,
            days_of_month: DAY_OF_MONTH.parse(fields[2])?,
            months: MONTH.parse(fields[3])?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    /// The normalized expression text
    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;

        // Unix cron: when both day fields are restricted either one may match
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether the schedule fires during the minute containing `at`
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        let t = at.naive_local();
        self.months & (1 << t.month()) != 0
            && self.day_matches(t.date())
            && self.hours & (1 << t.hour()) != 0
            && self.minutes & (1 << t.minute()) != 0
    }

    /// First fire time strictly after `after`, in the same time zone.
    ///
    /// Local minutes skipped by a DST transition never fire.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let start = after.naive_local();
        let mut t = start.date().and_hms_opt(start.hour(), start.minute(), 0)? + Duration::minutes(1);
        let limit = t.year() + SEARCH_YEARS;

        while t.year() <= limit {
            if self.months & (1 << t.month()) == 0 {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t += Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&t).earliest() {
                Some(fire) if fire > *after => return Some(fire),
                _ => t += Duration::minutes(1),
            }
        }

        None
    }

    /// The next `count` fire times after `after`
    pub fn upcoming<Tz: TimeZone>(&self, after: &DateTime<Tz>, count: usize) -> Vec<DateTime<Tz>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after.clone();
        while out.len() < count {
            match self.next_after(&cursor) {
                Some(next) => {
                    cursor = next.clone();
                    out.push(next);
                }
                None => break,
            }
        }
        out
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_minute() {
        let cron = CronSchedule::parse("* * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 10, 2, 30).unwrap();
        assert_eq!(cron.next_after(&from), Some(at(2025, 3, 1, 10, 3)));
    }

    #[test]
    fn test_interval_field() {
        let cron = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(cron.next_after(&at(2025, 3, 1, 10, 2)), Some(at(2025, 3, 1, 10, 5)));
        assert_eq!(cron.next_after(&at(2025, 3, 1, 10, 5)), Some(at(2025, 3, 1, 10, 10)));
        assert_eq!(cron.next_after(&at(2025, 3, 1, 23, 58)), Some(at(2025, 3, 2, 0, 0)));
    }

    #[test]
    fn test_daily_rolls_to_next_day() {
        let cron = CronSchedule::parse("0 3 * * *").unwrap();
        assert_eq!(cron.next_after(&at(2025, 3, 1, 3, 0)), Some(at(2025, 3, 2, 3, 0)));
        assert_eq!(cron.next_after(&at(2025, 12, 31, 4, 0)), Some(at(2026, 1, 1, 3, 0)));
    }

    #[test]
    fn test_lists_ranges_and_names() {
        let cron = CronSchedule::parse("0,30 9-17/4 * jan-mar mon").unwrap();
        // 2025-03-03 is a Monday
        assert_eq!(cron.next_after(&at(2025, 3, 1, 0, 0)), Some(at(2025, 3, 3, 9, 0)));
        assert_eq!(cron.next_after(&at(2025, 3, 3, 9, 0)), Some(at(2025, 3, 3, 9, 30)));
        assert_eq!(cron.next_after(&at(2025, 3, 3, 9, 30)), Some(at(2025, 3, 3, 13, 0)));
        assert_eq!(cron.next_after(&at(2025, 3, 31, 17, 30)), Some(at(2026, 1, 5, 9, 0)));
    }

    #[test]
    fn test_sunday_as_seven() {
        let seven = CronSchedule::parse("0 12 * * 7").unwrap();
        let zero = CronSchedule::parse("0 12 * * 0").unwrap();
        let from = at(2025, 3, 3, 0, 0);
        assert_eq!(seven.next_after(&from), zero.next_after(&from));
        assert_eq!(seven.next_after(&from), Some(at(2025, 3, 9, 12, 0)));
    }

    #[test]
    fn test_day_fields_use_or_when_both_restricted() {
        // 13th of the month or any Friday
        let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2025-03-07 is a Friday, before the 13th
        assert_eq!(cron.next_after(&at(2025, 3, 1, 0, 0)), Some(at(2025, 3, 7, 0, 0)));
        assert_eq!(cron.next_after(&at(2025, 3, 12, 0, 0)), Some(at(2025, 3, 13, 0, 0)));

        // Only day-of-month restricted: weekday does not widen the match
        let cron = CronSchedule::parse("0 0 13 * *").unwrap();
        assert_eq!(cron.next_after(&at(2025, 3, 1, 0, 0)), Some(at(2025, 3, 13, 0, 0)));
    }

    #[test]
    fn test_impossible_date_has_no_fire() {
        let cron = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(&at(2025, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_matches() {
        let cron = CronSchedule::parse("15 8 * * *").unwrap();
        assert!(cron.matches(&at(2025, 6, 1, 8, 15)));
        assert!(!cron.matches(&at(2025, 6, 1, 8, 16)));
    }

    #[test]
    fn test_upcoming() {
        let cron = CronSchedule::parse("0 * * * *").unwrap();
        let fires = cron.upcoming(&at(2025, 3, 1, 10, 30), 3);
        assert_eq!(
            fires,
            vec![at(2025, 3, 1, 11, 0), at(2025, 3, 1, 12, 0), at(2025, 3, 1, 13, 0)]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            CronSchedule::parse("* * * *").unwrap_err(),
            CronError::FieldCount(4)
        );
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5- * * * *").is_err());
        assert!(CronSchedule::parse("* * * foo *").is_err());
        assert!(CronSchedule::parse("10-5 * * * *").is_err());
        assert!(CronSchedule::parse("1,,2 * * * *").is_err());
    }

    #[test]
    fn test_normalizes_whitespace() {
        let cron: CronSchedule = "  */5   *  * * *".parse().unwrap();
        assert_eq!(cron.to_string(), "*/5 * * * *");
    }
}
