//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! values, ranges (`a-b`), steps (`*/n`, `a-b/n`, `a/n`) and comma lists.
//! Months and weekdays also accept three-letter names; weekday `7` is
//! Sunday. When both day fields are restricted a day matches if either
//! does (vixie cron semantics). The `@yearly`, `@annually`, `@monthly`,
//! `@weekly`, `@daily`, `@midnight` and `@hourly` aliases are supported.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{ScheduleError, ScheduleResult};

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Longest stretch searched for the next match. Covers Feb 29 across a
/// skipped century leap year.
const SEARCH_DAYS: u64 = 366 * 9;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    /// 0 = Sunday.
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value the names list starts at (1 for months, 0 for weekdays).
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], names_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], names_base: 0 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTHS, names_base: 1 };
// 7 is accepted and folded onto Sunday after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAYS, names_base: 0 };

impl CronExpr {
    pub fn parse(expression: &str) -> ScheduleResult<Self> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@daily" | "@midnight" => "0 0 * * *".to_string(),
            "@hourly" => "0 * * * *".to_string(),
            other if other.starts_with('@') => return Err(invalid(format!("unknown alias {other}"))),
            _ => trimmed.to_string(),
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(fields[0], &MINUTE).map_err(&invalid)?;
        let hours = parse_field(fields[1], &HOUR).map_err(&invalid)?;
        let days_of_month = parse_field(fields[2], &DAY_OF_MONTH).map_err(&invalid)?;
        let months = parse_field(fields[3], &MONTH).map_err(&invalid)?;
        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK).map_err(&invalid)?;
        if days_of_week.contains(&7) {
            days_of_week.retain(|d| *d != 7);
            if !days_of_week.contains(&0) {
                days_of_week.insert(0, 0);
            }
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First firing instant strictly after `after`, evaluated in `tz`.
    ///
    /// Local times that do not exist (DST gap) are skipped; local times that
    /// occur twice fire once, at the earlier instant.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let start = truncate_to_minute(local)? + chrono::Duration::minutes(1);
        let start_date = start.date();
        let last_date = start_date.checked_add_days(Days::new(SEARCH_DAYS))?;

        let mut date = start_date;
        while date <= last_date {
            if self.day_matches(date) {
                let first_day = date == start_date;
                for &hour in &self.hours {
                    if first_day && hour < start.hour() {
                        continue;
                    }
                    for &minute in &self.minutes {
                        if first_day && hour == start.hour() && minute < start.minute() {
                            continue;
                        }
                        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        if let Some(instant) = tz.from_local_datetime(&naive).earliest() {
                            let instant = instant.with_timezone(&Utc);
                            if instant > after {
                                return Some(instant);
                            }
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

fn truncate_to_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    t.with_second(0)?.with_nanosecond(0)
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<Vec<u32>, String> {
    let mut values = Vec::new();
    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty item in {} field", spec.name));
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step {step:?} in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("zero step in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let v = parse_value(range, spec)?;
            // `a/n` runs from a to the end of the field.
            if step.is_some() { (v, spec.max) } else { (v, v) }
        };
        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed in {} field", spec.name));
        }

        let step = step.unwrap_or(1) as usize;
        values.extend((lo..=hi).step_by(step));
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32, String> {
    let lower = token.to_ascii_lowercase();
    if let Some(idx) = spec.names.iter().position(|n| *n == lower) {
        return Ok(idx as u32 + spec.names_base);
    }
    let value: u32 = token
        .parse()
        .map_err(|_| format!("invalid value {token:?} in {} field", spec.name))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{value} is outside {}-{} in {} field",
            spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_lists_ranges_and_steps() {
        let expr = CronExpr::parse("*/15 9-17/4 1,15 * mon-fri").unwrap();
        assert_eq!(expr.minutes, vec![0, 15, 30, 45]);
        assert_eq!(expr.hours, vec![9, 13, 17]);
        assert_eq!(expr.days_of_month, vec![1, 15]);
        assert_eq!(expr.months.len(), 12);
        assert_eq!(expr.days_of_week, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn names_aliases_and_sunday_seven() {
        assert_eq!(CronExpr::parse("@daily").unwrap(), CronExpr::parse("0 0 * * *").unwrap());
        let expr = CronExpr::parse("0 12 * JAN,dec 7").unwrap();
        assert_eq!(expr.months, vec![1, 12]);
        assert_eq!(expr.days_of_week, vec![0]);
        assert_eq!(CronExpr::parse("5/20 * * * *").unwrap().minutes, vec![5, 25, 45]);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in ["", "* * * *", "60 * * * *", "* 24 * * *", "*/0 * * * *", "5-1 * * * *", "@often", "a b c d e", "1,,2 * * * *"] {
            assert!(
                matches!(CronExpr::parse(bad), Err(ScheduleError::InvalidCron { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn next_is_strictly_after() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        let at = utc(2026, 3, 1, 10, 0);
        assert_eq!(expr.next_after(at, UTC), Some(utc(2026, 3, 1, 11, 0)));
        assert_eq!(
            expr.next_after(at - chrono::Duration::seconds(1), UTC),
            Some(at)
        );
    }

    #[test]
    fn day_fields_combine_with_or_when_both_restricted() {
        // 13th of the month or any Friday. 2026-03-06 is a Friday.
        let expr = CronExpr::parse("0 0 13 * 5").unwrap();
        assert_eq!(expr.next_after(utc(2026, 3, 1, 0, 0), UTC), Some(utc(2026, 3, 6, 0, 0)));
        assert_eq!(expr.next_after(utc(2026, 3, 6, 0, 0), UTC), Some(utc(2026, 3, 13, 0, 0)));

        // Only weekday restricted: plain AND with "every day".
        let mondays = CronExpr::parse("30 8 * * 1").unwrap();
        assert_eq!(mondays.next_after(utc(2026, 3, 1, 0, 0), UTC), Some(utc(2026, 3, 2, 8, 30)));
    }

    #[test]
    fn evaluated_in_schedule_timezone() {
        // 09:00 in New York during EST is 14:00 UTC.
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        assert_eq!(
            expr.next_after(utc(2026, 1, 10, 0, 0), New_York),
            Some(utc(2026, 1, 10, 14, 0))
        );
    }

    #[test]
    fn dst_gap_is_skipped() {
        // 2026-03-08 02:30 does not exist in New York.
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        let next = expr.next_after(utc(2026, 3, 7, 12, 0), New_York).unwrap();
        assert_eq!(next, utc(2026, 3, 9, 6, 30));
    }

    #[test]
    fn ambiguous_local_time_fires_once() {
        // 2026-11-01 01:30 happens twice in New York; only the EDT one fires.
        let expr = CronExpr::parse("30 1 * * *").unwrap();
        let first = expr.next_after(utc(2026, 10, 31, 12, 0), New_York).unwrap();
        assert_eq!(first, utc(2026, 11, 1, 5, 30));
        let second = expr.next_after(first, New_York).unwrap();
        assert_eq!(second, utc(2026, 11, 2, 6, 30));
    }

    #[test]
    fn leap_day_is_found() {
        let expr = CronExpr::parse("0 0 29 2 *").unwrap();
        assert_eq!(expr.next_after(utc(2026, 3, 1, 0, 0), UTC), Some(utc(2028, 2, 29, 0, 0)));
    }

    #[test]
    fn impossible_date_never_fires() {
        let expr = CronExpr::parse("0 0 31 2 *").unwrap();
        assert_eq!(expr.next_after(utc(2026, 3, 1, 0, 0), UTC), None);
    }
}
