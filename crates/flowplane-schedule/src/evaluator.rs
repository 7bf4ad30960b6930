//! Schedule evaluator — turns a stored schedule spec into occurrence times.
//!
//! Occurrences are always computed from a cursor (the last fired instant)
//! and are strictly after it, so repeated calls with an advancing cursor
//! never repeat or skip an occurrence no matter how irregularly they are
//! made.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use flowplane_state::ScheduleSpec;

use crate::cron::CronExpr;
use crate::error::{ScheduleError, ScheduleResult};

/// A validated, ready-to-evaluate schedule.
#[derive(Debug, Clone)]
pub enum CompiledSchedule {
    Cron { expr: CronExpr, tz: Tz },
    /// Occurrences at `anchor + k * every` for integer k.
    Interval { every_secs: i64, anchor: DateTime<Utc> },
}

impl CompiledSchedule {
    /// Parse and check a schedule spec. Malformed specs are rejected here so
    /// evaluation itself cannot fail.
    pub fn compile(spec: &ScheduleSpec) -> ScheduleResult<Self> {
        match spec {
            ScheduleSpec::Cron { expression, timezone } => {
                let expr = CronExpr::parse(expression)?;
                let tz: Tz = timezone
                    .parse()
                    .map_err(|_| ScheduleError::UnknownTimezone(timezone.clone()))?;
                // An expression that can never match (e.g. Feb 31) is as good as malformed.
                if expr.next_after(DateTime::<Utc>::UNIX_EPOCH, tz).is_none() {
                    return Err(ScheduleError::InvalidCron {
                        expression: expression.clone(),
                        reason: "expression never fires".to_string(),
                    });
                }
                Ok(CompiledSchedule::Cron { expr, tz })
            }
            ScheduleSpec::Interval { every_secs, anchor } => {
                let every_secs = i64::try_from(*every_secs)
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| {
                        ScheduleError::InvalidInterval(format!("{every_secs}s is not a usable interval"))
                    })?;
                Ok(CompiledSchedule::Interval {
                    every_secs,
                    anchor: *anchor,
                })
            }
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CompiledSchedule::Cron { expr, tz } => expr.next_after(after, *tz),
            CompiledSchedule::Interval { every_secs, anchor } => {
                if after < *anchor {
                    return Some(*anchor);
                }
                // Whole seconds elapsed; the anchor itself is k = 0.
                let elapsed = (after - *anchor).num_seconds();
                let k = elapsed.div_euclid(*every_secs).checked_add(1)?;
                let offset = k.checked_mul(*every_secs)?;
                anchor.checked_add_signed(chrono::Duration::try_seconds(offset)?)
            }
        }
    }

    /// Up to `limit` occurrences strictly after `after`, in order.
    pub fn next_occurrences(&self, after: DateTime<Utc>, limit: usize) -> Vec<DateTime<Utc>> {
        self.occurrences(after, None, limit)
    }

    /// Up to `limit` occurrences in `(after, until]`, in order.
    pub fn occurrences_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        self.occurrences(after, Some(until), limit)
    }

    fn occurrences(
        &self,
        after: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(limit.min(64));
        let mut cursor = after;
        while out.len() < limit {
            let Some(next) = self.next_after(cursor) else {
                break;
            };
            if until.is_some_and(|u| next > u) {
                break;
            }
            out.push(next);
            cursor = next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn every_minute() -> CompiledSchedule {
        CompiledSchedule::compile(&ScheduleSpec::Interval {
            every_secs: 60,
            anchor: t0(),
        })
        .unwrap()
    }

    #[test]
    fn interval_from_last_fired_does_not_refire() {
        // Last fired at t0+60s, evaluated at t0+125s.
        let schedule = every_minute();
        let due = schedule.occurrences_between(t0() + secs(60), t0() + secs(125), 10);
        assert_eq!(due, vec![t0() + secs(120)]);
    }

    #[test]
    fn interval_never_drifts() {
        let schedule = CompiledSchedule::compile(&ScheduleSpec::Interval {
            every_secs: 7,
            anchor: t0() + chrono::Duration::milliseconds(250),
        })
        .unwrap();
        let times = schedule.next_occurrences(t0() + secs(1_000_000), 3);
        for t in &times {
            let since_anchor = *t - (t0() + chrono::Duration::milliseconds(250));
            assert_eq!(since_anchor.num_milliseconds() % 7_000, 0);
        }
        assert!(times.windows(2).all(|w| w[1] - w[0] == secs(7)));
    }

    #[test]
    fn cursor_before_anchor_starts_at_anchor() {
        let schedule = every_minute();
        assert_eq!(schedule.next_after(t0() - secs(3600)), Some(t0()));
        assert_eq!(schedule.next_after(t0()), Some(t0() + secs(60)));
    }

    #[test]
    fn split_evaluation_matches_single_pass() {
        let schedules = [
            every_minute(),
            CompiledSchedule::compile(&ScheduleSpec::Cron {
                expression: "*/7 9-17 * * mon-fri".to_string(),
                timezone: "Europe/Berlin".to_string(),
            })
            .unwrap(),
        ];
        for schedule in schedules {
            let single = schedule.next_occurrences(t0(), 40);

            let mut split = schedule.next_occurrences(t0(), 13);
            let cursor = *split.last().unwrap();
            split.extend(schedule.next_occurrences(cursor, 27));

            assert_eq!(single, split);
        }
    }

    #[test]
    fn occurrences_respect_limit_and_window() {
        let schedule = every_minute();
        assert_eq!(schedule.next_occurrences(t0(), 5).len(), 5);
        assert!(schedule.occurrences_between(t0(), t0() + secs(59), 5).is_empty());
        assert_eq!(schedule.occurrences_between(t0(), t0() + secs(60), 5), vec![t0() + secs(60)]);
    }

    #[test]
    fn malformed_specs_are_rejected_at_compile_time() {
        let bad = [
            ScheduleSpec::Cron {
                expression: "61 * * * *".to_string(),
                timezone: "UTC".to_string(),
            },
            ScheduleSpec::Cron {
                expression: "0 0 * * *".to_string(),
                timezone: "Mars/Olympus".to_string(),
            },
            ScheduleSpec::Cron {
                expression: "0 0 30 2 *".to_string(),
                timezone: "UTC".to_string(),
            },
            ScheduleSpec::Interval {
                every_secs: 0,
                anchor: t0(),
            },
        ];
        for spec in bad {
            let err = CompiledSchedule::compile(&spec).unwrap_err();
            assert_eq!(err.kind(), Some(flowplane_state::ErrorKind::ConfigurationError));
        }
    }
}
