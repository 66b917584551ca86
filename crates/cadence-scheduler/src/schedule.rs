use chrono::{DateTime, Duration, Utc};

use crate::{
    cron::CronExpression,
    error::{Result, SchedulerError},
    types::{Schedule, TriggerSpec},
};

/// Compute the next UTC fire time for `spec` strictly *after* `after`.
///
/// `fired` is the number of times the trigger has already fired; it only
/// matters for `max_fires`. Returns `None` when the trigger is exhausted:
/// a `Once` instant in the past, `end_at` passed, the repeat count used up,
/// or a cron expression with no occurrence in the next five years.
///
/// Pure: same inputs, same answer. Assumes `spec` passed [`validate`]; an
/// unparsable cron expression yields `None`.
pub fn next_fire_time(spec: &TriggerSpec, after: DateTime<Utc>, fired: u32) -> Option<DateTime<Utc>> {
    if spec.max_fires.is_some_and(|max| fired >= max) {
        return None;
    }

    let candidate = match &spec.schedule {
        Schedule::Once { at } => {
            if *at > after {
                Some(*at)
            } else {
                None
            }
        }

        Schedule::Interval { every_secs } => match spec.start_at {
            // The first fire of a deferred interval trigger is its start.
            Some(start) if start > after => Some(start),
            _ => Some(after + Duration::seconds(*every_secs as i64)),
        },

        Schedule::Cron { expression } => {
            let cron = CronExpression::parse(expression).ok()?;
            match spec.start_at {
                // Search from just before the start so a start that itself
                // matches is included.
                Some(start) if start > after => {
                    let mut c = cron.next_after((start - Duration::seconds(1)).max(after))?;
                    while c < start {
                        c = cron.next_after(c)?;
                    }
                    Some(c)
                }
                _ => cron.next_after(after),
            }
        }
    }?;

    match spec.end_at {
        Some(end) if candidate > end => None,
        _ => Some(candidate),
    }
}

/// Reject schedules that can never be evaluated.
pub fn validate(spec: &TriggerSpec) -> Result<()> {
    match &spec.schedule {
        Schedule::Once { .. } => {}
        Schedule::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(SchedulerError::Configuration(format!(
                    "trigger {}: interval must be greater than 0 seconds",
                    spec.id
                )));
            }
            if *every_secs > i64::MAX as u64 / 1000 {
                return Err(SchedulerError::Configuration(format!(
                    "trigger {}: interval of {every_secs}s is too large",
                    spec.id
                )));
            }
        }
        Schedule::Cron { expression } => {
            CronExpression::parse(expression)?;
        }
    }

    if let (Some(start), Some(end)) = (spec.start_at, spec.end_at) {
        if end < start {
            return Err(SchedulerError::Configuration(format!(
                "trigger {}: end_at {end} precedes start_at {start}",
                spec.id
            )));
        }
    }

    if spec.max_fires == Some(0) {
        return Err(SchedulerError::Configuration(format!(
            "trigger {}: max_fires must be at least 1",
            spec.id
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Schedule;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn spec(schedule: Schedule) -> TriggerSpec {
        TriggerSpec::new("t1", "j1", schedule)
    }

    #[test]
    fn interval_adds_period() {
        let s = spec(Schedule::every_secs(60));
        assert_eq!(
            next_fire_time(&s, at("2024-01-01T00:00:00Z"), 0),
            Some(at("2024-01-01T00:01:00Z"))
        );
    }

    #[test]
    fn interval_waits_for_start() {
        let s = spec(Schedule::every_secs(60)).starting_at(at("2024-01-01T06:00:00Z"));
        assert_eq!(
            next_fire_time(&s, at("2024-01-01T00:00:00Z"), 0),
            Some(at("2024-01-01T06:00:00Z"))
        );
        assert_eq!(
            next_fire_time(&s, at("2024-01-01T06:00:00Z"), 1),
            Some(at("2024-01-01T06:01:00Z"))
        );
    }

    #[test]
    fn end_bound_clips() {
        let s = spec(Schedule::every_secs(60)).ending_at(at("2024-01-01T00:01:30Z"));
        assert_eq!(
            next_fire_time(&s, at("2024-01-01T00:00:00Z"), 0),
            Some(at("2024-01-01T00:01:00Z"))
        );
        assert_eq!(next_fire_time(&s, at("2024-01-01T00:01:00Z"), 1), None);
    }

    #[test]
    fn repeat_count_exhausts() {
        let s = spec(Schedule::every_secs(10)).with_max_fires(2);
        let t0 = at("2024-01-01T00:00:00Z");
        assert!(next_fire_time(&s, t0, 0).is_some());
        assert!(next_fire_time(&s, t0, 1).is_some());
        assert_eq!(next_fire_time(&s, t0, 2), None);
    }

    #[test]
    fn once_fires_only_in_future() {
        let s = spec(Schedule::once(at("2024-01-01T12:00:00Z")));
        assert_eq!(
            next_fire_time(&s, at("2024-01-01T11:00:00Z"), 0),
            Some(at("2024-01-01T12:00:00Z"))
        );
        assert_eq!(next_fire_time(&s, at("2024-01-01T12:00:00Z"), 0), None);
    }

    #[test]
    fn cron_respects_start_inclusive() {
        let s = spec(Schedule::cron("0 * * * *")).starting_at(at("2024-01-01T05:00:00Z"));
        assert_eq!(
            next_fire_time(&s, at("2024-01-01T00:00:00Z"), 0),
            Some(at("2024-01-01T05:00:00Z"))
        );
        assert_eq!(
            next_fire_time(&s, at("2024-01-01T05:00:00Z"), 1),
            Some(at("2024-01-01T06:00:00Z"))
        );
    }

    #[test]
    fn results_are_strictly_later() {
        let t0 = at("2024-03-10T01:59:59Z");
        for s in [
            spec(Schedule::every_secs(1)),
            spec(Schedule::cron("* * * * * *")),
            spec(Schedule::cron("0 0 1 1 *")),
        ] {
            let next = next_fire_time(&s, t0, 0).unwrap();
            assert!(next > t0);
            assert_eq!(Some(next), next_fire_time(&s, t0, 0));
        }
    }

    #[test]
    fn validate_rejects_bad_specs() {
        assert!(validate(&spec(Schedule::every_secs(0))).is_err());
        assert!(validate(&spec(Schedule::cron("not cron"))).is_err());
        assert!(validate(
            &spec(Schedule::every_secs(5))
                .starting_at(at("2024-01-02T00:00:00Z"))
                .ending_at(at("2024-01-01T00:00:00Z"))
        )
        .is_err());
        assert!(validate(&spec(Schedule::every_secs(5)).with_max_fires(0)).is_err());
        assert!(validate(&spec(Schedule::cron("@hourly"))).is_ok());
    }
}
