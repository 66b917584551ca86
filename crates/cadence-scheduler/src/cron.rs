//! Cron expression parsing and next-occurrence search (UTC).
//!
//! Accepted forms:
//! - 5 fields: `min hour dom mon dow` (seconds fixed at 0)
//! - 6 fields: `sec min hour dom mon dow`
//! - macros: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight`, `@hourly`
//!
//! Tokens per field: `*`, `?` (dom/dow only), `a`, `a-b`, `a,b,c`, `*/n`,
//! `a-b/n`, `a/n`. Months accept `JAN..DEC`, weekdays `SUN..SAT`; `7` is
//! Sunday as well as `0`.
//!
//! Day matching follows Vixie cron: when both day-of-month and day-of-week
//! are restricted a day matches if *either* matches. A field counts as
//! unrestricted when it starts with `*` or `?` (so `*/2` in day-of-month
//! leaves day-of-week in charge when that one is restricted).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::SchedulerError;

/// Searching further than this without a match means the expression can
/// never fire (e.g. `0 0 30 2 *`).
const MAX_SEARCH_DAYS: i64 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression. Each field is a bit set of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        expr.parse()
    }

    /// The expression as originally written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// First instant strictly after `after` that matches, or `None` when
    /// nothing matches within five years.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        let limit = after + Duration::days(MAX_SEARCH_DAYS);

        loop {
            if t > limit {
                return None;
            }

            if !has_bit(self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }

            if !self.day_matches(t) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }

            match next_bit(self.hours, t.hour(), 23) {
                Some(h) if h == t.hour() => {}
                Some(h) => {
                    t = with_hms(t, h, 0, 0)?;
                    continue;
                }
                None => {
                    t = start_of_day(t)? + Duration::days(1);
                    continue;
                }
            }

            match next_bit(self.minutes, t.minute(), 59) {
                Some(m) if m == t.minute() => {}
                Some(m) => {
                    t = with_hms(t, t.hour(), m, 0)?;
                    continue;
                }
                None => {
                    t = with_hms(t, t.hour(), 0, 0)? + Duration::hours(1);
                    continue;
                }
            }

            match next_bit(self.seconds, t.second(), 59) {
                Some(s) if s == t.second() => return Some(t),
                Some(s) => {
                    t = with_hms(t, t.hour(), t.minute(), s)?;
                }
                None => {
                    t = with_hms(t, t.hour(), t.minute(), 0)? + Duration::minutes(1);
                }
            }
        }
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = has_bit(self.days_of_month, t.day());
        let dow = has_bit(self.days_of_week, t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let invalid =
            |detail: String| SchedulerError::Configuration(format!("invalid cron expression '{expr}': {detail}"));

        let trimmed = expr.trim();
        let expanded = match trimmed {
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            "@monthly" => "0 0 0 1 * *",
            "@weekly" => "0 0 0 * * 0",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@hourly" => "0 0 * * * *",
            other if other.starts_with('@') => {
                return Err(invalid(format!("unknown macro {other}")));
            }
            other => other,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        let (sec, rest) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            n => return Err(invalid(format!("expected 5 or 6 fields, found {n}"))),
        };

        let seconds = parse_field(sec, 0, 59, None).map_err(invalid)?;
        let minutes = parse_field(rest[0], 0, 59, None).map_err(invalid)?;
        let hours = parse_field(rest[1], 0, 23, None).map_err(invalid)?;
        let days_of_month = parse_field(rest[2], 1, 31, None).map_err(invalid)?;
        let months = parse_field(rest[3], 1, 12, Some((&MONTH_NAMES, 1))).map_err(invalid)?;
        // 0..=7 so that "7" and ranges like "5-7" parse; bit 7 folds into Sunday.
        let mut days_of_week = parse_field(rest[4], 0, 7, Some((&WEEKDAY_NAMES, 0))).map_err(invalid)?;
        if has_bit(days_of_week, 7) {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_restricted(token: &str) -> bool {
    !(token.starts_with('*') || token.starts_with('?'))
}

/// Parse one field into a bit set over `min..=max`.
fn parse_field(
    token: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> Result<u64, String> {
    let mut mask = 0u64;

    for part in token.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in '{token}'"));
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be greater than 0".to_string());
                }
                (base, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if base == "*" || base == "?" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            let lo = parse_value(a, min, max, names)?;
            let hi = parse_value(b, min, max, names)?;
            if lo > hi {
                return Err(format!("range {base} is reversed"));
            }
            (lo, hi)
        } else {
            let v = parse_value(base, min, max, names)?;
            // "a/n" means every n-th value starting at a.
            if step.is_some() {
                (v, max)
            } else {
                (v, v)
            }
        };

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            mask |= 1 << v;
        }
    }

    Ok(mask)
}

fn parse_value(raw: &str, min: u32, max: u32, names: Option<(&[&str], u32)>) -> Result<u32, String> {
    if let Some((table, offset)) = names {
        let upper = raw.to_ascii_uppercase();
        if let Some(pos) = table.iter().position(|n| *n == upper) {
            return Ok(pos as u32 + offset);
        }
    }
    let v: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value '{raw}'"))?;
    if v < min || v > max {
        return Err(format!("value {v} out of range {min}-{max}"));
    }
    Ok(v)
}

fn has_bit(mask: u64, v: u32) -> bool {
    mask & (1 << v) != 0
}

/// Smallest allowed value `>= from`, if any, within `..=max`.
fn next_bit(mask: u64, from: u32, max: u32) -> Option<u32> {
    (from..=max).find(|v| has_bit(mask, *v))
}

fn with_hms(t: DateTime<Utc>, h: u32, m: u32, s: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), h, m, s).single()
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    with_hms(t, 0, 0, 0)
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (y, m) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, from: &str) -> Option<DateTime<Utc>> {
        CronExpression::parse(expr).unwrap().next_after(at(from))
    }

    #[test]
    fn every_minute_rounds_up_to_next_minute() {
        assert_eq!(
            next("* * * * *", "2024-09-01T12:00:30Z"),
            Some(at("2024-09-01T12:01:00Z"))
        );
    }

    #[test]
    fn six_field_expression_uses_seconds() {
        assert_eq!(
            next("*/15 * * * * *", "2024-09-01T12:00:14Z"),
            Some(at("2024-09-01T12:00:15Z"))
        );
        assert_eq!(
            next("*/15 * * * * *", "2024-09-01T12:00:45.500Z"),
            Some(at("2024-09-01T12:01:00Z"))
        );
    }

    #[test]
    fn exact_match_is_not_returned_again() {
        assert_eq!(
            next("0 9 * * *", "2024-09-01T09:00:00Z"),
            Some(at("2024-09-02T09:00:00Z"))
        );
    }

    #[test]
    fn hour_and_minute_rollover() {
        assert_eq!(
            next("30 23 * * *", "2024-12-31T23:45:00Z"),
            Some(at("2025-01-01T23:30:00Z"))
        );
        assert_eq!(
            next("0 */6 * * *", "2024-09-01T19:00:00Z"),
            Some(at("2024-09-02T00:00:00Z"))
        );
    }

    // Vixie convention: dom and dow both restricted -> either may match.
    // 2024-09-01 is a Sunday; the first Friday (Sep 6) comes before the 13th.
    #[test]
    fn dom_and_dow_restricted_match_either() {
        assert_eq!(
            next("0 0 13 * FRI", "2024-09-01T00:00:00Z"),
            Some(at("2024-09-06T00:00:00Z"))
        );
        assert_eq!(
            next("0 0 13 * FRI", "2024-09-12T00:00:00Z"),
            Some(at("2024-09-13T00:00:00Z"))
        );
    }

    #[test]
    fn only_restricted_day_field_constrains() {
        assert_eq!(
            next("0 0 13 * *", "2024-09-01T00:00:00Z"),
            Some(at("2024-09-13T00:00:00Z"))
        );
        assert_eq!(
            next("0 0 * * 5", "2024-09-07T00:00:00Z"),
            Some(at("2024-09-13T00:00:00Z"))
        );
        // A dom field starting with '*' counts as unrestricted.
        assert_eq!(
            next("0 0 */2 * MON", "2024-09-01T00:00:00Z"),
            Some(at("2024-09-02T00:00:00Z"))
        );
    }

    #[test]
    fn sunday_as_seven_and_names() {
        let a = CronExpression::parse("0 0 * * 7").unwrap();
        let b = CronExpression::parse("0 0 * * SUN").unwrap();
        let from = at("2024-09-02T00:00:00Z");
        assert_eq!(a.next_after(from), Some(at("2024-09-08T00:00:00Z")));
        assert_eq!(a.next_after(from), b.next_after(from));

        assert_eq!(
            next("0 9 * jan-mar mon-fri", "2024-09-01T00:00:00Z"),
            Some(at("2025-01-01T09:00:00Z"))
        );
    }

    #[test]
    fn leap_day_is_found_across_years() {
        assert_eq!(
            next("0 0 29 2 *", "2025-01-01T00:00:00Z"),
            Some(at("2028-02-29T00:00:00Z"))
        );
    }

    #[test]
    fn impossible_date_never_fires() {
        assert_eq!(next("0 0 30 2 *", "2024-01-01T00:00:00Z"), None);
    }

    #[test]
    fn macros_expand() {
        assert_eq!(
            next("@daily", "2024-09-01T12:00:00Z"),
            Some(at("2024-09-02T00:00:00Z"))
        );
        assert_eq!(
            next("@hourly", "2024-09-01T12:00:00Z"),
            Some(at("2024-09-01T13:00:00Z"))
        );
        assert!(CronExpression::parse("@sometimes").is_err());
    }

    #[test]
    fn start_with_step_form() {
        assert_eq!(
            next("5/20 * * * *", "2024-09-01T12:06:00Z"),
            Some(at("2024-09-01T12:25:00Z"))
        );
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for expr in [
            "",
            "* * *",
            "61 * * * *",
            "*/0 * * * *",
            "5-1 * * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "1,,2 * * * *",
            "a * * * *",
        ] {
            let err = CronExpression::parse(expr).unwrap_err();
            assert_eq!(err.code(), "CONFIGURATION_ERROR", "{expr}");
        }
    }

    #[test]
    fn next_is_deterministic_and_strictly_later() {
        let exprs = [
            "* * * * *",
            "*/7 * * * * *",
            "0 0 1 * *",
            "15 3 * * MON,WED",
            "0 0 13 * FRI",
            "@weekly",
        ];
        let instants = [
            "2023-12-31T23:59:59Z",
            "2024-02-28T23:59:59.999Z",
            "2024-06-15T08:30:00Z",
            "2025-03-01T00:00:00Z",
        ];
        for expr in exprs {
            let cron = CronExpression::parse(expr).unwrap();
            for s in instants {
                let from = at(s);
                let a = cron.next_after(from).unwrap();
                let b = cron.next_after(from).unwrap();
                assert_eq!(a, b, "{expr} from {s}");
                assert!(a > from, "{expr} from {s}");
            }
        }
    }
}
