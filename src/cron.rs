//! Hand-rolled 5-field cron evaluator.
//!
//! Kept independent of any third-party cron crate on purpose: the exact
//! validation error text and the day-of-month/day-of-week union rule are
//! part of this crate's observable contract, not an implementation detail
//! a generic crate happens to get right.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::error::{BackupError, Result};

const MAX_SEARCH_MINUTES: i64 = 60 * 24 * 366;

#[derive(Debug, Clone)]
struct Field {
    any: bool,
    values: BTreeSet<u32>,
}

#[derive(Debug, Clone)]
struct ParsedCron {
    minute: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

/// Computes the next whole-minute instant strictly after `after` that
/// satisfies `expression`. Errors if the expression is invalid or if no
/// matching minute exists within a one year search window.
pub fn next_run_at(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let parsed = parse(expression)?;

    let mut cursor = after
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .ok_or_else(|| BackupError::input("invalid instant"))?
        + Duration::minutes(1);

    for _ in 0..MAX_SEARCH_MINUTES {
        // cron day-of-week: Sunday = 0 .. Saturday = 6.
        let cron_dow = (cursor.weekday().num_days_from_sunday()) % 7;

        if !parsed.month.values.contains(&cursor.month()) {
            cursor += Duration::minutes(1);
            continue;
        }
        if !parsed.hour.values.contains(&cursor.hour()) {
            cursor += Duration::minutes(1);
            continue;
        }
        if !parsed.minute.values.contains(&cursor.minute()) {
            cursor += Duration::minutes(1);
            continue;
        }
        if !day_matches(&parsed, cursor.day(), cron_dow) {
            cursor += Duration::minutes(1);
            continue;
        }
        return Ok(cursor);
    }

    Err(BackupError::input(format!(
        "Could not compute next run for cron expression: {expression}"
    )))
}

/// Validates an expression without computing a next run. Used by
/// `create-schedule` to fail fast on a typo'd cron string.
pub fn validate(expression: &str) -> Result<()> {
    parse(expression).map(|_| ())
}

fn day_matches(parsed: &ParsedCron, day: u32, cron_dow: u32) -> bool {
    let dom_match = parsed.dom.values.contains(&day);
    let dow_match = parsed.dow.values.contains(&cron_dow);

    match (parsed.dom.any, parsed.dow.any) {
        (true, true) => true,
        (true, false) => dow_match,
        (false, true) => dom_match,
        (false, false) => dom_match || dow_match,
    }
}

fn parse(expression: &str) -> Result<ParsedCron> {
    let normalized = resolve_alias(expression.trim());

    let parts: Vec<&str> = normalized.split_whitespace().collect();
    if parts.len() != 5 {
        return Err(BackupError::input("Cron expression must contain 5 fields."));
    }

    let minute = parse_field(parts[0], 0, 59, "minute")?;
    let hour = parse_field(parts[1], 0, 23, "hour")?;
    let dom = parse_field(parts[2], 1, 31, "day_of_month")?;
    let month = parse_field(parts[3], 1, 12, "month")?;
    let mut dow = parse_field(parts[4], 0, 7, "day_of_week")?;

    if dow.values.remove(&7) {
        dow.values.insert(0);
    }

    Ok(ParsedCron {
        minute,
        hour,
        dom,
        month,
        dow,
    })
}

fn resolve_alias(expression: &str) -> &str {
    match expression {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other => other,
    }
}

fn parse_field(field: &str, minimum: u32, maximum: u32, name: &str) -> Result<Field> {
    let field = field.trim();
    if field.is_empty() {
        return Err(BackupError::input(format!("Empty cron field: {name}")));
    }

    if field == "*" {
        return Ok(Field {
            any: true,
            values: (minimum..=maximum).collect(),
        });
    }

    let mut values = BTreeSet::new();

    for chunk in field.split(',') {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            return Err(BackupError::input(format!(
                "Invalid empty value in cron field: {name}"
            )));
        }

        let (base, step) = match chunk.split_once('/') {
            Some((base, step_text)) => {
                let step: i64 = step_text
                    .parse()
                    .map_err(|_| BackupError::input(format!("Invalid step '{step_text}' in cron field: {name}")))?;
                if step <= 0 {
                    return Err(BackupError::input(format!("Step must be > 0 in cron field: {name}")));
                }
                (base, step as u32)
            }
            None => (chunk, 1),
        };

        let (start, end) = if base == "*" {
            (minimum, maximum)
        } else if let Some((start_text, end_text)) = base.split_once('-') {
            let start = parse_int(start_text, name)?;
            let end = parse_int(end_text, name)?;
            if start > end {
                return Err(BackupError::input(format!("Invalid range '{base}' in cron field: {name}")));
            }
            (start, end)
        } else {
            let value = parse_int(base, name)?;
            (value, value)
        };

        if start < minimum || end > maximum {
            return Err(BackupError::input(format!(
                "Value out of range in cron field {name}: {chunk}"
            )));
        }

        let mut value = start;
        while value <= end {
            values.insert(value);
            value += step;
        }
    }

    if values.is_empty() {
        return Err(BackupError::input(format!("No values parsed for cron field: {name}")));
    }

    Ok(Field { any: false, values })
}

fn parse_int(value: &str, name: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| BackupError::input(format!("Invalid integer '{value}' in cron field: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn hourly_rounds_up_to_next_hour() {
        let after = at(2026, 2, 17, 10, 59, 30);
        let next = next_run_at("@hourly", after).unwrap();
        assert_eq!(next, at(2026, 2, 17, 11, 0, 0));
    }

    #[test]
    fn step_five_minutes() {
        let after = at(2026, 1, 1, 10, 2, 15);
        let next = next_run_at("*/5 * * * *", after).unwrap();
        assert_eq!(next, at(2026, 1, 1, 10, 5, 0));
    }

    #[test]
    fn dow_seven_equals_zero() {
        // Sunday 2026-01-04. "0 0 * * 7" should match Sundays, same as "0 0 * * 0".
        let after = at(2026, 1, 1, 0, 0, 0);
        let next = next_run_at("0 0 * * 7", after).unwrap();
        assert_eq!(next.weekday().num_days_from_sunday(), 0);
    }

    #[test]
    fn dom_dow_union_when_both_explicit() {
        // Matches the 15th OR any Monday -- union, not intersection.
        let after = at(2026, 3, 1, 0, 0, 0);
        let next = next_run_at("0 0 15 * 1", after).unwrap();
        assert!(next.day() == 15 || next.weekday().num_days_from_sunday() == 1);
    }

    #[test]
    fn wrong_field_count() {
        let err = next_run_at("bad cron", Utc::now()).unwrap_err();
        assert!(err.to_string().contains("must contain 5 fields"));
    }

    #[test]
    fn zero_step_rejected() {
        let err = next_run_at("*/0 * * * *", Utc::now()).unwrap_err();
        assert!(err.to_string().contains("Step must be > 0"));
    }

    #[test]
    fn out_of_range_rejected() {
        let err = next_run_at("60 * * * *", Utc::now()).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn reversed_range_rejected() {
        let err = next_run_at("10-5 * * * *", Utc::now()).unwrap_err();
        assert!(err.to_string().contains("Invalid range"));
    }

    #[test]
    fn result_is_strictly_after_and_matches_again() {
        let after = at(2026, 5, 10, 6, 13, 42);
        let expr = "*/15 8-18 * * 1-5";
        let next = next_run_at(expr, after).unwrap();
        assert!(next > after);

        // Idempotence at the boundary: asking again from one second before
        // the computed instant returns the same instant.
        let boundary = next - Duration::seconds(1);
        let next2 = next_run_at(expr, boundary).unwrap();
        assert_eq!(next, next2);
    }

    #[test]
    fn unsatisfiable_expression_errors() {
        // Feb 30th never exists.
        let err = next_run_at("0 0 30 2 *", at(2026, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("Could not compute next run"));
    }
}
