//! 5-field cron expressions evaluated in an IANA timezone.
//!
//! Supported syntax per field: `*`, values, ranges (`a-b`), steps
//! (`*/n`, `a-b/n`), comma lists, plus month and weekday name aliases.
//! Day-of-month and day-of-week combine with the traditional OR when
//! both are restricted.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::ServerError;

/// Minute-scan bound for the next occurrence (two years).
const MAX_SEARCH_MINUTES: i64 = 60 * 24 * 366 * 2;

#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

#[derive(Debug, Clone)]
struct CronField {
    any: bool,
    values: BTreeSet<u32>,
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        self.any || self.values.contains(&value)
    }
}

impl CronExpression {
    pub fn parse(raw: &str) -> Result<Self, ServerError> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ServerError::BadRequest(
                "cron expression must use 5 fields: minute hour day_of_month month day_of_week"
                    .to_string(),
            ));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, AliasKind::None)?,
            hour: parse_field(fields[1], 0, 23, AliasKind::None)?,
            day_of_month: parse_field(fields[2], 1, 31, AliasKind::None)?,
            month: parse_field(fields[3], 1, 12, AliasKind::Month)?,
            day_of_week: parse_field(fields[4], 0, 7, AliasKind::Weekday)?,
        })
    }

    fn matches(&self, at: DateTime<Utc>, tz: &Tz) -> bool {
        let local = at.with_timezone(tz);
        if !self.minute.matches(local.minute())
            || !self.hour.matches(local.hour())
            || !self.month.matches(local.month())
        {
            return false;
        }

        let dom = self.day_of_month.matches(local.day());
        let dow = self.day_of_week.matches(local.weekday().num_days_from_sunday());
        if self.day_of_month.any || self.day_of_week.any {
            dom && dow
        } else {
            dom || dow
        }
    }
}

/// Next occurrence strictly after `after`, minute-aligned, searched over a
/// bounded window.
pub fn next_occurrence(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ServerError> {
    let tz: Tz = timezone.parse().map_err(|_| {
        ServerError::BadRequest(format!(
            "invalid timezone '{}': expected an IANA timezone id",
            timezone
        ))
    })?;
    let cron = CronExpression::parse(expression)?;

    let aligned = Utc
        .timestamp_opt((after.timestamp() / 60 + 1) * 60, 0)
        .single()
        .ok_or_else(|| ServerError::Internal("timestamp out of range".into()))?;
    let mut candidate = aligned;
    for _ in 0..MAX_SEARCH_MINUTES {
        if cron.matches(candidate, &tz) {
            return Ok(candidate);
        }
        candidate += Duration::minutes(1);
    }
    Err(ServerError::BadRequest(format!(
        "no occurrence of '{}' in '{}' within the search window",
        expression, timezone
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AliasKind {
    None,
    Month,
    Weekday,
}

fn parse_field(raw: &str, min: u32, max: u32, aliases: AliasKind) -> Result<CronField, ServerError> {
    if raw == "*" {
        return Ok(CronField {
            any: true,
            values: BTreeSet::new(),
        });
    }
    let mut values = BTreeSet::new();
    for segment in raw.split(',') {
        parse_segment(segment, min, max, aliases, &mut values)?;
    }
    if values.is_empty() {
        return Err(ServerError::BadRequest(format!("invalid cron field '{}'", raw)));
    }
    Ok(CronField { any: false, values })
}

fn parse_segment(
    raw: &str,
    min: u32,
    max: u32,
    aliases: AliasKind,
    values: &mut BTreeSet<u32>,
) -> Result<(), ServerError> {
    let (range_raw, step) = match raw.split_once('/') {
        Some((range, step_raw)) => {
            let step = step_raw
                .parse::<u32>()
                .map_err(|_| ServerError::BadRequest(format!("invalid cron step '{}'", step_raw)))?;
            if step == 0 {
                return Err(ServerError::BadRequest("cron step must be >= 1".to_string()));
            }
            (range, step)
        }
        None => (raw, 1),
    };

    let (start, end) = if range_raw == "*" {
        (min, max)
    } else if let Some((start_raw, end_raw)) = range_raw.split_once('-') {
        (
            parse_atom(start_raw, min, max, aliases)?,
            parse_atom(end_raw, min, max, aliases)?,
        )
    } else {
        let value = parse_atom(range_raw, min, max, aliases)?;
        (value, value)
    };
    if start > end {
        return Err(ServerError::BadRequest(format!("invalid cron range '{}'", raw)));
    }

    let mut value = start;
    while value <= end {
        // Both 0 and 7 mean Sunday.
        let normalized = if aliases == AliasKind::Weekday && value == 7 {
            0
        } else {
            value
        };
        values.insert(normalized);
        match value.checked_add(step) {
            Some(next) => value = next,
            None => break,
        }
    }
    Ok(())
}

fn parse_atom(raw: &str, min: u32, max: u32, aliases: AliasKind) -> Result<u32, ServerError> {
    let lower = raw.to_ascii_lowercase();
    let named = match aliases {
        AliasKind::None => None,
        AliasKind::Month => match lower.as_str() {
            "jan" => Some(1),
            "feb" => Some(2),
            "mar" => Some(3),
            "apr" => Some(4),
            "may" => Some(5),
            "jun" => Some(6),
            "jul" => Some(7),
            "aug" => Some(8),
            "sep" => Some(9),
            "oct" => Some(10),
            "nov" => Some(11),
            "dec" => Some(12),
            _ => None,
        },
        AliasKind::Weekday => match lower.as_str() {
            "sun" => Some(0),
            "mon" => Some(1),
            "tue" => Some(2),
            "wed" => Some(3),
            "thu" => Some(4),
            "fri" => Some(5),
            "sat" => Some(6),
            _ => None,
        },
    };
    let value = match named {
        Some(v) => v,
        None => lower
            .parse::<u32>()
            .map_err(|_| ServerError::BadRequest(format!("invalid cron value '{}'", raw)))?,
    };
    if value < min || value > max {
        return Err(ServerError::BadRequest(format!(
            "cron value '{}' is out of bounds ({}..={})",
            raw, min, max
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_every_minute() {
        let next = next_occurrence("* * * * *", "UTC", utc("2026-03-10T09:15:30Z")).unwrap();
        assert_eq!(next, utc("2026-03-10T09:16:00Z"));
    }

    #[test]
    fn test_daily_at_hour() {
        let next = next_occurrence("0 2 * * *", "UTC", utc("2026-03-10T09:15:00Z")).unwrap();
        assert_eq!(next, utc("2026-03-11T02:00:00Z"));
    }

    #[test]
    fn test_weekday_mornings_in_timezone() {
        // 09:00 Berlin is 08:00 UTC during CET (winter).
        let next =
            next_occurrence("0 9 * * 1-5", "Europe/Berlin", utc("2026-01-09T15:00:00Z")).unwrap();
        // Friday afternoon rolls to Monday morning.
        assert_eq!(next, utc("2026-01-12T08:00:00Z"));
    }

    #[test]
    fn test_step_and_list_fields() {
        let next = next_occurrence("*/15 * * * *", "UTC", utc("2026-03-10T09:16:00Z")).unwrap();
        assert_eq!(next, utc("2026-03-10T09:30:00Z"));

        let next = next_occurrence("30 8,18 * * *", "UTC", utc("2026-03-10T09:00:00Z")).unwrap();
        assert_eq!(next, utc("2026-03-10T18:30:00Z"));
    }

    #[test]
    fn test_weekday_alias_and_seven_is_sunday() {
        let a = next_occurrence("0 12 * * sun", "UTC", utc("2026-03-10T00:00:00Z")).unwrap();
        let b = next_occurrence("0 12 * * 7", "UTC", utc("2026-03-10T00:00:00Z")).unwrap();
        assert_eq!(a, b);
        // 2026-03-15 is a Sunday.
        assert_eq!(a, utc("2026-03-15T12:00:00Z"));
    }

    #[test]
    fn test_invalid_expressions_rejected() {
        assert!(next_occurrence("* * * *", "UTC", Utc::now()).is_err());
        assert!(next_occurrence("61 * * * *", "UTC", Utc::now()).is_err());
        assert!(next_occurrence("*/0 * * * *", "UTC", Utc::now()).is_err());
        assert!(next_occurrence("* * * * *", "Mars/Olympus", Utc::now()).is_err());
    }
}
