//! Cron expression parsing and next-fire computation.
//!
//! Accepts 5-field (min hour dom mon dow) and 6-field (with seconds)
//! expressions, the common `@hourly`-style descriptors, and
//! `@every <duration>` fixed intervals. Evaluation happens in an IANA
//! timezone; an unparseable zone falls back to UTC.

use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use dashmap::DashMap;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

const CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
    #[error("cron expression '{expression}' never fires")]
    NeverFires { expression: String },
}

#[derive(Debug, Clone)]
enum Normalized {
    /// A 6/7-field expression the `cron` crate can parse.
    Cron(String),
    /// Fixed interval from the reference instant.
    Every(Duration),
}

fn invalid(expression: &str, reason: impl Into<String>) -> CronError {
    CronError::InvalidExpression {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn normalize(expression: &str) -> Result<Normalized, CronError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(invalid(expression, "empty expression"));
    }

    if let Some(rest) = trimmed.strip_prefix("@every") {
        let raw = rest.trim();
        if raw.is_empty() {
            return Err(invalid(expression, "@every requires a duration"));
        }
        let duration = parse_duration(raw).ok_or_else(|| {
            invalid(expression, format!("unparseable duration '{raw}'"))
        })?;
        if duration.is_zero() {
            return Err(invalid(expression, "@every duration must be positive"));
        }
        return Ok(Normalized::Every(duration));
    }

    if trimmed.starts_with('@') {
        let mapped = match trimmed.to_ascii_lowercase().as_str() {
            "@hourly" => "0 0 * * * *",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@weekly" => "0 0 0 * * Sun",
            "@monthly" => "0 0 0 1 * *",
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            other => return Err(invalid(expression, format!("unknown descriptor '{other}'"))),
        };
        return Ok(Normalized::Cron(mapped.to_string()));
    }

    match trimmed.split_whitespace().count() {
        // Standard 5-field form gets an explicit seconds column.
        5 => Ok(Normalized::Cron(format!("0 {trimmed}"))),
        6 | 7 => Ok(Normalized::Cron(trimmed.to_string())),
        n => Err(invalid(expression, format!("expected 5 or 6 fields, got {n}"))),
    }
}

/// Parses durations of the form `90s`, `10m`, `1h30m`, `2d`.
fn parse_duration(raw: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut matched = false;

    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return None;
        }
        let amount: u64 = digits.parse().ok()?;
        digits.clear();
        let unit_secs = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return None,
        };
        total = total.checked_add(Duration::from_secs(amount.checked_mul(unit_secs)?))?;
        matched = true;
    }

    if !digits.is_empty() {
        // A bare trailing number counts as seconds.
        let amount: u64 = digits.parse().ok()?;
        total = total.checked_add(Duration::from_secs(amount))?;
        matched = true;
    }

    matched.then_some(total)
}

struct CachedSchedule {
    schedule: CronSchedule,
    inserted: Instant,
}

/// Computes next fire times, holding a short-lived parse cache keyed by
/// `(schedule id, expression)`.
#[derive(Default)]
pub struct CronCalculator {
    cache: DashMap<(Uuid, String), CachedSchedule>,
}

impl CronCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validation used at CRUD time; never consults the cache.
    pub fn validate(expression: &str) -> Result<(), CronError> {
        match normalize(expression)? {
            Normalized::Every(_) => Ok(()),
            Normalized::Cron(normalized) => CronSchedule::from_str(&normalized)
                .map(|_| ())
                .map_err(|e| invalid(expression, e.to_string())),
        }
    }

    /// The next moment strictly after `now()` in `timezone`.
    pub fn next_run(
        &self,
        expression: &str,
        timezone: &str,
    ) -> Result<DateTime<Utc>, CronError> {
        self.next_run_after(expression, timezone, Utc::now())
    }

    /// Cached variant for the hot poller path.
    pub fn next_run_for(
        &self,
        schedule_id: Uuid,
        expression: &str,
        timezone: &str,
    ) -> Result<DateTime<Utc>, CronError> {
        let after = Utc::now();
        match normalize(expression)? {
            Normalized::Every(interval) => Ok(after
                + ChronoDuration::from_std(interval)
                    .unwrap_or_else(|_| ChronoDuration::seconds(1))),
            Normalized::Cron(normalized) => {
                let key = (schedule_id, expression.to_string());
                if let Some(entry) = self.cache.get(&key) {
                    if entry.inserted.elapsed() < CACHE_TTL {
                        return next_in_zone(&entry.schedule, expression, timezone, after);
                    }
                }
                let schedule = CronSchedule::from_str(&normalized)
                    .map_err(|e| invalid(expression, e.to_string()))?;
                let next = next_in_zone(&schedule, expression, timezone, after);
                if self.cache.len() >= CACHE_PRUNE_THRESHOLD {
                    self.cache
                        .retain(|_, entry| entry.inserted.elapsed() < CACHE_TTL);
                }
                self.cache.insert(
                    key,
                    CachedSchedule {
                        schedule,
                        inserted: Instant::now(),
                    },
                );
                next
            }
        }
    }

    /// Drops cached parses for a schedule after its CRUD update.
    pub fn invalidate(&self, schedule_id: Uuid) {
        self.cache.retain(|(id, _), _| *id != schedule_id);
    }

    pub fn next_run_after(
        &self,
        expression: &str,
        timezone: &str,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CronError> {
        match normalize(expression)? {
            Normalized::Every(interval) => Ok(after
                + ChronoDuration::from_std(interval)
                    .unwrap_or_else(|_| ChronoDuration::seconds(1))),
            Normalized::Cron(normalized) => {
                let schedule = CronSchedule::from_str(&normalized)
                    .map_err(|e| invalid(expression, e.to_string()))?;
                next_in_zone(&schedule, expression, timezone, after)
            }
        }
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

fn resolve_timezone(timezone: &str) -> Tz {
    if timezone.trim().is_empty() {
        return chrono_tz::UTC;
    }
    match timezone.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(%timezone, "unknown timezone, falling back to UTC");
            chrono_tz::UTC
        }
    }
}

fn next_in_zone(
    schedule: &CronSchedule,
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let tz = resolve_timezone(timezone);
    let local_after = tz.from_utc_datetime(&after.naive_utc());
    schedule
        .after(&local_after)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| CronError::NeverFires {
            expression: expression.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid test timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn validate_accepts_standard_forms() {
        assert!(CronCalculator::validate("*/1 * * * *").is_ok());
        assert!(CronCalculator::validate("0 0 9 * * Mon").is_ok());
        assert!(CronCalculator::validate("@hourly").is_ok());
        assert!(CronCalculator::validate("@every 1h30m").is_ok());
    }

    #[test]
    fn validate_rejects_malformed_expressions() {
        assert!(CronCalculator::validate("").is_err());
        assert!(CronCalculator::validate("not a cron").is_err());
        assert!(CronCalculator::validate("* * *").is_err());
        assert!(CronCalculator::validate("@sometimes").is_err());
        assert!(CronCalculator::validate("@every banana").is_err());
    }

    #[test]
    fn five_field_expression_lands_on_minute_boundary() {
        let calc = CronCalculator::new();
        let next = calc
            .next_run_after("*/1 * * * *", "UTC", at("2024-03-01T10:15:30Z"))
            .expect("next fire");
        assert_eq!(next, at("2024-03-01T10:16:00Z"));
    }

    #[test]
    fn six_field_expression_honors_seconds() {
        let calc = CronCalculator::new();
        let next = calc
            .next_run_after("30 * * * * *", "UTC", at("2024-03-01T10:15:10Z"))
            .expect("next fire");
        assert_eq!(next, at("2024-03-01T10:15:30Z"));
    }

    #[test]
    fn next_is_strictly_in_the_future_and_monotone() {
        let calc = CronCalculator::new();
        let after = at("2024-03-01T10:15:00Z");
        let first = calc
            .next_run_after("*/5 * * * *", "UTC", after)
            .expect("first");
        let second = calc
            .next_run_after("*/5 * * * *", "UTC", first)
            .expect("second");
        assert!(first > after);
        assert!(second > first);
    }

    #[test]
    fn timezone_shifts_the_fire_instant() {
        let calc = CronCalculator::new();
        // 09:00 in New York during DST is 13:00 UTC.
        let next = calc
            .next_run_after("0 9 * * *", "America/New_York", at("2024-06-01T00:00:00Z"))
            .expect("next fire");
        assert_eq!(next, at("2024-06-01T13:00:00Z"));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let calc = CronCalculator::new();
        let after = at("2024-06-01T00:00:00Z");
        let bogus = calc
            .next_run_after("0 9 * * *", "Mars/Olympus_Mons", after)
            .expect("next fire");
        let utc = calc.next_run_after("0 9 * * *", "UTC", after).expect("next");
        assert_eq!(bogus, utc);
    }

    #[test]
    fn every_descriptor_is_a_fixed_interval() {
        let calc = CronCalculator::new();
        let after = at("2024-03-01T10:00:00Z");
        let next = calc
            .next_run_after("@every 90s", "UTC", after)
            .expect("next fire");
        assert_eq!(next, at("2024-03-01T10:01:30Z"));
    }

    #[test]
    fn descriptors_expand_to_cron_fields() {
        let calc = CronCalculator::new();
        let next = calc
            .next_run_after("@daily", "UTC", at("2024-03-01T10:00:00Z"))
            .expect("next fire");
        assert_eq!(next, at("2024-03-02T00:00:00Z"));
    }

    #[test]
    fn cached_entries_are_invalidated_per_schedule() {
        let calc = CronCalculator::new();
        let id = Uuid::new_v4();
        calc.next_run_for(id, "*/1 * * * *", "UTC").expect("next");
        assert_eq!(calc.cached_len(), 1);
        calc.invalidate(id);
        assert_eq!(calc.cached_len(), 0);
    }

    #[test]
    fn duration_parser_handles_compound_forms() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("10x"), None);
    }
}
