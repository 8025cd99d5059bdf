//! Date, timezone and back-off arithmetic.
//!
//! Everything here is pure: callers pass `now` explicitly, and the only
//! source of randomness (retry jitter) has a deterministic twin for tests.

use std::time::Duration;

use chrono::{DateTime, Datelike, LocalResult, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Local hour at which occasions are delivered.
pub const TARGET_HOUR: u32 = 9;

/// Oldest accepted birth date, in years before today.
pub const MAX_AGE_YEARS: u32 = 150;

/// Next instant strictly after `now` at which `birth_date`'s month/day falls
/// at 09:00 local time in `tz`.
///
/// Feb 29 is observed on Feb 28 in non-leap years. Ambiguous local times
/// (clocks rolled back) resolve to the earlier instant.
pub fn next_occurrence_utc(
    birth_date: NaiveDate,
    tz: Tz,
    now: DateTime<Utc>,
) -> DomainResult<DateTime<Utc>> {
    let year = now.with_timezone(&tz).year();

    let this_year = local_target(birth_date, year, tz)?;
    if this_year > now {
        return Ok(this_year);
    }

    local_target(birth_date, year + 1, tz)
}

/// Month/day of `birth_date` observed in `year`.
pub fn occurrence_date(birth_date: NaiveDate, year: i32) -> DomainResult<NaiveDate> {
    let (month, mut day) = (birth_date.month(), birth_date.day());
    if month == 2 && day == 29 && !is_leap_year(year) {
        day = 28;
    }

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| DomainError::invalid_schedule(format!("{year}-{month:02}-{day:02} does not exist")))
}

pub fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

fn local_target(birth_date: NaiveDate, year: i32, tz: Tz) -> DomainResult<DateTime<Utc>> {
    let date = occurrence_date(birth_date, year)?;
    let local = date
        .and_hms_opt(TARGET_HOUR, 0, 0)
        .ok_or_else(|| DomainError::invalid_schedule(format!("{date} {TARGET_HOUR}:00 is not a time")))?;

    resolve_local(local, tz)
}

/// UTC instant of a wall-clock time in `tz`.
///
/// A time that occurs twice (clocks rolled back) maps to the earlier
/// instant; a time skipped by a forward jump is an error.
pub(crate) fn resolve_local(local: NaiveDateTime, tz: Tz) -> DomainResult<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(at) => Ok(at.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(DomainError::invalid_schedule(format!(
            "{local} does not exist in {}",
            tz.name()
        ))),
    }
}

/// Parse a birth date given as literal `YYYY-MM-DD`.
///
/// The date must be strictly before `today` and at most 150 years earlier.
pub fn parse_birth_date(value: &str, today: NaiveDate) -> DomainResult<NaiveDate> {
    if !is_iso_date_shape(value) {
        return Err(DomainError::invalid_input(
            "birthDate must be an ISO date string (YYYY-MM-DD)",
        ));
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| DomainError::invalid_input(format!("birthDate {value} is not a calendar date: {e}")))?;

    if date >= today {
        return Err(DomainError::invalid_input("birthDate must be in the past"));
    }

    let oldest = today
        .checked_sub_months(Months::new(MAX_AGE_YEARS * 12))
        .unwrap_or(NaiveDate::MIN);
    if date < oldest {
        return Err(DomainError::invalid_input(format!(
            "birthDate must be within the last {MAX_AGE_YEARS} years"
        )));
    }

    Ok(date)
}

fn is_iso_date_shape(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// True for `+07:00` / `-03:30` style offsets, which are never accepted as zones.
fn is_offset_literal(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 6
        && matches!(bytes[0], b'+' | b'-')
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && bytes[3] == b':'
        && bytes[4].is_ascii_digit()
        && bytes[5].is_ascii_digit()
}

/// Resolve an IANA zone name.
pub fn parse_time_zone(value: &str) -> DomainResult<Tz> {
    if is_offset_literal(value) {
        return Err(DomainError::invalid_input(format!(
            "timezone offsets like \"{value}\" are not IANA timezones; use a named zone such as \"Asia/Bangkok\""
        )));
    }

    value.parse::<Tz>().map_err(|_| {
        DomainError::invalid_input(format!(
            "timezone \"{value}\" is not an IANA timezone identifier (e.g. \"America/New_York\")"
        ))
    })
}

pub fn is_valid_time_zone(value: &str) -> bool {
    parse_time_zone(value).is_ok()
}

/// Exponential back-off with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry (`attempts_so_far == 0`).
    pub base_delay: Duration,
    /// Cap applied to the exponential part, before jitter.
    pub max_delay: Duration,
    /// Upper bound of the jitter as a fraction of the capped delay.
    pub jitter: f64,
    /// Attempt count at which a transiently failing job becomes terminal.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60 * 60),
            jitter: 0.3,
            max_attempts: 20,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// `base_delay * 2^attempts_so_far`, capped at `max_delay`.
    pub fn capped_delay(&self, attempts_so_far: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempts_so_far)
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay with a caller-chosen jitter sample in `[0, 1)`.
    pub fn delay_with_jitter(&self, attempts_so_far: u32, sample: f64) -> Duration {
        let capped = self.capped_delay(attempts_so_far);
        capped + capped.mul_f64(self.jitter * sample.clamp(0.0, 1.0))
    }

    /// Delay with a random jitter sample.
    pub fn next_delay(&self, attempts_so_far: u32) -> Duration {
        let sample: f64 = rand::thread_rng().r#gen();
        self.delay_with_jitter(attempts_so_far, sample)
    }

    /// Largest delay this policy can ever produce.
    pub fn max_jittered_delay(&self) -> Duration {
        self.max_delay + self.max_delay.mul_f64(self.jitter)
    }

    /// Whether a job that has now made `attempts` attempts may be tried again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Back-off before the next attempt after `attempts_so_far` failures, default policy.
pub fn next_retry_delay(attempts_so_far: u32) -> Duration {
    RetryPolicy::default().next_delay(attempts_so_far)
}

/// Default-policy delay with a caller-chosen jitter sample in `[0, 1)`.
pub fn next_retry_delay_with(attempts_so_far: u32, jitter_sample: f64) -> Duration {
    RetryPolicy::default().delay_with_jitter(attempts_so_far, jitter_sample)
}

/// `now + next_retry_delay(attempts_so_far)`.
pub fn next_attempt_at(attempts_so_far: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    retry_at(now, next_retry_delay(attempts_so_far))
}

/// `now + delay`, the instant before which a retrying job must not be reclaimed.
pub fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_default()
}
