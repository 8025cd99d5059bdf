//! The user record, as far as scheduling is concerned.
//!
//! Users are owned by the profile service; this crate only reads the fields
//! that drive scheduling and message rendering.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::DomainResult;
use crate::id::UserId;
use crate::schedule;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Calendar date without a zone; only month and day drive scheduling.
    pub birth_date: NaiveDate,
    /// IANA zone name, e.g. `Asia/Jakarta`.
    pub timezone: String,
}

impl User {
    /// Build a user from raw profile input, validating the scheduling fields.
    ///
    /// `today` bounds the birth date (strictly past, at most 150 years back).
    pub fn new(
        id: UserId,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
        birth_date: &str,
        timezone: &str,
        today: NaiveDate,
    ) -> DomainResult<Self> {
        let birth_date = schedule::parse_birth_date(birth_date, today)?;
        schedule::parse_time_zone(timezone)?;
        Ok(Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
            birth_date,
            timezone: timezone.to_string(),
        })
    }

    /// The user's zone, failing with `InvalidInput` if the stored name is not IANA.
    pub fn tz(&self) -> DomainResult<Tz> {
        schedule::parse_time_zone(&self.timezone)
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Next 09:00-local birthday strictly after `now`.
    pub fn next_birthday_utc(&self, now: DateTime<Utc>) -> DomainResult<DateTime<Utc>> {
        let tz = self.tz()?;
        schedule::next_occurrence_utc(self.birth_date, tz, now)
    }

    /// True if the fields that feed the schedule differ, so open jobs must be rebuilt.
    pub fn schedule_changed(&self, other: &User) -> bool {
        self.birth_date != other.birth_date || self.timezone != other.timezone
    }
}
