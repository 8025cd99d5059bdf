//! `cakeday-core`: scheduling domain for recurring greetings.
//!
//! This crate contains **pure domain** code (no I/O): identifiers, the user
//! and job records, the occasion contract and the date/timezone arithmetic.

pub mod error;
pub mod id;
pub mod job;
pub mod schedule;
pub mod user;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, UserId};
pub use job::{Birthday, ClaimedJob, JobKind, JobStatus, MessageJob, Occasion};
pub use user::User;
