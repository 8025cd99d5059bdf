//! Durable message jobs.
//!
//! ## Lifecycle
//!
//! ```text
//! PENDING ──claim──▶ SENDING ──sent──▶ SENT
//!    ▲                  │
//!    │                  ├──transient──▶ RETRY ──claim──▶ SENDING …
//!    │                  └──permanent / ceiling──▶ FAILED
//!    └── follow-up inserted with SENT
//! ```
//!
//! ## Components
//!
//! - `JobStore`: claim and atomic change sets (in-memory or Postgres)
//! - `JobService`: schedule, reschedule, cancel and settle jobs
//! - `JobChangeSet`: one unit of work, also usable inside a caller's transaction

mod in_memory;
mod postgres;
mod service;
mod store;

pub use in_memory::InMemoryJobStore;
pub use postgres::{PostgresJobStore, SCHEMA};
pub use service::{JobService, JobServiceError, RetryDecision};
pub use store::{JobChange, JobChangeSet, JobStats, JobStore, JobStoreError};
