//! `taskforge-core`: job queue domain building blocks.
//!
//! This crate contains the **pure** job lifecycle: identifiers, the job state
//! machine, retry/backoff policy and dead-letter entries. Every state change
//! takes the current time explicitly; nothing here performs IO.

pub mod dead_letter;
pub mod error;
pub mod id;
pub mod job;
pub mod queue;
pub mod retry;
pub mod stats;

pub use dead_letter::{DeadLetterEntry, DeadLetterStatus, JobSnapshot};
pub use error::{DomainError, DomainResult};
pub use id::{DeadLetterId, JobId};
pub use job::{DedupKey, FailureOutcome, Job, JobStatus, NewJob};
pub use queue::QueueName;
pub use retry::{BackoffStrategy, DEFAULT_MAX_RETRIES, RetryPolicy};
pub use stats::{DeadLetterStats, JobStats};
