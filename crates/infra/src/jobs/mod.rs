//! Persisted job queues.
//!
//! ## Components
//!
//! - `JobStore` / `DeadLetterStore`: persistence (Postgres or in-memory)
//! - `JobQueue`: enqueue, lease, record outcomes, reclaim stale locks, sweep
//! - `QueueWorker`: polls one queue and runs leased jobs through handlers
//! - `DeadLetterQueue`: inspect, retry or ignore jobs that ran out of retries
//! - `JobRuntime`: every queue of a process behind one admin surface

pub mod dead_letter;
pub mod in_memory;
pub mod postgres;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod worker;

pub use dead_letter::{DeadLetterQueue, DeadLetterRetry};
pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use queue::{JobQueue, QueueError, Recorded};
pub use registry::{DynJobHandler, HandlerOutcome, HandlerRegistry, JobContext, JobHandler};
pub use runtime::{JobRuntime, JobRuntimeBuilder, RuntimeHandle};
pub use store::{DeadLetterFilter, DeadLetterStore, JobFilter, JobStore, JobStoreError};
pub use worker::{QueueWorker, TickReport, WorkerHandle, WorkerStats};
