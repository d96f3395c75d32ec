//! Infrastructure layer: job stores, queue workers, notifications, config.

pub mod config;
pub mod jobs;
pub mod notify;

pub use config::{ConfigError, EngineConfig, QueueOptions};
pub use jobs::{
    DeadLetterQueue, HandlerOutcome, HandlerRegistry, InMemoryJobStore, JobContext, JobHandler,
    JobQueue, JobRuntime, PostgresJobStore, QueueError, QueueWorker,
};
pub use notify::{BusNotifier, JobNotifier, NoopNotifier, NotifierConfigError};
