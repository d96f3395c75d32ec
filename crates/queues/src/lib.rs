//! The host's queue domains.
//!
//! This crate names the six queues the host runs (calendar, Slack, GitHub,
//! Notion, AI jobs, summaries), the typed payload each job type carries, and
//! how each payload derives its dedup key. Handlers live with the host; this
//! crate only wires queues and types.

pub mod kind;
pub mod payload;
pub mod runtime;

pub use kind::QueueKind;
pub use payload::{
    FetchEvents, GenerateSummary, PayloadError, QueuePayload, QueuedJob, RunAiJob, SummaryScope,
    SyncGithubRepository, SyncNotionPage, SyncSlackChannel,
};
pub use runtime::{register_handler, standard_runtime};
