//! Job storage abstraction.
//!
//! One store instance serves every queue; each queue is its own table (or its
//! own partition of the in-memory state). All coordination between workers is
//! expressed as conditional writes keyed on a row's current status, so any
//! number of processes can share a store without extra locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use taskforge_core::{
    DeadLetterEntry, DeadLetterId, DeadLetterStats, DeadLetterStatus, DedupKey, DomainError, Job,
    JobId, JobStats, JobStatus, QueueName,
};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Filter for listing jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.as_deref().is_none_or(|t| job.job_type == t)
    }
}

/// Filter for listing dead-letter entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub queue: Option<QueueName>,
    pub status: Option<DeadLetterStatus>,
    pub limit: usize,
}

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self {
            queue: None,
            status: None,
            limit: 100,
        }
    }
}

impl DeadLetterFilter {
    pub fn for_queue(mut self, queue: QueueName) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_status(mut self, status: DeadLetterStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.queue.as_ref().is_none_or(|q| &entry.original_queue == q)
            && self.status.is_none_or(|s| entry.status == s)
    }
}

/// Persistence for job rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` unless a live row (pending/processing) with the same
    /// `job_type` and dedup key exists. Returns the inserted row, or `None`
    /// when the target is already scheduled.
    ///
    /// The existence check and the insert are not atomic unless the backend
    /// enforces live-dedup uniqueness itself.
    async fn insert_if_absent(&self, queue: &QueueName, job: Job) -> Result<Option<Job>, JobStoreError>;

    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, queue: &QueueName, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self, queue: &QueueName) -> Result<JobStats, JobStoreError>;

    /// Cursor stored on the most recently completed job for this target.
    async fn last_cursor(
        &self,
        queue: &QueueName,
        job_type: &str,
        dedup_key: &DedupKey,
    ) -> Result<Option<JsonValue>, JobStoreError>;

    /// Up to `limit` pending rows with `run_after <= now`, earliest
    /// `run_after` first, insertion order breaking ties.
    async fn select_eligible(
        &self,
        queue: &QueueName,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Conditional lease: `processing` + `locked_at = now`, only if the row is
    /// still pending. `None` means another leaser got there first.
    async fn try_lease(
        &self,
        queue: &QueueName,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Write every mutable column of `job` if the stored status still equals
    /// `expected`. Returns whether the write happened.
    async fn compare_and_set(
        &self,
        queue: &QueueName,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool, JobStoreError>;

    /// Atomically remove a processing row and record it as dead. Returns
    /// `false` (and writes nothing) if the row is no longer processing.
    async fn move_to_dead_letter(
        &self,
        queue: &QueueName,
        id: JobId,
        entry: &DeadLetterEntry,
    ) -> Result<bool, JobStoreError>;

    /// Reset processing rows locked before `cutoff` back to pending.
    async fn reclaim_stale(
        &self,
        queue: &QueueName,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// Delete terminal rows last updated before `cutoff`.
    async fn sweep(&self, queue: &QueueName, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

/// Persistence for dead-letter entries (one table shared by every queue).
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError>;

    /// Entries matching `filter`, most recently failed first.
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// `dead → to`, only if the entry is still dead.
    async fn resolve_dead_letter(
        &self,
        id: DeadLetterId,
        to: DeadLetterStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    async fn dead_letter_stats(&self) -> Result<Vec<DeadLetterStats>, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert_if_absent(&self, queue: &QueueName, job: Job) -> Result<Option<Job>, JobStoreError> {
        (**self).insert_if_absent(queue, job).await
    }

    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(queue, id).await
    }

    async fn list(&self, queue: &QueueName, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(queue, filter).await
    }

    async fn stats(&self, queue: &QueueName) -> Result<JobStats, JobStoreError> {
        (**self).stats(queue).await
    }

    async fn last_cursor(
        &self,
        queue: &QueueName,
        job_type: &str,
        dedup_key: &DedupKey,
    ) -> Result<Option<JsonValue>, JobStoreError> {
        (**self).last_cursor(queue, job_type, dedup_key).await
    }

    async fn select_eligible(
        &self,
        queue: &QueueName,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).select_eligible(queue, limit, now).await
    }

    async fn try_lease(
        &self,
        queue: &QueueName,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).try_lease(queue, id, now).await
    }

    async fn compare_and_set(
        &self,
        queue: &QueueName,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool, JobStoreError> {
        (**self).compare_and_set(queue, job, expected).await
    }

    async fn move_to_dead_letter(
        &self,
        queue: &QueueName,
        id: JobId,
        entry: &DeadLetterEntry,
    ) -> Result<bool, JobStoreError> {
        (**self).move_to_dead_letter(queue, id, entry).await
    }

    async fn reclaim_stale(
        &self,
        queue: &QueueName,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        (**self).reclaim_stale(queue, cutoff, now).await
    }

    async fn sweep(&self, queue: &QueueName, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).sweep(queue, cutoff).await
    }
}

#[async_trait]
impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        (**self).get_dead_letter(id).await
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(filter).await
    }

    async fn resolve_dead_letter(
        &self,
        id: DeadLetterId,
        to: DeadLetterStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).resolve_dead_letter(id, to, now).await
    }

    async fn dead_letter_stats(&self) -> Result<Vec<DeadLetterStats>, JobStoreError> {
        (**self).dead_letter_stats().await
    }
}
