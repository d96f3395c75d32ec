//! Dead-letter entries: jobs that exhausted their retries, awaiting an operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{DeadLetterId, JobId};
use crate::job::{DedupKey, Job, NewJob};
use crate::queue::QueueName;

/// Dead-letter entry status. `Retried` and `Ignored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Dead,
    Retried,
    Ignored,
}

impl DeadLetterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterStatus::Dead => "dead",
            DeadLetterStatus::Retried => "retried",
            DeadLetterStatus::Ignored => "ignored",
        }
    }
}

impl core::fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for DeadLetterStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dead" => Ok(DeadLetterStatus::Dead),
            "retried" => Ok(DeadLetterStatus::Retried),
            "ignored" => Ok(DeadLetterStatus::Ignored),
            other => Err(DomainError::invalid_value(format!(
                "unknown dead-letter status '{other}'"
            ))),
        }
    }
}

/// The domain fields of a dead job, enough to enqueue it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub dedup_key: DedupKey,
    pub payload: JsonValue,
    #[serde(default)]
    pub cursor: Option<JsonValue>,
    pub max_retries: u32,
}

impl JobSnapshot {
    pub fn of(job: &Job) -> Self {
        Self {
            dedup_key: job.dedup_key.clone(),
            payload: job.payload.clone(),
            cursor: job.cursor.clone(),
            max_retries: job.max_retries,
        }
    }

    /// Rebuild an enqueue request. The retry budget starts over.
    pub fn into_new_job(self, job_type: impl Into<String>) -> NewJob {
        NewJob {
            job_type: job_type.into(),
            dedup_key: self.dedup_key,
            payload: self.payload,
            run_after: None,
            max_retries: Some(self.max_retries),
            cursor: self.cursor,
        }
    }
}

/// A permanently failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub original_queue: QueueName,
    pub original_job_id: JobId,
    pub job_type: String,
    pub payload: JobSnapshot,
    pub error_message: Option<String>,
    /// Retry count at the time the job died
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    /// Capture a job whose retries are exhausted.
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            id: DeadLetterId::new(),
            original_queue: job.queue.clone(),
            original_job_id: job.id,
            job_type: job.job_type.clone(),
            payload: JobSnapshot::of(job),
            error_message: job.error_message.clone(),
            retry_count: job.retry_count,
            failed_at: now,
            status: DeadLetterStatus::Dead,
            resolved_at: None,
        }
    }

    pub fn mark_retried(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.resolve(DeadLetterStatus::Retried, now)
    }

    pub fn mark_ignored(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.resolve(DeadLetterStatus::Ignored, now)
    }

    /// `dead → retried | ignored`.
    pub fn resolve(&mut self, to: DeadLetterStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if to == DeadLetterStatus::Dead {
            return Err(DomainError::invalid_transition(
                "dead-letter entries cannot be resolved back to dead",
            ));
        }
        if self.status != DeadLetterStatus::Dead {
            return Err(DomainError::invalid_transition(format!(
                "dead-letter entry {} is already {}",
                self.id, self.status
            )));
        }
        self.status = to;
        self.resolved_at = Some(now);
        Ok(())
    }
}
