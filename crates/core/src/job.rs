//! Job rows and their lifecycle.
//!
//! ```text
//! pending ──lease──▶ processing ──complete──▶ completed
//!    ▲                   │
//!    ├──── fail (retry) ─┤
//!    └──── reclaim ──────┤
//!                        └──fail (exhausted)──▶ failed | dead-lettered
//! ```
//!
//! Stores mirror these transitions as conditional writes keyed on the current
//! status; the methods here are the single definition of what each transition
//! does to a row.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::queue::QueueName;
use crate::retry::{DEFAULT_MAX_RETRIES, RetryPolicy};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_after` and a leaser
    Pending,
    /// Leased by a worker (`locked_at` is set)
    Processing,
    /// Finished successfully
    Completed,
    /// Exhausted its retries on a queue without a dead-letter path
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Pending or processing: the statuses that block a duplicate enqueue.
    pub fn is_live(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::invalid_value(format!("unknown job status '{other}'"))),
        }
    }
}

/// Domain fields identifying the logical target of a job.
///
/// Together with `job_type` it must be unique among live rows. The canonical
/// string form (`field=value` pairs sorted by field, joined by `&`) is what
/// stores compare and persist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DedupKey {
    fields: BTreeMap<String, String>,
}

impl DedupKey {
    /// A key with no fields: at most one live job per `job_type`.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn canonical(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Parse the canonical form produced by [`DedupKey::canonical`].
    pub fn parse(canonical: &str) -> DomainResult<Self> {
        let mut fields = BTreeMap::new();
        if canonical.is_empty() {
            return Ok(Self { fields });
        }

        for pair in canonical.split('&') {
            let (k, v) = pair.split_once('=').ok_or_else(|| {
                DomainError::invalid_value(format!("malformed dedup key pair '{pair}'"))
            })?;
            fields.insert(unescape(k)?, unescape(v)?);
        }

        Ok(Self { fields })
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> DomainResult<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3).ok_or_else(|| {
            DomainError::invalid_value(format!("truncated escape in dedup key '{raw}'"))
        })?;
        match code {
            "25" => out.push('%'),
            "26" => out.push('&'),
            "3D" => out.push('='),
            other => {
                return Err(DomainError::invalid_value(format!(
                    "unknown escape '%{other}' in dedup key"
                )));
            }
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

impl core::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl TryFrom<String> for DedupKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DedupKey> for String {
    fn from(value: DedupKey) -> Self {
        value.canonical()
    }
}

/// Request to schedule a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub dedup_key: DedupKey,
    pub payload: JsonValue,
    /// Earliest time the job may be leased (defaults to enqueue time)
    pub run_after: Option<DateTime<Utc>>,
    /// Retry ceiling (defaults to the queue's configured ceiling)
    pub max_retries: Option<u32>,
    /// Watermark carried over from a previous run
    pub cursor: Option<JsonValue>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, dedup_key: DedupKey) -> Self {
        Self {
            job_type: job_type.into(),
            dedup_key,
            payload: JsonValue::Object(Default::default()),
            run_after: None,
            max_retries: None,
            cursor: None,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_cursor(mut self, cursor: JsonValue) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// What a failure did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending, eligible again at `run_after`.
    Retry {
        retry_count: u32,
        run_after: DateTime<Utc>,
    },
    /// Retry budget spent; the row is now `failed`.
    Exhausted { retry_count: u32 },
}

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub job_type: String,
    pub dedup_key: DedupKey,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Last failure reason
    pub error_message: Option<String>,
    /// Set while leased, `None` otherwise
    pub locked_at: Option<DateTime<Utc>>,
    pub run_after: DateTime<Utc>,
    /// Pagination/watermark state, written from handler results
    pub cursor: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a pending row from an enqueue request.
    pub fn new(queue: QueueName, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            queue,
            job_type: new.job_type,
            dedup_key: new.dedup_key,
            payload: new.payload,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            error_message: None,
            locked_at: None,
            run_after: new.run_after.unwrap_or(now),
            cursor: new.cursor,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same `job_type` and dedup key: the two jobs target the same thing.
    pub fn same_target(&self, job_type: &str, dedup_key: &DedupKey) -> bool {
        self.job_type == job_type && &self.dedup_key == dedup_key
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after <= now
    }

    /// Leased before `cutoff` and still processing.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.locked_at.is_some_and(|at| at < cutoff)
    }

    /// Terminal and untouched since before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal() && self.updated_at < cutoff
    }

    /// `pending → processing`.
    pub fn lease(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Pending, "lease")?;
        self.status = JobStatus::Processing;
        self.locked_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `processing → completed`. A returned cursor replaces the stored one.
    pub fn complete(&mut self, cursor: Option<JsonValue>, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Processing, "complete")?;
        self.status = JobStatus::Completed;
        self.locked_at = None;
        if cursor.is_some() {
            self.cursor = cursor;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Count a failure and either requeue with backoff or terminate.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<FailureOutcome> {
        self.expect_status(JobStatus::Processing, "fail")?;

        let retry_count = self.retry_count.saturating_add(1);
        self.error_message = Some(error.into());
        self.locked_at = None;
        self.updated_at = now;

        if retry_count < self.max_retries {
            let delay = policy.delay_for_retry(self.retry_count);
            let run_after = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.status = JobStatus::Pending;
            self.retry_count = retry_count;
            self.run_after = run_after;
            Ok(FailureOutcome::Retry {
                retry_count,
                run_after,
            })
        } else {
            self.status = JobStatus::Failed;
            self.retry_count = retry_count;
            Ok(FailureOutcome::Exhausted { retry_count })
        }
    }

    /// `processing → pending` after a lease expired. Not a failure: the retry
    /// count is left alone.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Processing, "reclaim")?;
        self.status = JobStatus::Pending;
        self.locked_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn expect_status(&self, expected: JobStatus, action: &str) -> DomainResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "cannot {action} job {} in status {} (expected {})",
                self.id, self.status, expected
            )))
        }
    }
}
