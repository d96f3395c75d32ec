//! Typed payloads for every job type the host enqueues.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use taskforge_core::{DedupKey, NewJob};

use crate::kind::QueueKind;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload for job type '{job_type}' is not a JSON object")]
    NotAnObject { job_type: String },
}

/// A payload type bound to one job type on one queue.
pub trait QueuePayload: Serialize + DeserializeOwned + Send + 'static {
    const JOB_TYPE: &'static str;
    const QUEUE: QueueKind;

    /// Fields identifying the target this job works on. Two live jobs with the
    /// same job type and key are the same job.
    fn dedup_key(&self) -> DedupKey;

    fn into_new_job(self) -> Result<NewJob, PayloadError> {
        let dedup_key = self.dedup_key();
        let payload = serde_json::to_value(&self)?;
        Ok(NewJob::new(Self::JOB_TYPE, dedup_key).with_payload(payload))
    }
}

/// Pull new events from one calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchEvents {
    pub calendar_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched_ts: Option<DateTime<Utc>>,
}

impl QueuePayload for FetchEvents {
    const JOB_TYPE: &'static str = "fetch_events";
    const QUEUE: QueueKind = QueueKind::Calendar;

    fn dedup_key(&self) -> DedupKey {
        DedupKey::none().with("calendar_id", self.calendar_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSlackChannel {
    pub workspace_id: String,
    pub channel_id: String,
}

impl QueuePayload for SyncSlackChannel {
    const JOB_TYPE: &'static str = "sync_slack_channel";
    const QUEUE: QueueKind = QueueKind::Slack;

    fn dedup_key(&self) -> DedupKey {
        DedupKey::none()
            .with("workspace_id", self.workspace_id.as_str())
            .with("channel_id", self.channel_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncGithubRepository {
    pub installation_id: i64,
    /// `owner/name`
    pub repository: String,
}

impl QueuePayload for SyncGithubRepository {
    const JOB_TYPE: &'static str = "sync_github_repository";
    const QUEUE: QueueKind = QueueKind::Github;

    fn dedup_key(&self) -> DedupKey {
        DedupKey::none()
            .with("installation_id", self.installation_id.to_string())
            .with("repository", self.repository.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNotionPage {
    pub workspace_id: String,
    pub page_id: String,
}

impl QueuePayload for SyncNotionPage {
    const JOB_TYPE: &'static str = "sync_notion_page";
    const QUEUE: QueueKind = QueueKind::Notion;

    fn dedup_key(&self) -> DedupKey {
        DedupKey::none()
            .with("workspace_id", self.workspace_id.as_str())
            .with("page_id", self.page_id.as_str())
    }
}

/// Execute a stored AI job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAiJob {
    pub ai_job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl QueuePayload for RunAiJob {
    const JOB_TYPE: &'static str = "run_ai_job";
    const QUEUE: QueueKind = QueueKind::AiJobs;

    // The model is a tuning knob, not part of the target.
    fn dedup_key(&self) -> DedupKey {
        DedupKey::none().with("ai_job_id", self.ai_job_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryScope {
    Channel,
    Repository,
    Page,
    Calendar,
    Workspace,
}

impl SummaryScope {
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryScope::Channel => "channel",
            SummaryScope::Repository => "repository",
            SummaryScope::Page => "page",
            SummaryScope::Calendar => "calendar",
            SummaryScope::Workspace => "workspace",
        }
    }
}

/// Summarize activity of one target over `[period_start, period_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateSummary {
    pub scope: SummaryScope,
    pub target_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl QueuePayload for GenerateSummary {
    const JOB_TYPE: &'static str = "generate_summary";
    const QUEUE: QueueKind = QueueKind::Summaries;

    fn dedup_key(&self) -> DedupKey {
        DedupKey::none()
            .with("scope", self.scope.as_str())
            .with("target_id", self.target_id.as_str())
            .with("period_start", self.period_start.to_rfc3339())
            .with("period_end", self.period_end.to_rfc3339())
    }
}

/// Any job the host enqueues, tagged by job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum QueuedJob {
    FetchEvents(FetchEvents),
    SyncSlackChannel(SyncSlackChannel),
    SyncGithubRepository(SyncGithubRepository),
    SyncNotionPage(SyncNotionPage),
    RunAiJob(RunAiJob),
    GenerateSummary(GenerateSummary),
}

macro_rules! each_payload {
    ($value:expr, $p:ident => $body:expr) => {
        match $value {
            QueuedJob::FetchEvents($p) => $body,
            QueuedJob::SyncSlackChannel($p) => $body,
            QueuedJob::SyncGithubRepository($p) => $body,
            QueuedJob::SyncNotionPage($p) => $body,
            QueuedJob::RunAiJob($p) => $body,
            QueuedJob::GenerateSummary($p) => $body,
        }
    };
}

/// Associated consts of a payload value's type.
fn job_type_of<P: QueuePayload>(_: &P) -> &'static str {
    P::JOB_TYPE
}

fn queue_of<P: QueuePayload>(_: &P) -> QueueKind {
    P::QUEUE
}

impl QueuedJob {
    pub fn job_type(&self) -> &'static str {
        each_payload!(self, p => job_type_of(p))
    }

    pub fn queue(&self) -> QueueKind {
        each_payload!(self, p => queue_of(p))
    }

    pub fn dedup_key(&self) -> DedupKey {
        each_payload!(self, p => p.dedup_key())
    }

    /// The job to enqueue on [`QueuedJob::queue`]. The stored payload is the
    /// bare payload struct; the job type lives in its own column.
    pub fn into_new_job(self) -> Result<NewJob, PayloadError> {
        each_payload!(self, p => p.into_new_job())
    }

    /// Rebuild from a stored row's job type and payload.
    pub fn decode(job_type: &str, payload: JsonValue) -> Result<Self, PayloadError> {
        let JsonValue::Object(mut fields) = payload else {
            return Err(PayloadError::NotAnObject {
                job_type: job_type.to_string(),
            });
        };
        fields.insert("job_type".to_string(), JsonValue::String(job_type.to_string()));
        Ok(serde_json::from_value(JsonValue::Object(fields))?)
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for QueuedJob {
                fn from(payload: $variant) -> Self {
                    QueuedJob::$variant(payload)
                }
            }
        )*
    };
}

impl_from_payload!(
    FetchEvents,
    SyncSlackChannel,
    SyncGithubRepository,
    SyncNotionPage,
    RunAiJob,
    GenerateSummary,
);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn samples() -> Vec<QueuedJob> {
        let start = Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap();
        vec![
            FetchEvents {
                calendar_id: "primary".into(),
                last_fetched_ts: Some(start),
            }
            .into(),
            SyncSlackChannel {
                workspace_id: "T1".into(),
                channel_id: "C1".into(),
            }
            .into(),
            SyncGithubRepository {
                installation_id: 42,
                repository: "acme/api".into(),
            }
            .into(),
            SyncNotionPage {
                workspace_id: "w".into(),
                page_id: "p".into(),
            }
            .into(),
            RunAiJob {
                ai_job_id: "job-1".into(),
                model: None,
            }
            .into(),
            GenerateSummary {
                scope: SummaryScope::Channel,
                target_id: "C1".into(),
                period_start: start,
                period_end: start + chrono::Duration::days(7),
            }
            .into(),
        ]
    }

    #[test]
    fn serde_tag_matches_job_type_constant() {
        for job in samples() {
            let value = serde_json::to_value(&job).unwrap();
            assert_eq!(value["job_type"], job.job_type(), "{job:?}");
        }
    }

    #[test]
    fn new_job_carries_type_key_and_bare_payload() {
        for job in samples() {
            let job_type = job.job_type();
            let key = job.dedup_key();
            let new = job.clone().into_new_job().unwrap();

            assert_eq!(new.job_type, job_type);
            assert_eq!(new.dedup_key, key);
            assert!(!key.is_empty());
            assert!(new.payload.get("job_type").is_none());

            assert_eq!(QueuedJob::decode(job_type, new.payload).unwrap(), job);
        }
    }

    #[test]
    fn decode_rejects_non_objects_and_unknown_types() {
        assert!(matches!(
            QueuedJob::decode("fetch_events", serde_json::json!([1])),
            Err(PayloadError::NotAnObject { .. })
        ));
        assert!(matches!(
            QueuedJob::decode("mystery", serde_json::json!({})),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn each_queue_gets_its_own_job_types() {
        let queues: Vec<_> = samples().iter().map(QueuedJob::queue).collect();
        assert_eq!(
            queues,
            vec![
                QueueKind::Calendar,
                QueueKind::Slack,
                QueueKind::Github,
                QueueKind::Notion,
                QueueKind::AiJobs,
                QueueKind::Summaries,
            ]
        );
    }

    #[test]
    fn ai_model_does_not_split_dedup() {
        let a = RunAiJob {
            ai_job_id: "x".into(),
            model: Some("small".into()),
        };
        let b = RunAiJob {
            ai_job_id: "x".into(),
            model: None,
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    proptest! {
        #[test]
        fn distinct_slack_targets_have_distinct_keys(
            a in "[a-zA-Z0-9=&%]{1,12}",
            b in "[a-zA-Z0-9=&%]{1,12}",
            c in "[a-zA-Z0-9=&%]{1,12}",
        ) {
            let x = SyncSlackChannel { workspace_id: a.clone(), channel_id: b.clone() };
            let y = SyncSlackChannel { workspace_id: a, channel_id: c.clone() };
            prop_assert_eq!(x.dedup_key() == y.dedup_key(), b == c);
        }
    }
}
