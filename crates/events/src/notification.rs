//! Job outcome notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskforge_core::{Job, JobId, QueueName};

/// Terminal outcome being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Completed,
    Failed,
    DeadLettered,
}

/// Fire-and-forget message describing a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub queue: QueueName,
    pub job_id: JobId,
    pub job_type: String,
    pub status: NotificationStatus,
    /// Handler-provided summary on success, the error message on failure
    pub summary: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl JobNotification {
    pub fn for_job(
        job: &Job,
        status: NotificationStatus,
        summary: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            queue: job.queue.clone(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            status,
            summary,
            occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::{DedupKey, NewJob};

    #[test]
    fn serializes_with_snake_case_status() {
        let now = Utc::now();
        let job = Job::new(
            QueueName::new("summaries").unwrap(),
            NewJob::new("generate_summary", DedupKey::none()),
            now,
        );

        let n = JobNotification::for_job(&job, NotificationStatus::DeadLettered, None, now);
        let json = serde_json::to_value(&n).unwrap();

        assert_eq!(json["status"], "dead_lettered");
        assert_eq!(json["queue"], "summaries");
        assert_eq!(json["job_type"], "generate_summary");

        let back: JobNotification = serde_json::from_value(json).unwrap();
        assert_eq!(back, n);
    }
}
