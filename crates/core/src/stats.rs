//! Aggregated counts for observability.

use serde::Serialize;

use crate::dead_letter::DeadLetterStatus;
use crate::job::JobStatus;
use crate::queue::QueueName;

/// Job counts by status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Dead-letter count for one `(queue, status)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub queue: QueueName,
    pub status: DeadLetterStatus,
    pub count: u64,
}
