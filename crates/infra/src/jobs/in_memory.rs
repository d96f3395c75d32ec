//! In-memory job store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use taskforge_core::{
    DeadLetterEntry, DeadLetterId, DeadLetterStats, DeadLetterStatus, DedupKey, Job, JobId,
    JobStats, JobStatus, QueueName,
};

use super::store::{DeadLetterFilter, DeadLetterStore, JobFilter, JobStore, JobStoreError};

/// Rows of one queue, keyed by insertion sequence so iteration order is
/// insertion order.
#[derive(Debug, Default)]
struct QueueTable {
    next_seq: u64,
    rows: BTreeMap<u64, Job>,
    index: HashMap<JobId, u64>,
}

impl QueueTable {
    fn insert(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(job.id, seq);
        self.rows.insert(seq, job);
    }

    fn get(&self, id: JobId) -> Option<&Job> {
        self.index.get(&id).and_then(|seq| self.rows.get(seq))
    }

    fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        let seq = self.index.get(&id)?;
        self.rows.get_mut(seq)
    }

    fn remove(&mut self, id: JobId) -> Option<Job> {
        let seq = self.index.remove(&id)?;
        self.rows.remove(&seq)
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<QueueName, QueueTable>,
    dead_letters: Vec<DeadLetterEntry>,
}

/// In-memory job + dead-letter store.
///
/// A single mutex guards every queue and the dead-letter list, so each
/// operation (including the dead-letter move) is atomic. The lock is never
/// held across an `.await`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory job store lock poisoned".to_string()))
    }

    /// Overwrite a row as-is, bypassing every status check.
    ///
    /// Test hook for simulating crashed workers and clock skew.
    pub fn force_update(&self, job: Job) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        let table = state.queues.entry(job.queue.clone()).or_default();
        match table.get_mut(job.id) {
            Some(row) => {
                *row = job;
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_if_absent(&self, queue: &QueueName, job: Job) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.lock()?;
        let table = state.queues.entry(queue.clone()).or_default();

        let already_live = table
            .rows
            .values()
            .any(|j| j.status.is_live() && j.same_target(&job.job_type, &job.dedup_key));
        if already_live {
            return Ok(None);
        }

        table.insert(job.clone());
        Ok(Some(job))
    }

    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let state = self.lock()?;
        Ok(state.queues.get(queue).and_then(|t| t.get(id)).cloned())
    }

    async fn list(&self, queue: &QueueName, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let state = self.lock()?;
        let Some(table) = state.queues.get(queue) else {
            return Ok(Vec::new());
        };

        Ok(table
            .rows
            .values()
            .rev()
            .filter(|j| filter.matches(j))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn stats(&self, queue: &QueueName) -> Result<JobStats, JobStoreError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        if let Some(table) = state.queues.get(queue) {
            for job in table.rows.values() {
                stats.record(job.status, 1);
            }
        }
        Ok(stats)
    }

    async fn last_cursor(
        &self,
        queue: &QueueName,
        job_type: &str,
        dedup_key: &DedupKey,
    ) -> Result<Option<JsonValue>, JobStoreError> {
        let state = self.lock()?;
        Ok(state.queues.get(queue).and_then(|table| {
            table
                .rows
                .values()
                .filter(|j| j.status == JobStatus::Completed && j.same_target(job_type, dedup_key))
                .max_by_key(|j| j.updated_at)
                .and_then(|j| j.cursor.clone())
        }))
    }

    async fn select_eligible(
        &self,
        queue: &QueueName,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let state = self.lock()?;
        let Some(table) = state.queues.get(queue) else {
            return Ok(Vec::new());
        };

        // `rows` iterates in insertion order and the sort is stable, so equal
        // `run_after` values keep insertion order.
        let mut candidates: Vec<&Job> = table.rows.values().filter(|j| j.is_eligible(now)).collect();
        candidates.sort_by_key(|j| j.run_after);

        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    async fn try_lease(
        &self,
        queue: &QueueName,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.lock()?;
        let Some(job) = state.queues.get_mut(queue).and_then(|t| t.get_mut(id)) else {
            return Ok(None);
        };

        if job.status != JobStatus::Pending {
            return Ok(None);
        }

        job.lease(now)?;
        Ok(Some(job.clone()))
    }

    async fn compare_and_set(
        &self,
        queue: &QueueName,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.lock()?;
        let Some(row) = state.queues.get_mut(queue).and_then(|t| t.get_mut(job.id)) else {
            return Ok(false);
        };

        if row.status != expected {
            return Ok(false);
        }

        row.status = job.status;
        row.retry_count = job.retry_count;
        row.error_message = job.error_message.clone();
        row.locked_at = job.locked_at;
        row.run_after = job.run_after;
        row.cursor = job.cursor.clone();
        row.updated_at = job.updated_at;
        Ok(true)
    }

    async fn move_to_dead_letter(
        &self,
        queue: &QueueName,
        id: JobId,
        entry: &DeadLetterEntry,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.lock()?;
        let Some(table) = state.queues.get_mut(queue) else {
            return Ok(false);
        };

        let still_processing = table
            .get(id)
            .is_some_and(|j| j.status == JobStatus::Processing);
        if !still_processing {
            return Ok(false);
        }

        table.remove(id);
        state.dead_letters.push(entry.clone());
        Ok(true)
    }

    async fn reclaim_stale(
        &self,
        queue: &QueueName,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let mut state = self.lock()?;
        let Some(table) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut reclaimed = Vec::new();
        for job in table.rows.values_mut().filter(|j| j.is_stale(cutoff)) {
            job.reclaim(now)?;
            reclaimed.push(job.id);
        }
        Ok(reclaimed)
    }

    async fn sweep(&self, queue: &QueueName, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut state = self.lock()?;
        let Some(table) = state.queues.get_mut(queue) else {
            return Ok(0);
        };

        let expired: Vec<JobId> = table
            .rows
            .values()
            .filter(|j| j.is_expired(cutoff))
            .map(|j| j.id)
            .collect();
        for id in &expired {
            table.remove(*id);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryJobStore {
    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        let state = self.lock()?;
        Ok(state.dead_letters.iter().find(|e| e.id == id).cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let state = self.lock()?;
        let mut result: Vec<_> = state
            .dead_letters
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        result.truncate(filter.limit);
        Ok(result)
    }

    async fn resolve_dead_letter(
        &self,
        id: DeadLetterId,
        to: DeadLetterStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.lock()?;
        let Some(entry) = state.dead_letters.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };

        if entry.status != DeadLetterStatus::Dead {
            return Ok(false);
        }

        entry.resolve(to, now)?;
        Ok(true)
    }

    async fn dead_letter_stats(&self) -> Result<Vec<DeadLetterStats>, JobStoreError> {
        let state = self.lock()?;
        let mut counts: BTreeMap<(QueueName, &'static str), (DeadLetterStatus, u64)> = BTreeMap::new();
        for entry in &state.dead_letters {
            let slot = counts
                .entry((entry.original_queue.clone(), entry.status.as_str()))
                .or_insert((entry.status, 0));
            slot.1 += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((queue, _), (status, count))| DeadLetterStats { queue, status, count })
            .collect())
    }
}
