//! Per-queue engine: enqueue, lease, outcome recording, reclaim and sweep.
//!
//! Every write goes through the store's conditional primitives, so a
//! `JobQueue` holds no locks of its own and any number of them (in any
//! number of processes) can drive the same queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use taskforge_core::{
    DeadLetterEntry, DeadLetterId, DedupKey, DomainError, FailureOutcome, Job, JobId, JobStats,
    JobStatus, NewJob, QueueName,
};
use taskforge_events::{JobNotification, NotificationStatus};

use super::registry::HandlerOutcome;
use super::store::{JobFilter, JobStore, JobStoreError};
use crate::config::QueueOptions;
use crate::notify::{JobNotifier, NoopNotifier};

/// Engine and admin errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(DeadLetterId),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// What an outcome write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Completed,
    Retrying {
        retry_count: u32,
        run_after: DateTime<Utc>,
    },
    Failed,
    DeadLettered(DeadLetterId),
    /// The row was no longer processing (reclaimed, or finished by a
    /// duplicate run); nothing was written.
    LeaseLost,
}

/// One queue's engine.
pub struct JobQueue<S> {
    options: QueueOptions,
    store: Arc<S>,
    notifier: Arc<dyn JobNotifier>,
}

impl<S> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            store: self.store.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<S> std::fmt::Debug for JobQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("options", &self.options).finish()
    }
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(options: QueueOptions, store: Arc<S>) -> Self {
        Self::with_notifier(options, store, Arc::new(NoopNotifier))
    }

    pub fn with_notifier(options: QueueOptions, store: Arc<S>, notifier: Arc<dyn JobNotifier>) -> Self {
        Self {
            options,
            store,
            notifier,
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.options.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Schedule a job unless the same target is already pending or
    /// processing. `None` means it was already scheduled; that is not an
    /// error.
    pub async fn enqueue(&self, new: NewJob, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut new = new;
        if new.max_retries.is_none() {
            new.max_retries = Some(self.options.default_max_retries);
        }

        let job = Job::new(self.name().clone(), new, now);
        match self.store.insert_if_absent(self.name(), job).await? {
            Some(job) => {
                debug!(queue = %self.name(), job_id = %job.id, job_type = %job.job_type, run_after = %job.run_after, "job enqueued");
                Ok(Some(job))
            }
            None => {
                debug!(queue = %self.name(), "job already scheduled; enqueue skipped");
                Ok(None)
            }
        }
    }

    /// Like [`enqueue`](Self::enqueue), but a job without a cursor resumes
    /// from the cursor of the last completed run for the same target.
    pub async fn enqueue_resuming(&self, new: NewJob, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut new = new;
        if new.cursor.is_none() {
            new.cursor = self.last_cursor(&new.job_type, &new.dedup_key).await?;
        }
        self.enqueue(new, now).await
    }

    /// Lease up to `parallelism` eligible jobs. Candidates another leaser
    /// wins are skipped.
    pub async fn lease(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let candidates = self
            .store
            .select_eligible(self.name(), self.options.parallelism, now)
            .await?;

        let mut leased = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.store.try_lease(self.name(), candidate.id, now).await? {
                Some(job) => leased.push(job),
                None => debug!(queue = %self.name(), job_id = %candidate.id, "lease lost to another worker"),
            }
        }

        Ok(leased)
    }

    pub async fn mark_completed(
        &self,
        id: JobId,
        outcome: HandlerOutcome,
        now: DateTime<Utc>,
    ) -> Result<Recorded, QueueError> {
        let Some(mut job) = self.load_processing(id).await? else {
            return Ok(Recorded::LeaseLost);
        };

        job.complete(outcome.cursor, now)?;
        if !self.store.compare_and_set(self.name(), &job, JobStatus::Processing).await? {
            return Ok(self.lease_lost(id));
        }

        debug!(queue = %self.name(), job_id = %id, job_type = %job.job_type, "job completed");
        self.notify(&job, NotificationStatus::Completed, outcome.summary, now);
        Ok(Recorded::Completed)
    }

    /// Count a failure: requeue with backoff, or terminate once the retry
    /// budget is spent (dead-letter when the queue is wired for it).
    pub async fn mark_failed(
        &self,
        id: JobId,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Recorded, QueueError> {
        let Some(mut job) = self.load_processing(id).await? else {
            return Ok(Recorded::LeaseLost);
        };

        match job.fail(error, &self.options.retry_policy, now)? {
            FailureOutcome::Retry {
                retry_count,
                run_after,
            } => {
                if !self.store.compare_and_set(self.name(), &job, JobStatus::Processing).await? {
                    return Ok(self.lease_lost(id));
                }
                info!(
                    queue = %self.name(),
                    job_id = %id,
                    retry_count,
                    max_retries = job.max_retries,
                    run_after = %run_after,
                    error = job.error_message.as_deref().unwrap_or_default(),
                    "job failed; retry scheduled"
                );
                Ok(Recorded::Retrying {
                    retry_count,
                    run_after,
                })
            }
            FailureOutcome::Exhausted { retry_count } if self.options.dead_letter => {
                let entry = DeadLetterEntry::from_job(&job, now);
                if !self.store.move_to_dead_letter(self.name(), id, &entry).await? {
                    return Ok(self.lease_lost(id));
                }
                warn!(
                    queue = %self.name(),
                    job_id = %id,
                    dead_letter_id = %entry.id,
                    retry_count,
                    error = job.error_message.as_deref().unwrap_or_default(),
                    "job exhausted retries; moved to dead-letter store"
                );
                self.notify(&job, NotificationStatus::DeadLettered, job.error_message.clone(), now);
                Ok(Recorded::DeadLettered(entry.id))
            }
            FailureOutcome::Exhausted { retry_count } => {
                if !self.store.compare_and_set(self.name(), &job, JobStatus::Processing).await? {
                    return Ok(self.lease_lost(id));
                }
                warn!(
                    queue = %self.name(),
                    job_id = %id,
                    retry_count,
                    error = job.error_message.as_deref().unwrap_or_default(),
                    "job exhausted retries; marked failed"
                );
                self.notify(&job, NotificationStatus::Failed, job.error_message.clone(), now);
                Ok(Recorded::Failed)
            }
        }
    }

    /// Return processing rows whose lease is older than `lease_timeout` to
    /// pending. The retry count is untouched.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, QueueError> {
        let cutoff = before(now, self.options.lease_timeout);
        let reclaimed = self.store.reclaim_stale(self.name(), cutoff, now).await?;
        if !reclaimed.is_empty() {
            warn!(queue = %self.name(), count = reclaimed.len(), cutoff = %cutoff, "reclaimed stale leases");
        }
        Ok(reclaimed)
    }

    /// Delete terminal rows untouched for longer than `retention`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let cutoff = before(now, self.options.retention);
        let deleted = self.store.sweep(self.name(), cutoff).await?;
        if deleted > 0 {
            debug!(queue = %self.name(), deleted, "swept expired jobs");
        }
        Ok(deleted)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(self.name(), id).await?)
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(self.name(), filter).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats(self.name()).await?)
    }

    pub async fn last_cursor(
        &self,
        job_type: &str,
        dedup_key: &DedupKey,
    ) -> Result<Option<JsonValue>, QueueError> {
        Ok(self.store.last_cursor(self.name(), job_type, dedup_key).await?)
    }

    /// The row if it is still processing. A missing row is reported the
    /// same way: a duplicate run may already have dead-lettered it.
    async fn load_processing(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        match self.store.get(self.name(), id).await? {
            Some(job) if job.status == JobStatus::Processing => Ok(Some(job)),
            Some(job) => {
                warn!(queue = %self.name(), job_id = %id, status = %job.status, "outcome for a job that is no longer processing; ignored");
                Ok(None)
            }
            None => {
                warn!(queue = %self.name(), job_id = %id, "outcome for a job that no longer exists; ignored");
                Ok(None)
            }
        }
    }

    fn lease_lost(&self, id: JobId) -> Recorded {
        warn!(queue = %self.name(), job_id = %id, "job changed while recording outcome; write skipped");
        Recorded::LeaseLost
    }

    fn notify(&self, job: &Job, status: NotificationStatus, summary: Option<String>, now: DateTime<Utc>) {
        self.notifier
            .notify(JobNotification::for_job(job, status, summary, now));
    }
}

/// `now - window`, clamped at the earliest representable time.
fn before(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::InMemoryJobStore;
    use crate::jobs::store::DeadLetterStore;
    use crate::notify::BusNotifier;
    use chrono::TimeZone;
    use taskforge_core::{DeadLetterStatus, RetryPolicy};
    use taskforge_events::{EventBus, InMemoryEventBus};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn options(name: &str) -> QueueOptions {
        QueueOptions::new(QueueName::new(name).unwrap())
            .with_retry_policy(RetryPolicy::exponential(Duration::from_secs(30)))
    }

    fn fetch(calendar: &str) -> NewJob {
        NewJob::new("fetch_events", DedupKey::none().with("calendar_id", calendar))
    }

    fn queue_with_bus(
        options: QueueOptions,
    ) -> (
        JobQueue<InMemoryJobStore>,
        Arc<InMemoryJobStore>,
        taskforge_events::Subscription<JobNotification>,
    ) {
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::<JobNotification>::new());
        let sub = bus.subscribe();
        let queue = JobQueue::with_notifier(options, store.clone(), Arc::new(BusNotifier::new(bus)));
        (queue, store, sub)
    }

    #[tokio::test]
    async fn retry_schedule_then_terminal_failure() {
        let (queue, _store, sub) = queue_with_bus(options("calendar_sync"));
        let job = queue.enqueue(fetch("cal-a").with_max_retries(3), t0()).await.unwrap().unwrap();

        let leased = queue.lease(t0()).await.unwrap();
        assert_eq!(leased.len(), 1);
        let recorded = queue.mark_failed(job.id, "boom", t0()).await.unwrap();
        assert_eq!(
            recorded,
            Recorded::Retrying {
                retry_count: 1,
                run_after: t0() + chrono::Duration::seconds(30)
            }
        );

        // Not eligible until the backoff elapses.
        assert!(queue.lease(t0() + chrono::Duration::seconds(29)).await.unwrap().is_empty());

        let t1 = t0() + chrono::Duration::seconds(30);
        assert_eq!(queue.lease(t1).await.unwrap().len(), 1);
        let recorded = queue.mark_failed(job.id, "boom", t1).await.unwrap();
        assert_eq!(
            recorded,
            Recorded::Retrying {
                retry_count: 2,
                run_after: t1 + chrono::Duration::seconds(60)
            }
        );

        let t2 = t1 + chrono::Duration::seconds(60);
        assert_eq!(queue.lease(t2).await.unwrap().len(), 1);
        assert_eq!(queue.mark_failed(job.id, "boom", t2).await.unwrap(), Recorded::Failed);

        let row = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.error_message.as_deref(), Some("boom"));
        assert!(queue.lease(t2 + chrono::Duration::days(30)).await.unwrap().is_empty());

        let n = sub.try_recv().unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
        assert_eq!(n.summary.as_deref(), Some("boom"));
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn exhausted_job_moves_to_dead_letter_store() {
        let (queue, store, sub) = queue_with_bus(options("slack_sync").with_dead_letter(true));
        let job = queue.enqueue(fetch("cal-a").with_max_retries(0), t0()).await.unwrap().unwrap();

        queue.lease(t0()).await.unwrap();
        let recorded = queue.mark_failed(job.id, "rate limited", t0()).await.unwrap();
        let Recorded::DeadLettered(dead_id) = recorded else {
            panic!("expected dead-lettered, got {recorded:?}");
        };

        assert!(queue.get(job.id).await.unwrap().is_none());
        let entry = store.get_dead_letter(dead_id).await.unwrap().unwrap();
        assert_eq!(entry.original_job_id, job.id);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.status, DeadLetterStatus::Dead);
        assert_eq!(entry.error_message.as_deref(), Some("rate limited"));

        assert_eq!(sub.try_recv().unwrap().status, NotificationStatus::DeadLettered);
    }

    #[tokio::test]
    async fn completion_stores_cursor_and_notifies_summary() {
        let (queue, _store, sub) = queue_with_bus(options("calendar_sync"));
        let job = queue.enqueue(fetch("cal-a"), t0()).await.unwrap().unwrap();
        queue.lease(t0()).await.unwrap();

        let outcome = HandlerOutcome::done()
            .with_cursor(serde_json::json!({"last_fetched_ts": 1700}))
            .with_summary("12 events");
        assert_eq!(queue.mark_completed(job.id, outcome, t0()).await.unwrap(), Recorded::Completed);

        let row = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert!(row.locked_at.is_none());

        let n = sub.try_recv().unwrap();
        assert_eq!(n.status, NotificationStatus::Completed);
        assert_eq!(n.summary.as_deref(), Some("12 events"));

        // The next run for the same calendar resumes from the stored cursor.
        let next = queue.enqueue_resuming(fetch("cal-a"), t0()).await.unwrap().unwrap();
        assert_eq!(next.cursor, Some(serde_json::json!({"last_fetched_ts": 1700})));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_a_no_op() {
        let (queue, _store, _sub) = queue_with_bus(options("calendar_sync"));

        assert!(queue.enqueue(fetch("cal-a"), t0()).await.unwrap().is_some());
        assert!(queue.enqueue(fetch("cal-a"), t0()).await.unwrap().is_none());

        queue.lease(t0()).await.unwrap();
        assert!(queue.enqueue(fetch("cal-a"), t0()).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn queue_default_max_retries_applies() {
        let (queue, _store, _sub) = queue_with_bus(options("calendar_sync").with_default_max_retries(7));

        let job = queue.enqueue(fetch("a"), t0()).await.unwrap().unwrap();
        assert_eq!(job.max_retries, 7);

        let explicit = queue.enqueue(fetch("b").with_max_retries(1), t0()).await.unwrap().unwrap();
        assert_eq!(explicit.max_retries, 1);
    }

    #[tokio::test]
    async fn lease_respects_parallelism_and_order() {
        let (queue, _store, _sub) = queue_with_bus(options("ai_jobs").with_parallelism(2));

        let late = queue.enqueue(fetch("late").run_after(t0()), t0()).await.unwrap().unwrap();
        let early = queue
            .enqueue(fetch("early").run_after(t0() - chrono::Duration::minutes(5)), t0())
            .await
            .unwrap()
            .unwrap();
        queue.enqueue(fetch("third"), t0()).await.unwrap().unwrap();

        let leased: Vec<JobId> = queue.lease(t0()).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(leased, vec![early.id, late.id]);
        assert_eq!(queue.lease(t0()).await.unwrap().len(), 1);
        assert!(queue.lease(t0()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaimed_job_reports_lease_lost_to_the_original_holder() {
        let (queue, _store, sub) = queue_with_bus(options("github_sync"));
        let job = queue.enqueue(fetch("a"), t0()).await.unwrap().unwrap();
        queue.lease(t0()).await.unwrap();

        let later = t0() + chrono::Duration::minutes(11);
        assert_eq!(queue.reclaim_stale(later).await.unwrap(), vec![job.id]);

        let row = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.retry_count, 0);

        // The slow original run finishes after the reclaim.
        let recorded = queue.mark_completed(job.id, HandlerOutcome::done(), later).await.unwrap();
        assert_eq!(recorded, Recorded::LeaseLost);
        assert!(sub.try_recv().is_err());

        // And the job is leasable again.
        assert_eq!(queue.lease(later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fresh_leases_are_not_reclaimed() {
        let (queue, _store, _sub) = queue_with_bus(options("github_sync"));
        queue.enqueue(fetch("a"), t0()).await.unwrap().unwrap();
        queue.lease(t0()).await.unwrap();

        assert!(queue.reclaim_stale(t0() + chrono::Duration::minutes(9)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_uses_retention_window() {
        let (queue, _store, _sub) = queue_with_bus(options("summaries"));
        let job = queue.enqueue(fetch("a"), t0()).await.unwrap().unwrap();
        queue.lease(t0()).await.unwrap();
        queue.mark_completed(job.id, HandlerOutcome::done(), t0()).await.unwrap();

        assert_eq!(queue.sweep(t0() + chrono::Duration::days(6)).await.unwrap(), 0);
        assert_eq!(queue.sweep(t0() + chrono::Duration::days(8)).await.unwrap(), 1);
        assert!(queue.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_job_outcome_is_lease_lost() {
        let (queue, _store, _sub) = queue_with_bus(options("summaries"));
        let recorded = queue.mark_failed(JobId::new(), "boom", t0()).await.unwrap();
        assert_eq!(recorded, Recorded::LeaseLost);
    }
}
