//! Operator actions on dead-lettered jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use taskforge_core::{DeadLetterEntry, DeadLetterId, DeadLetterStats, DeadLetterStatus, Job, QueueName};

use super::queue::{JobQueue, QueueError};
use super::store::{DeadLetterFilter, DeadLetterStore, JobStore};

/// Result of retrying a dead-letter entry.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadLetterRetry {
    /// A fresh job was enqueued on the original queue.
    Enqueued(Job),
    /// A live job for the same target already existed; nothing new was
    /// enqueued.
    AlreadyScheduled,
}

/// Dead-letter store plus the queues its entries can be sent back to.
pub struct DeadLetterQueue<S> {
    store: Arc<S>,
    queues: Arc<BTreeMap<QueueName, JobQueue<S>>>,
}

impl<S> Clone for DeadLetterQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queues: self.queues.clone(),
        }
    }
}

impl<S> DeadLetterQueue<S>
where
    S: JobStore + DeadLetterStore,
{
    pub fn new(store: Arc<S>, queues: Arc<BTreeMap<QueueName, JobQueue<S>>>) -> Self {
        Self { store, queues }
    }

    /// Entries matching `filter`, most recently failed first.
    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.store.list_dead_letters(filter).await?)
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, QueueError> {
        self.store
            .get_dead_letter(id)
            .await?
            .ok_or(QueueError::DeadLetterNotFound(id))
    }

    /// Enqueue the job again on its original queue with a fresh retry
    /// budget, then mark the entry `retried`.
    pub async fn retry(&self, id: DeadLetterId, now: DateTime<Utc>) -> Result<DeadLetterRetry, QueueError> {
        let entry = self.get(id).await?;
        ensure_dead(&entry)?;

        let queue = self
            .queues
            .get(&entry.original_queue)
            .ok_or_else(|| QueueError::UnknownQueue(entry.original_queue.to_string()))?;

        let new = entry.payload.clone().into_new_job(entry.job_type.clone());
        let enqueued = queue.enqueue(new, now).await?;

        if !self.store.resolve_dead_letter(id, DeadLetterStatus::Retried, now).await? {
            warn!(dead_letter_id = %id, "dead-letter entry resolved concurrently during retry");
        }

        match enqueued {
            Some(job) => {
                info!(dead_letter_id = %id, queue = %entry.original_queue, job_id = %job.id, "dead-letter entry retried");
                Ok(DeadLetterRetry::Enqueued(job))
            }
            None => {
                info!(dead_letter_id = %id, queue = %entry.original_queue, "dead-letter entry retried; target already scheduled");
                Ok(DeadLetterRetry::AlreadyScheduled)
            }
        }
    }

    /// Resolve the entry without further action.
    pub async fn ignore(&self, id: DeadLetterId, now: DateTime<Utc>) -> Result<(), QueueError> {
        let entry = self.get(id).await?;
        ensure_dead(&entry)?;

        if !self.store.resolve_dead_letter(id, DeadLetterStatus::Ignored, now).await? {
            return Err(QueueError::InvalidState(format!(
                "dead-letter entry {id} was resolved concurrently"
            )));
        }

        info!(dead_letter_id = %id, queue = %entry.original_queue, "dead-letter entry ignored");
        Ok(())
    }

    /// Counts per queue and status.
    pub async fn stats(&self) -> Result<Vec<DeadLetterStats>, QueueError> {
        Ok(self.store.dead_letter_stats().await?)
    }
}

fn ensure_dead(entry: &DeadLetterEntry) -> Result<(), QueueError> {
    if entry.status == DeadLetterStatus::Dead {
        Ok(())
    } else {
        Err(QueueError::InvalidState(format!(
            "dead-letter entry {} is already {}",
            entry.id, entry.status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::jobs::in_memory::InMemoryJobStore;
    use crate::jobs::queue::Recorded;
    use taskforge_core::{DedupKey, JobStatus, NewJob};

    struct Fixture {
        queue: JobQueue<InMemoryJobStore>,
        dlq: DeadLetterQueue<InMemoryJobStore>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let options = QueueOptions::new(QueueName::new("notion_sync").unwrap()).with_dead_letter(true);
        let queue = JobQueue::new(options, store.clone());

        let mut queues = BTreeMap::new();
        queues.insert(queue.name().clone(), queue.clone());
        let dlq = DeadLetterQueue::new(store, Arc::new(queues));
        Fixture { queue, dlq }
    }

    async fn kill(queue: &JobQueue<InMemoryJobStore>, page: &str) -> DeadLetterId {
        let now = Utc::now();
        let job = queue
            .enqueue(
                NewJob::new("sync_page", DedupKey::none().with("page_id", page))
                    .with_payload(serde_json::json!({"page_id": page}))
                    .with_max_retries(0),
                now,
            )
            .await
            .unwrap()
            .unwrap();
        queue.lease(now).await.unwrap();
        match queue.mark_failed(job.id, "notion 500", now).await.unwrap() {
            Recorded::DeadLettered(id) => id,
            other => panic!("expected dead-lettered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_reenqueues_original_payload() {
        let f = fixture();
        let id = kill(&f.queue, "p1").await;

        let DeadLetterRetry::Enqueued(job) = f.dlq.retry(id, Utc::now()).await.unwrap() else {
            panic!("expected a new job");
        };
        assert_eq!(job.job_type, "sync_page");
        assert_eq!(job.payload, serde_json::json!({"page_id": "p1"}));
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 0);
        assert_eq!(job.status, JobStatus::Pending);

        let entry = f.dlq.get(id).await.unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Retried);
        assert!(entry.resolved_at.is_some());
    }

    #[tokio::test]
    async fn retry_when_target_already_live() {
        let f = fixture();
        let id = kill(&f.queue, "p1").await;
        f.queue
            .enqueue(NewJob::new("sync_page", DedupKey::none().with("page_id", "p1")), Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            f.dlq.retry(id, Utc::now()).await.unwrap(),
            DeadLetterRetry::AlreadyScheduled
        );
        assert_eq!(f.dlq.get(id).await.unwrap().status, DeadLetterStatus::Retried);
    }

    #[tokio::test]
    async fn resolved_entries_reject_further_actions() {
        let f = fixture();
        let id = kill(&f.queue, "p1").await;

        f.dlq.ignore(id, Utc::now()).await.unwrap();
        assert!(matches!(f.dlq.retry(id, Utc::now()).await, Err(QueueError::InvalidState(_))));
        assert!(matches!(f.dlq.ignore(id, Utc::now()).await, Err(QueueError::InvalidState(_))));
    }

    #[tokio::test]
    async fn unknown_entry_is_not_found() {
        let f = fixture();
        let id = DeadLetterId::new();
        assert!(matches!(f.dlq.get(id).await, Err(QueueError::DeadLetterNotFound(x)) if x == id));
    }

    #[tokio::test]
    async fn retry_requires_the_original_queue() {
        let f = fixture();
        let id = kill(&f.queue, "p1").await;

        let orphaned = DeadLetterQueue::new(f.queue.store().clone(), Arc::new(BTreeMap::new()));
        assert!(matches!(
            orphaned.retry(id, Utc::now()).await,
            Err(QueueError::UnknownQueue(q)) if q == "notion_sync"
        ));
        assert_eq!(f.dlq.get(id).await.unwrap().status, DeadLetterStatus::Dead);
    }

    #[tokio::test]
    async fn stats_and_listing() {
        let f = fixture();
        let a = kill(&f.queue, "p1").await;
        kill(&f.queue, "p2").await;
        f.dlq.ignore(a, Utc::now()).await.unwrap();

        let stats = f.dlq.stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.queue.as_str() == "notion_sync" && s.count == 1));

        let dead = f
            .dlq
            .list(&DeadLetterFilter::default().with_status(DeadLetterStatus::Dead))
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
    }
}
