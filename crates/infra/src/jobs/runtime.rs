//! Multi-queue runtime: the administrative surface a host (HTTP layer, CLI,
//! dashboard) talks to, and the owner of every queue's worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use taskforge_core::{Job, JobId, JobStats, NewJob, QueueName};

use super::dead_letter::DeadLetterQueue;
use super::postgres::PostgresJobStore;
use super::queue::{JobQueue, QueueError};
use super::registry::HandlerRegistry;
use super::store::{DeadLetterStore, JobFilter, JobStore};
use super::worker::{QueueWorker, WorkerHandle, WorkerStats};
use crate::config::QueueOptions;
use crate::notify::{JobNotifier, NoopNotifier};

/// Collects queues and their handlers before the runtime is built.
pub struct JobRuntimeBuilder<S> {
    store: Arc<S>,
    notifier: Arc<dyn JobNotifier>,
    queues: BTreeMap<QueueName, (QueueOptions, HandlerRegistry)>,
}

impl<S> JobRuntimeBuilder<S>
where
    S: JobStore + DeadLetterStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            notifier: Arc::new(NoopNotifier),
            queues: BTreeMap::new(),
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn JobNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Add a queue, or replace its options while keeping its handlers.
    pub fn queue(mut self, options: QueueOptions) -> Self {
        match self.queues.get_mut(&options.name) {
            Some(entry) => entry.0 = options,
            None => {
                self.queues
                    .insert(options.name.clone(), (options, HandlerRegistry::new()));
            }
        }
        self
    }

    /// Handler registry of a queue added earlier.
    pub fn handlers(&mut self, queue: &str) -> Result<&mut HandlerRegistry, QueueError> {
        self.queues
            .get_mut(queue)
            .map(|(_, handlers)| handlers)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    pub fn build(self) -> JobRuntime<S> {
        let mut queues = BTreeMap::new();
        let mut workers = BTreeMap::new();
        for (name, (options, registry)) in self.queues {
            let queue = JobQueue::with_notifier(options, self.store.clone(), self.notifier.clone());
            workers.insert(name.clone(), QueueWorker::new(queue.clone(), registry));
            queues.insert(name, queue);
        }

        JobRuntime {
            store: self.store,
            queues: Arc::new(queues),
            workers,
        }
    }
}

/// Every registered queue over one shared store.
///
/// Each queue has exactly one worker; every handle to it shares the same
/// single-flight guard and counters, so a queue's ticks never overlap.
pub struct JobRuntime<S> {
    store: Arc<S>,
    queues: Arc<BTreeMap<QueueName, JobQueue<S>>>,
    workers: BTreeMap<QueueName, QueueWorker<S>>,
}

impl<S> JobRuntime<S>
where
    S: JobStore + DeadLetterStore + 'static,
{
    pub fn builder(store: Arc<S>) -> JobRuntimeBuilder<S> {
        JobRuntimeBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &QueueName> {
        self.queues.keys()
    }

    pub fn queue(&self, name: &str) -> Result<&JobQueue<S>, QueueError> {
        self.queues
            .get(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    pub async fn enqueue(&self, queue: &str, new: NewJob) -> Result<Option<Job>, QueueError> {
        self.enqueue_at(queue, new, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        queue: &str,
        new: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        self.queue(queue)?.enqueue(new, now).await
    }

    pub async fn stats(&self, queue: &str) -> Result<JobStats, QueueError> {
        self.queue(queue)?.stats().await
    }

    pub async fn stats_all(&self) -> Result<BTreeMap<QueueName, JobStats>, QueueError> {
        let mut all = BTreeMap::new();
        for (name, queue) in self.queues.iter() {
            all.insert(name.clone(), queue.stats().await?);
        }
        Ok(all)
    }

    pub async fn list_jobs(&self, queue: &str, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        self.queue(queue)?.list(filter).await
    }

    pub async fn get_job(&self, queue: &str, id: JobId) -> Result<Job, QueueError> {
        self.queue(queue)?
            .get(id)
            .await?
            .ok_or(QueueError::NotFound(id))
    }

    pub fn dead_letters(&self) -> DeadLetterQueue<S> {
        DeadLetterQueue::new(self.store.clone(), self.queues.clone())
    }

    /// The queue's worker. Ticks through any handle skip while another
    /// tick of the same queue is running.
    pub fn worker(&self, queue: &str) -> Result<QueueWorker<S>, QueueError> {
        self.workers
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    /// Start one independent worker per queue on the current tokio runtime.
    pub fn spawn_workers(&self) -> RuntimeHandle {
        let workers = self
            .workers
            .values()
            .map(QueueWorker::spawn)
            .collect::<Vec<_>>();

        info!(queues = workers.len(), "job workers started");
        RuntimeHandle { workers }
    }
}

impl JobRuntime<PostgresJobStore> {
    /// Create every registered queue's table and the dead-letter table.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        for queue in self.queues.values() {
            self.store
                .ensure_queue_schema(queue.name(), queue.options().unique_dedup)
                .await?;
        }
        self.store.ensure_dead_letter_schema().await?;
        Ok(())
    }
}

/// Handles of the workers started by [`JobRuntime::spawn_workers`].
#[derive(Debug)]
pub struct RuntimeHandle {
    workers: Vec<WorkerHandle>,
}

impl RuntimeHandle {
    pub fn stats(&self) -> Vec<(QueueName, WorkerStats)> {
        self.workers
            .iter()
            .map(|w| (w.queue().clone(), w.stats()))
            .collect()
    }

    /// Stop every worker after its in-flight tick.
    pub async fn shutdown(self) -> Vec<(QueueName, WorkerStats)> {
        let mut stats = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            let queue = worker.queue().clone();
            stats.push((queue, worker.shutdown().await));
        }
        info!("job workers stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::InMemoryJobStore;
    use crate::jobs::registry::HandlerOutcome;
    use serde_json::Value as JsonValue;
    use std::time::Duration;
    use taskforge_core::{DedupKey, JobStatus};

    fn name(s: &str) -> QueueName {
        QueueName::new(s).unwrap()
    }

    fn runtime() -> JobRuntime<InMemoryJobStore> {
        let mut builder = JobRuntime::builder(InMemoryJobStore::arc())
            .queue(QueueOptions::new(name("calendar_sync")).with_poll_interval(Duration::from_millis(10)))
            .queue(
                QueueOptions::new(name("summaries"))
                    .with_dead_letter(true)
                    .with_default_max_retries(1)
                    .with_poll_interval(Duration::from_millis(10)),
            );

        builder
            .handlers("calendar_sync")
            .unwrap()
            .register_fn("fetch_events", |_ctx, _p: JsonValue| async {
                Ok(HandlerOutcome::done())
            });
        builder
            .handlers("summaries")
            .unwrap()
            .register_fn("generate_summary", |_ctx, _p: JsonValue| async {
                Err(anyhow::anyhow!("model unavailable"))
            });

        builder.build()
    }

    #[tokio::test]
    async fn admin_operations_route_by_queue_name() {
        let rt = runtime();
        let job = rt
            .enqueue("calendar_sync", NewJob::new("fetch_events", DedupKey::none().with("calendar_id", "c")))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(rt.get_job("calendar_sync", job.id).await.unwrap().id, job.id);
        assert!(matches!(
            rt.get_job("summaries", job.id).await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            rt.stats("nope").await,
            Err(QueueError::UnknownQueue(q)) if q == "nope"
        ));

        let all = rt.stats_all().await.unwrap();
        assert_eq!(all[&name("calendar_sync")].pending, 1);
        assert_eq!(all[&name("summaries")].total(), 0);

        let pending = rt
            .list_jobs("calendar_sync", &JobFilter::default().with_status(JobStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn handlers_require_a_registered_queue() {
        let mut builder = JobRuntime::builder(InMemoryJobStore::arc());
        assert!(matches!(builder.handlers("calendar_sync"), Err(QueueError::UnknownQueue(_))));
    }

    #[tokio::test]
    async fn workers_drive_every_queue_and_dead_letter_failures() {
        let rt = runtime();
        rt.enqueue("calendar_sync", NewJob::new("fetch_events", DedupKey::none()))
            .await
            .unwrap();
        rt.enqueue("summaries", NewJob::new("generate_summary", DedupKey::none()))
            .await
            .unwrap();

        let handle = rt.spawn_workers();
        let dlq = rt.dead_letters();
        for _ in 0..200 {
            let done = rt.stats("calendar_sync").await.unwrap().completed == 1;
            let dead = !dlq.list(&Default::default()).await.unwrap().is_empty();
            if done && dead {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.shutdown().await;
        assert_eq!(stats.len(), 2);

        assert_eq!(rt.stats("calendar_sync").await.unwrap().completed, 1);
        let dead = dlq.list(&Default::default()).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error_message.as_deref(), Some("model unavailable"));
        assert_eq!(dead[0].original_queue, name("summaries"));
    }

    #[tokio::test]
    async fn worker_handles_share_one_single_flight_guard() {
        let started = Arc::new(tokio::sync::Notify::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut builder = JobRuntime::builder(InMemoryJobStore::arc())
            .queue(QueueOptions::new(name("calendar_sync")));
        {
            let started = started.clone();
            let gate = gate.clone();
            builder
                .handlers("calendar_sync")
                .unwrap()
                .register_fn("fetch_events", move |_ctx, _p: JsonValue| {
                    let started = started.clone();
                    let gate = gate.clone();
                    async move {
                        started.notify_one();
                        gate.notified().await;
                        Ok(HandlerOutcome::done())
                    }
                });
        }
        let rt = builder.build();
        rt.enqueue("calendar_sync", NewJob::new("fetch_events", DedupKey::none()))
            .await
            .unwrap();

        let first = {
            let worker = rt.worker("calendar_sync").unwrap();
            tokio::spawn(async move { worker.tick().await })
        };
        started.notified().await;

        let second = rt.worker("calendar_sync").unwrap().tick().await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.leased, 0);

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap().completed, 1);
        assert_eq!(rt.worker("calendar_sync").unwrap().stats().skipped, 1);
        assert!(matches!(rt.worker("nope"), Err(QueueError::UnknownQueue(_))));
    }

    #[tokio::test]
    async fn queue_options_can_be_replaced_without_losing_handlers() {
        let mut builder = JobRuntime::builder(InMemoryJobStore::arc())
            .queue(QueueOptions::new(name("ai_jobs")));
        builder
            .handlers("ai_jobs")
            .unwrap()
            .register_fn("run_ai_job", |_ctx, _p: JsonValue| async { Ok(HandlerOutcome::done()) });

        let rt = builder
            .queue(QueueOptions::new(name("ai_jobs")).with_parallelism(4))
            .build();

        assert_eq!(rt.queue("ai_jobs").unwrap().options().parallelism, 4);
        rt.enqueue("ai_jobs", NewJob::new("run_ai_job", DedupKey::none())).await.unwrap();
        let report = rt.worker("ai_jobs").unwrap().tick().await.unwrap();
        assert_eq!(report.completed, 1);
    }
}
