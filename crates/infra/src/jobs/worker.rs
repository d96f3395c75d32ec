//! Per-queue worker loop.
//!
//! Each tick: reclaim stale leases, lease a batch, run every job's handler on
//! its own task, record the outcomes, then sweep old rows. Ticks of one
//! worker never overlap; a tick that fires while the previous one is still
//! running is skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use taskforge_core::{JobId, QueueName};

use super::queue::{JobQueue, QueueError, Recorded};
use super::registry::{HandlerOutcome, HandlerRegistry, JobContext};
use super::store::JobStore;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub leased: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub reclaimed: usize,
    pub swept: u64,
    pub lease_lost: usize,
    /// The previous tick was still running; nothing was done
    pub skipped: bool,
}

impl TickReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record(&mut self, recorded: Recorded) {
        match recorded {
            Recorded::Completed => self.completed += 1,
            Recorded::Retrying { .. } => self.retried += 1,
            Recorded::Failed => self.failed += 1,
            Recorded::DeadLettered(_) => self.dead_lettered += 1,
            Recorded::LeaseLost => self.lease_lost += 1,
        }
    }
}

/// Worker counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub processed: u64,
    pub succeeded: u64,
    /// Handler failures, whether retried or terminal
    pub failed: u64,
    pub dead_lettered: u64,
    pub reclaimed: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    reclaimed: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn add(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(report.leased as u64, Ordering::Relaxed);
        self.succeeded.fetch_add(report.completed as u64, Ordering::Relaxed);
        self.failed.fetch_add(
            (report.retried + report.failed + report.dead_lettered) as u64,
            Ordering::Relaxed,
        );
        self.dead_lettered.fetch_add(report.dead_lettered as u64, Ordering::Relaxed);
        self.reclaimed.fetch_add(report.reclaimed as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Holds the single-flight flag for the duration of a tick.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one queue.
pub struct QueueWorker<S> {
    queue: JobQueue<S>,
    handlers: Arc<HandlerRegistry>,
    in_flight: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl<S> Clone for QueueWorker<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
            in_flight: self.in_flight.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<S> std::fmt::Debug for QueueWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("queue", &self.queue)
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl<S> QueueWorker<S>
where
    S: JobStore + 'static,
{
    pub fn new(queue: JobQueue<S>, handlers: impl Into<Arc<HandlerRegistry>>) -> Self {
        Self {
            queue,
            handlers: handlers.into(),
            in_flight: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// One pass against the wall clock. Outcomes are stamped with the time
    /// each handler finished.
    pub async fn tick(&self) -> Result<TickReport, QueueError> {
        self.run_tick(Utc::now(), &Utc::now).await
    }

    /// One pass with every timestamp pinned to `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, QueueError> {
        self.run_tick(now, &move || now).await
    }

    async fn run_tick(
        &self,
        now: DateTime<Utc>,
        clock: &(dyn Fn() -> DateTime<Utc> + Sync),
    ) -> Result<TickReport, QueueError> {
        let name = self.queue.name();
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!(queue = %name, "previous tick still running; skipping");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(TickReport::skipped());
        };

        let mut report = TickReport {
            reclaimed: self.queue.reclaim_stale(now).await?.len(),
            ..TickReport::default()
        };

        let jobs = self.queue.lease(now).await?;
        report.leased = jobs.len();

        let runs: Vec<(JobId, JoinHandle<Result<HandlerOutcome, String>>)> = jobs
            .into_iter()
            .map(|job| {
                let handler = self.handlers.resolve(&job.job_type);
                let ctx = JobContext::for_job(&job);
                let payload = job.payload;
                let task = tokio::spawn(async move {
                    match handler {
                        Some(handler) => handler.call(ctx, payload).await.map_err(|e| format!("{e:#}")),
                        None => Err(format!("no handler registered for job type '{}'", ctx.job_type)),
                    }
                });
                (job.id, task)
            })
            .collect();

        // Keep recording after a failed write; the first error is returned.
        let mut first_error = None;
        for (id, task) in runs {
            let result = match task.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err("handler panicked".to_string()),
                Err(e) => Err(format!("handler task failed: {e}")),
            };

            let recorded = match result {
                Ok(outcome) => self.queue.mark_completed(id, outcome, clock()).await,
                Err(message) => {
                    debug!(queue = %name, job_id = %id, error = %message, "handler failed");
                    self.queue.mark_failed(id, message, clock()).await
                }
            };

            match recorded {
                Ok(recorded) => report.record(recorded),
                Err(e) => {
                    error!(queue = %name, job_id = %id, error = %e, "failed to record job outcome");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            self.counters.add(&report);
            return Err(e);
        }

        if self.queue.options().sweep_each_tick {
            report.swept = self.queue.sweep(now).await?;
        }

        self.counters.add(&report);
        if report.leased > 0 || report.reclaimed > 0 {
            info!(
                queue = %name,
                leased = report.leased,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                reclaimed = report.reclaimed,
                lease_lost = report.lease_lost,
                "tick finished"
            );
        }

        Ok(report)
    }

    /// Run `tick` every `poll_interval` on the current tokio runtime.
    pub fn spawn(&self) -> WorkerHandle {
        let worker = self.clone();
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let name = self.queue.name().clone();
        let poll_interval = self.queue.options().poll_interval.max(MIN_POLL_INTERVAL);

        let join = tokio::spawn(async move {
            let name = worker.queue.name().clone();
            info!(queue = %name, poll_interval = ?poll_interval, "queue worker started");

            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = interval.tick() => {
                        if let Err(e) = worker.tick().await {
                            error!(queue = %name, error = %e, "worker tick failed");
                        }
                    }
                }
            }

            info!(queue = %name, "queue worker stopped");
        });

        WorkerHandle {
            queue: name,
            shutdown,
            join,
            counters: self.counters.clone(),
        }
    }
}

/// Handle to a spawned worker. Dropping it leaves the worker running.
#[derive(Debug)]
pub struct WorkerHandle {
    queue: QueueName,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl WorkerHandle {
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Stop after the in-flight tick (if any) and wait for the loop to exit.
    pub async fn shutdown(self) -> WorkerStats {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            error!(queue = %self.queue, error = %e, "queue worker task ended abnormally");
        }
        self.counters.snapshot()
    }
}
