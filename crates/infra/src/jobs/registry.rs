//! Typed job handlers and the per-queue registry that resolves them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use taskforge_core::{Job, JobId, QueueName};

/// What a handler sees besides its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub queue: QueueName,
    pub job_id: JobId,
    pub job_type: String,
    /// Failures recorded so far (0 on the first attempt)
    pub retry_count: u32,
    pub max_retries: u32,
    /// Watermark left by the previous run, if any
    pub cursor: Option<JsonValue>,
}

impl JobContext {
    pub fn for_job(job: &Job) -> Self {
        Self {
            queue: job.queue.clone(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            cursor: job.cursor.clone(),
        }
    }

    /// A failure now would exhaust the retry budget.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count.saturating_add(1) >= self.max_retries
    }
}

/// Successful handler result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    /// Replaces the job's cursor when set
    pub cursor: Option<JsonValue>,
    /// Carried into the completion notification
    pub summary: Option<String>,
}

impl HandlerOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_cursor(mut self, cursor: JsonValue) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Business logic for one kind of job.
///
/// Handlers may run more than once for the same job (a stale lease is
/// reclaimed while the original run is still going), so side effects must be
/// idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send;

    async fn handle(&self, ctx: JobContext, payload: Self::Payload) -> anyhow::Result<HandlerOutcome>;
}

/// Object-safe form of [`JobHandler`] taking the raw JSON payload.
#[async_trait]
pub trait DynJobHandler: Send + Sync {
    async fn call(&self, ctx: JobContext, payload: JsonValue) -> anyhow::Result<HandlerOutcome>;
}

struct Typed<H>(H);

#[async_trait]
impl<H: JobHandler> DynJobHandler for Typed<H> {
    async fn call(&self, ctx: JobContext, payload: JsonValue) -> anyhow::Result<HandlerOutcome> {
        let payload: H::Payload = serde_json::from_value(payload)
            .with_context(|| format!("invalid payload for job type '{}'", ctx.job_type))?;
        self.0.handle(ctx, payload).await
    }
}

struct FnHandler<F, P> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<F, P, Fut> DynJobHandler for FnHandler<F, P>
where
    F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
{
    async fn call(&self, ctx: JobContext, payload: JsonValue) -> anyhow::Result<HandlerOutcome> {
        let payload: P = serde_json::from_value(payload)
            .with_context(|| format!("invalid payload for job type '{}'", ctx.job_type))?;
        (self.f)(ctx, payload).await
    }
}

/// Handlers keyed by job type.
///
/// Keys are exact job types, `prefix.*` patterns, or the `*` wildcard.
/// Resolution tries them in that order; among matching patterns the longest
/// prefix wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynJobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler; a later registration for the same key wins.
    pub fn register<H: JobHandler>(&mut self, pattern: impl Into<String>, handler: H) -> &mut Self {
        self.handlers.insert(pattern.into(), Arc::new(Typed(handler)));
        self
    }

    /// Register an async closure. Use `serde_json::Value` as `P` to take the
    /// payload untyped.
    pub fn register_fn<P, F, Fut>(&mut self, pattern: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
        P: DeserializeOwned + Send + 'static,
        Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
    {
        self.handlers.insert(
            pattern.into(),
            Arc::new(FnHandler {
                f,
                _payload: PhantomData,
            }),
        );
        self
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn DynJobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        let by_prefix = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let matches = job_type
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
                matches.then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone());
        if by_prefix.is_some() {
            return by_prefix;
        }

        self.handlers.get("*").cloned()
    }

    pub fn patterns(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}
