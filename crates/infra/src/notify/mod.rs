//! Job outcome notifiers.
//!
//! A notifier is told about every terminal outcome after it has been written
//! to the store. Delivery is fire-and-forget: `notify` cannot fail from the
//! caller's point of view, and implementations log what they drop.

use std::sync::Arc;

use taskforge_events::{EventBus, JobNotification};

use crate::config::EngineConfig;

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisNotifyError, RedisPubSubBus, RedisPubSubNotifier};

/// Sink for job outcome notifications.
pub trait JobNotifier: Send + Sync {
    fn notify(&self, notification: JobNotification);
}

impl<N> JobNotifier for Arc<N>
where
    N: JobNotifier + ?Sized,
{
    fn notify(&self, notification: JobNotification) {
        (**self).notify(notification)
    }
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl JobNotifier for NoopNotifier {
    fn notify(&self, _notification: JobNotification) {}
}

/// Publishes notifications on an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusNotifier<B> {
    bus: B,
}

impl<B> BusNotifier<B>
where
    B: EventBus<JobNotification>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> JobNotifier for BusNotifier<B>
where
    B: EventBus<JobNotification>,
{
    fn notify(&self, notification: JobNotification) {
        let job_id = notification.job_id;
        let queue = notification.queue.clone();
        if let Err(e) = self.bus.publish(notification) {
            tracing::warn!(queue = %queue, job_id = %job_id, error = %e, "failed to publish job notification");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifierConfigError {
    #[cfg(not(feature = "redis"))]
    #[error("a notification Redis URL is configured but this build lacks the `redis` feature")]
    RedisUnavailable,
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] RedisNotifyError),
}

/// Redis pub/sub when `notify_redis_url` is set, otherwise [`NoopNotifier`].
pub fn from_config(config: &EngineConfig) -> Result<Arc<dyn JobNotifier>, NotifierConfigError> {
    match config.notify_redis_url.as_deref() {
        Some(url) => redis_notifier(url, &config.notify_channel),
        None => Ok(Arc::new(NoopNotifier)),
    }
}

#[cfg(feature = "redis")]
fn redis_notifier(url: &str, channel: &str) -> Result<Arc<dyn JobNotifier>, NotifierConfigError> {
    let notifier = RedisPubSubNotifier::connect(url, channel)?;
    tracing::info!(channel, "job notifications published to redis");
    Ok(Arc::new(notifier))
}

#[cfg(not(feature = "redis"))]
fn redis_notifier(_url: &str, _channel: &str) -> Result<Arc<dyn JobNotifier>, NotifierConfigError> {
    Err(NotifierConfigError::RedisUnavailable)
}
