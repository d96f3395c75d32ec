//! Redis pub/sub notification channel (optional).
//!
//! Redis pub/sub is not durable: subscribers that are offline miss messages.
//! That is acceptable here because notifications only announce what the job
//! tables already record.

use std::sync::{Arc, mpsc};
use std::thread;

use redis::Commands;
use thiserror::Error;

use taskforge_events::{EventBus, JobNotification, Subscription};

use super::JobNotifier;

#[derive(Debug, Error)]
pub enum RedisNotifyError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus carrying JSON-encoded [`JobNotification`]s.
#[derive(Debug, Clone)]
pub struct RedisPubSubBus {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubBus {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisNotifyError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisNotifyError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<JobNotification> for RedisPubSubBus {
    type Error = RedisNotifyError;

    fn publish(&self, message: JobNotification) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisNotifyError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisNotifyError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisNotifyError::Redis(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<JobNotification> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "redis notification subscriber could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.subscribe(&channel) {
                tracing::warn!(channel = %channel, error = %e, "redis notification subscribe failed");
                return;
            }

            loop {
                let Ok(msg) = pubsub.get_message() else {
                    return;
                };

                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };

                match serde_json::from_str::<JobNotification>(&payload) {
                    Ok(notification) => {
                        if tx.send(notification).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping malformed job notification");
                    }
                }
            }
        });

        Subscription::new(rx)
    }
}

/// Notifier publishing to Redis off the async executor.
///
/// `publish` opens a blocking connection, so inside a tokio runtime it is
/// moved onto the blocking pool; the job path never waits for Redis.
#[derive(Debug, Clone)]
pub struct RedisPubSubNotifier {
    bus: Arc<RedisPubSubBus>,
}

impl RedisPubSubNotifier {
    pub fn new(bus: RedisPubSubBus) -> Self {
        Self { bus: Arc::new(bus) }
    }

    pub fn connect(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisNotifyError> {
        Ok(Self::new(RedisPubSubBus::new(redis_url, channel)?))
    }

    pub fn bus(&self) -> &RedisPubSubBus {
        &self.bus
    }
}

fn publish_logged(bus: &RedisPubSubBus, notification: JobNotification) {
    let job_id = notification.job_id;
    if let Err(e) = bus.publish(notification) {
        tracing::warn!(job_id = %job_id, channel = %bus.channel, error = %e, "failed to publish job notification");
    }
}

impl JobNotifier for RedisPubSubNotifier {
    fn notify(&self, notification: JobNotification) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.bus.clone();
                handle.spawn_blocking(move || publish_logged(&bus, notification));
            }
            Err(_) => publish_logged(&self.bus, notification),
        }
    }
}
