//! Job notifications and the pub/sub mechanics that carry them.
//!
//! Notifications are a side-channel: listeners learn that a job finished, but
//! job state never depends on whether a notification was delivered.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notification::{JobNotification, NotificationStatus};
