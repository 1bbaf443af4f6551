//! Publish/subscribe bus to the benchmarking boxes, devices and console.
//!
//! Topics are retained: a subscriber always sees the last value published,
//! however late it subscribes. Subscriptions are `tokio::sync::watch`
//! receivers so a trial task can `select!` on them next to its other inputs.

mod memory;

pub use memory::{MemoryBus, PublisherGuard};

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

/// Topic the devices node publishes its [`DevicesState`] on.
///
/// [`DevicesState`]: crate::messages::DevicesState
pub const DEVICES_STATE_TOPIC: &str = "/devices/state";

/// Topic announcing that a trial timed out.
pub const TIMEOUT_TOPIC: &str = "/timeout";

/// Topic a device change request is published on.
#[must_use]
pub fn device_set_topic(device: &str) -> String {
    format!("/devices/{device}/set")
}

/// Retained publish/subscribe bus.
pub trait Bus: Send + Sync + std::fmt::Debug {
    /// Publishes `message` on `topic`, replacing the retained value.
    fn publish(&self, topic: &str, message: Value);

    /// Subscribes to `topic`. The receiver holds `None` until something is
    /// published.
    fn subscribe(&self, topic: &str) -> watch::Receiver<Option<Value>>;

    /// Number of live publishers other than this process's own trials.
    fn publisher_count(&self, topic: &str) -> usize;

    /// Counts a bridged peer as a publisher on `topic` for the next `ttl`.
    /// Each call pushes the expiry out again.
    fn refresh_publisher(&self, topic: &str, ttl: Duration);
}

/// Serializes and publishes a typed message, logging serialization failures.
pub fn publish_typed<T: Serialize>(bus: &dyn Bus, topic: &str, message: &T) {
    match serde_json::to_value(message) {
        Ok(value) => bus.publish(topic, value),
        Err(error) => tracing::error!(%error, topic, "cannot serialize bus message"),
    }
}
