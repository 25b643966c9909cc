//! Broker seam
//!
//! The relay only needs five things from a message broker: connect, declare
//! a queue, publish with flags, subscribe, and settle a delivery by tag.
//! `Connector`, `Channel` and `Acknowledger` capture exactly that so the
//! publisher and consumer loops never see a client library directly.
//!
//! - `amqp`: RabbitMQ over AMQP 0-9-1 (`lapin`), with publisher confirms.
//! - `engine`: an in-process broker with the same queue semantics, used by
//!   the tests and by the `loopback` command.

pub mod amqp;
pub mod delivery;
pub mod engine;
pub mod queue;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::utils::error::TransportError;

pub use amqp::AmqpConnector;
pub use delivery::{Acknowledger, Delivery, DeliveryStream, DeliveryTag};
pub use engine::MemoryBroker;
pub use queue::{QueueInfo, QueueSpec};

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}{}", self.username, self.host, self.port, self.vhost)
    }
}

/// Flags applied to a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishFlags {
    /// Ask the broker to write the message to disk before confirming it.
    pub persistent: bool,
    /// Fail the publish instead of dropping the message when no queue matches.
    pub mandatory: bool,
}

impl PublishFlags {
    pub const RELIABLE: Self = Self {
        persistent: true,
        mandatory: true,
    };
}

/// A live channel to the broker. One per session.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares `spec`. Identical re-declarations are no-ops.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, TransportError>;

    /// Publishes `body` to `queue` through the default exchange and waits for
    /// the broker to confirm it.
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        flags: PublishFlags,
    ) -> Result<(), TransportError>;

    /// Limits the number of unacknowledged deliveries handed to consumers
    /// opened afterwards on this channel. `0` means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Subscribes to `queue` with manual acknowledgement.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens channels. Implementations make a single attempt; retrying is the
/// connection manager's job.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Channel>, TransportError>;
}

#[cfg(test)]
mod tests;
