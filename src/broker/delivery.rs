use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::utils::error::TransportError;

/// Opaque per-delivery identifier used to settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settles one delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledges this delivery only (never cumulative).
    async fn ack(&self) -> Result<(), TransportError>;

    /// Rejects this delivery; with `requeue` the broker offers it again.
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// One message instance in flight to one consumer.
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// Set when the broker has offered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        tag: DeliveryTag,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag,
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Deliveries for one subscription, in the order the broker offers them.
/// The stream ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;
