use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::broker::Delivery;
use crate::codec::{Message, decode};
use crate::utils::error::TransportError;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Side effect applied to every decoded message.
///
/// Invocations may run concurrently with each other.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

/// Prints each message to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintHandler;

impl PrintHandler {
    /// The line printed for `message`.
    pub fn line(message: &Message) -> String {
        format!("Received: {message}")
    }
}

#[async_trait]
impl MessageHandler for PrintHandler {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        println!("{}", Self::line(&message));
        Ok(())
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    /// Undecodable; rejected without requeue.
    Dropped,
    /// Handler failed on first delivery; requeued for one more try.
    Requeued,
    /// Handler failed on a redelivery; rejected without requeue.
    Rejected,
    /// Settling failed (usually a lost channel); the broker will redeliver.
    Unsettled,
}

/// Decodes, handles and settles one delivery.
///
/// A malformed body is dropped since redelivering it can never succeed. A
/// handler failure is requeued once and rejected if it fails again.
pub async fn process_delivery(delivery: Delivery, handler: &dyn MessageHandler) -> Outcome {
    let tag = delivery.tag;

    let message = match decode(&delivery.body) {
        Ok(message) => message,
        Err(err) => {
            warn!(%tag, error = %err, "Failed to decode delivery, dropping it");
            return settle(&delivery, delivery.reject(false).await, Outcome::Dropped);
        }
    };

    let first_name = message.first_name.clone();
    // A panic counts as a handler failure so the delivery is still settled.
    let handled = AssertUnwindSafe(handler.handle(message))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_message(panic).into()));

    match handled {
        Ok(()) => {
            info!(%tag, %first_name, "Message handled");
            settle(&delivery, delivery.ack().await, Outcome::Acknowledged)
        }
        Err(err) if !delivery.redelivered => {
            warn!(%tag, %first_name, error = %err, "Handler failed, requeueing once");
            settle(&delivery, delivery.reject(true).await, Outcome::Requeued)
        }
        Err(err) => {
            error!(%tag, %first_name, error = %err, "Handler failed on redelivery, rejecting");
            settle(&delivery, delivery.reject(false).await, Outcome::Rejected)
        }
    }
}

fn settle(
    delivery: &Delivery,
    result: Result<(), TransportError>,
    outcome: Outcome,
) -> Outcome {
    match result {
        Ok(()) => {
            debug!(tag = %delivery.tag, ?outcome, "Delivery settled");
            outcome
        }
        Err(err) => {
            warn!(tag = %delivery.tag, error = %err, "Failed to settle delivery");
            Outcome::Unsettled
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("handler panicked: {detail}")
}
