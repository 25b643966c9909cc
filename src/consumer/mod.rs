//! The `consumer` module drains the queue.
//!
//! Deliveries are handed to a bounded pool of handler tasks as they arrive.
//! Each task decodes, runs the `MessageHandler`, and settles its delivery
//! (ack, requeue or reject) before finishing, so nothing is left pending.
//! A periodic tick re-declares the queue as a liveness check; it never gates
//! processing.

pub mod consumer;
pub mod handler;

pub use consumer::{ConsumeReport, ConsumerConfig, ConsumerLoop};
pub use handler::{HandlerError, MessageHandler, Outcome, PrintHandler, process_delivery};
