//! # qrelay
//!
//! `qrelay` relays first names from an interactive producer to a consumer
//! through a durable broker queue. Every message is published persistent and
//! confirmed, and consumed with explicit acknowledgement, so a name survives
//! broker restarts and consumer crashes until it has been handled.
//!
//! ## Core Modules
//!
//! - `broker`: the broker seam plus two implementations, RabbitMQ (`amqp`)
//!   and an in-process engine used for tests and the loopback demo.
//! - `codec`: the JSON wire format of a `Message`.
//! - `config`: layered settings (defaults, files, environment).
//! - `connection`: connecting with exponential backoff and declaring the queue.
//! - `publisher`: reads names and publishes them until told to stop.
//! - `consumer`: drains the queue through a bounded pool of handlers.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod publisher;
pub mod utils;
