//! The `connection` module owns the path from "nothing" to a usable session:
//! connecting with bounded exponential backoff and declaring the queue.

pub mod backoff;
pub mod manager;

pub use backoff::{Backoff, BackoffState, RetryPolicy, backoff_delay};
pub use manager::{ConnectionManager, Session, SessionState, declare};
