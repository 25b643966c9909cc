//! The `codec` module turns a `Message` into the bytes published to the
//! queue and back.
//!
//! The wire format is a UTF-8 JSON object with camelCase field names,
//! `{"firstName": "...", "timestamp": "<RFC 3339>"}`. Unknown fields are
//! ignored on decode so producers can add fields without breaking consumers.

pub mod message;

pub use message::{Message, decode, encode};
