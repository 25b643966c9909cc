//! The `publisher` module reads names from an input source and publishes one
//! persistent, mandatory message per name until told to stop.
//!
//! Input reading lives behind the `InputSource` trait so the loop never
//! blocks on a terminal directly.

pub mod input;
pub mod publisher;

pub use input::{Input, InputSource, PromptedInput};
pub use publisher::{PublishReport, Publisher, PublisherConfig};
