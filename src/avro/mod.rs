//! The Avro protocol data model: [`Service`] and [`Message`].
//!
//! Parsing full Avro IDL documents and generating random values is treated
//! as an external concern (spec §1's "deliberately out of scope" list);
//! this module only compiles the small subset of a protocol document this
//! crate needs to drive the client/server engine.

pub mod message;
pub mod service;

pub use message::Message;
pub use service::{Service, ServiceOptions};
