//! Avro RPC client/server runtime: a negotiated-channel transport layer,
//! a bidirectional middleware pipeline, distributed call tracing, and a
//! multi-tenant HTTP proxy fronting them.
//!
//! The protocol itself (handshake negotiation, frame sequences, message
//! dispatch) is Apache Avro's RPC wire format; this crate supplies the
//! Rust-side runtime around it — channels, middleware, tracing, and the
//! proxy — rather than an Avro IDL compiler or schema registry.

#![cfg_attr(test, expect(clippy::unwrap_used, reason = "test code can panic"))]
#![cfg_attr(test, expect(clippy::expect_used, reason = "test code can panic"))]
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "test code with known bounds")
)]

pub mod avro;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod middleware;
pub mod proxy;
pub mod server;
pub mod tracing_mw;
pub mod transport;

pub use avro::{Message, Service, ServiceOptions};
pub use channel::{Channel, ChannelState};
pub use client::{CallOptions, Client};
pub use config::{AppConfig, Cli};
pub use context::{CallContext, Side};
pub use error::{Result, RpcError};
pub use middleware::{Middleware, Outcome, Pipeline, ReverseHandler, WrappedRequest, WrappedResponse};
pub use proxy::Proxy;
pub use server::{Handler, Server};
pub use tracing_mw::{Call, CallState, ClientTracing, ServerTracing, Trace, TraceHandle, TracingConfig};
