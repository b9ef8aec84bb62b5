//! Error taxonomy for the Avro RPC runtime.
//!
//! Every error a caller can observe maps onto one variant of [`RpcError`],
//! matching the kinds enumerated in the runtime's design: transport,
//! handshake, codec, application, system, middleware, and tracing errors.
//! Keeping them as one small `thiserror` enum (rather than one error type
//! per module) mirrors how this codebase's wire-protocol layer reports
//! failures: a handful of focused variants, each with enough context to
//! act on without downcasting.

use apache_avro::types::Value;
use thiserror::Error;

/// Errors surfaced by the client/server engine, middleware pipeline, and
/// proxy.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Socket, connect, or EOF failure. Aborts every in-flight call on the
    /// affected channel.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Handshake failed: protocol mismatch, bad hash, or malformed
    /// preamble. The channel cannot proceed.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// An Avro encode or decode failure. Fails only the offending call.
    #[error("codec error: {0}")]
    Codec(String),

    /// An application error declared in a message's `errorType` union.
    #[error("application error")]
    Application(Value),

    /// A handler panicked, threw, or returned an undeclared error. With
    /// `strictErrors` this is the only shape a server reports for
    /// anything not in the declared error union.
    #[error("system error: {0}")]
    System(String),

    /// `next(err, ...)` was called in the forward phase, or a middleware
    /// promise rejected, and no later reverse frame swallowed it.
    #[error("middleware error: {0}")]
    Middleware(String),

    /// A trace-propagation failure: missing, duplicate, or undecodable
    /// trace header.
    #[error("tracing error: {0}")]
    Tracing(#[from] TracingError),

    /// No channel was available for the requested scope and buffering was
    /// not enabled.
    #[error("no available channel for scope {0:?}")]
    NoAvailableChannel(String),

    /// A per-call timeout elapsed before the response frame arrived.
    #[error("call timed out")]
    Timeout,

    /// The channel was destroyed while the call was still in flight.
    #[error("channel closed")]
    ChannelClosed,
}

/// Trace-propagation failures (spec §4.H, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TracingError {
    /// `locals[traceKey]` was unset and `createMissingOutgoing` was not
    /// configured.
    #[error("missing outgoing trace")]
    MissingOutgoing,

    /// The response carried no trace header and `ignoreMissingIncoming`
    /// was not configured.
    #[error("missing incoming trace")]
    MissingIncoming,

    /// A request arrived with both an inbound trace header and an
    /// already-populated `locals[traceKey]`.
    #[error("duplicate trace")]
    Duplicate,

    /// The trace header's bytes did not decode as a `Trace` record.
    #[error("trace decode error: {0}")]
    Decode(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
