//! Distributed call tracing: the recursive [`Trace`] record and the
//! client-side/server-side middleware that attaches, propagates, and
//! stitches it across a call graph (spec §3, §4.H).
//!
//! `Trace`/`Call` map the spec's recursive Avro record onto a plain
//! Rust tree (`Vec<Call>` already gives the heap indirection a
//! self-referential type needs; no `Box` required). A `Trace` is shared
//! across every `CallContext` that contributes to the same call graph —
//! a server handler that itself makes downstream calls passes its own
//! `TraceHandle` as the nested call's `trace` option so the client-side
//! middleware appends into the *same* tree rather than starting a new
//! one — so it is held behind `Arc<tokio::sync::Mutex<_>>` rather than
//! passed by value, the same sharing shape
//! `examples/leynos-mxd/src/wireframe/connection.rs` uses for
//! `HandshakeMetadata` shared between the accept task and later
//! middleware frames.

use std::sync::Arc;

use apache_avro::{Schema, from_avro_datum, to_avro_datum, types::Value};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    channel::Headers,
    context::CallContext,
    error::{Result, RpcError, TracingError},
    middleware::{Middleware, ReverseHandler, WrappedRequest, WrappedResponse},
};

/// Key a [`Trace`] is looked up under in [`CallContext::locals`] and,
/// serialized, in request/response headers, unless a [`TracingConfig`]
/// overrides it.
pub const DEFAULT_TRACE_KEY: &str = "trace";

/// A call's outcome, as tracked by its [`Call`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// The call has been emitted but no response has arrived yet.
    Pending,
    /// The call (or one of its descendants) failed.
    Error,
    /// The call and every descendant succeeded.
    Success,
    /// The call was `oneWay`; no response is ever expected.
    OneWay,
}

/// One call node in a [`Trace`] tree.
#[derive(Debug, Clone)]
pub struct Call {
    /// Current outcome.
    pub state: CallState,
    /// The message name this call targeted.
    pub name: String,
    /// When the request was emitted.
    pub request_time: DateTime<Utc>,
    /// When the response arrived; `None` iff `state` is `Pending` (or,
    /// before dispatch completes, `OneWay`).
    pub response_time: Option<DateTime<Utc>>,
    /// Calls made by the handler of this call, in completion order.
    pub downstream_calls: Vec<Call>,
}

/// The recursive trace record propagated in message headers (spec §3).
#[derive(Debug, Clone)]
pub struct Trace {
    /// Identifies the call graph this trace belongs to.
    pub uuid: Uuid,
    /// Top-level calls made by the caller holding this trace.
    pub calls: Vec<Call>,
}

impl Trace {
    /// Build a fresh trace with a random uuid and no calls yet.
    #[must_use]
    pub fn new_random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            calls: Vec::new(),
        }
    }

    /// The wire form sent outbound on a request: only the uuid survives
    /// (spec §3: "A Trace traveling on the wire request carries only its
    /// `uuid` and an empty `calls` array").
    #[must_use]
    pub fn outbound_stub(&self) -> Self {
        Self {
            uuid: self.uuid,
            calls: Vec::new(),
        }
    }
}

/// A [`Trace`] shared between every [`CallContext`] contributing to one
/// call graph.
pub type TraceHandle = Arc<Mutex<Trace>>;

/// Tunables for [`client_tracing_middleware`] and
/// [`server_tracing_middleware`] (spec §4.H).
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Header (and `CallContext::locals`) key the trace travels under.
    pub trace_key: String,
    /// Client side: create a fresh trace when none was supplied via call
    /// options, instead of failing with `missing outgoing trace`.
    pub create_missing_outgoing: bool,
    /// Client side: proceed with empty downstream calls when a response
    /// carries no trace header, instead of failing with `missing
    /// incoming trace`.
    pub ignore_missing_incoming: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            trace_key: DEFAULT_TRACE_KEY.to_owned(),
            create_missing_outgoing: false,
            ignore_missing_incoming: false,
        }
    }
}

fn call_schema() -> Schema {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "Call",
            "fields": [
                {"name": "state", "type": {"type": "enum", "name": "CallState", "symbols": ["PENDING", "ERROR", "SUCCESS", "ONE_WAY"]}},
                {"name": "name", "type": "string"},
                {"name": "requestTime", "type": {"type": "long", "logicalType": "timestamp-millis"}},
                {"name": "responseTime", "type": ["null", {"type": "long", "logicalType": "timestamp-millis"}], "default": null},
                {"name": "downstreamCalls", "type": {"type": "array", "items": "Call"}, "default": []}
            ]
        }"#,
    )
    .unwrap_or(Schema::Null)
}

fn trace_schema() -> Schema {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "Trace",
            "fields": [
                {"name": "uuid", "type": {"type": "fixed", "name": "TraceUuid", "size": 16}},
                {"name": "calls", "type": {"type": "array", "items": {
                    "type": "record",
                    "name": "Call",
                    "fields": [
                        {"name": "state", "type": {"type": "enum", "name": "CallState", "symbols": ["PENDING", "ERROR", "SUCCESS", "ONE_WAY"]}},
                        {"name": "name", "type": "string"},
                        {"name": "requestTime", "type": {"type": "long", "logicalType": "timestamp-millis"}},
                        {"name": "responseTime", "type": ["null", {"type": "long", "logicalType": "timestamp-millis"}], "default": null},
                        {"name": "downstreamCalls", "type": {"type": "array", "items": "Call"}, "default": []}
                    ]
                }}, "default": []}
            ]
        }"#,
    )
    .unwrap_or(Schema::Null)
}

fn state_to_symbol(state: CallState) -> (i32, &'static str) {
    match state {
        CallState::Pending => (0, "PENDING"),
        CallState::Error => (1, "ERROR"),
        CallState::Success => (2, "SUCCESS"),
        CallState::OneWay => (3, "ONE_WAY"),
    }
}

fn symbol_to_state(symbol: &str) -> Result<CallState> {
    match symbol {
        "PENDING" => Ok(CallState::Pending),
        "ERROR" => Ok(CallState::Error),
        "SUCCESS" => Ok(CallState::Success),
        "ONE_WAY" => Ok(CallState::OneWay),
        other => Err(RpcError::Tracing(TracingError::Decode(format!("unknown call state {other}")))),
    }
}

fn timestamp_to_millis(ts: DateTime<Utc>) -> i64 { ts.timestamp_millis() }

fn millis_to_timestamp(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| RpcError::Tracing(TracingError::Decode("invalid timestamp".to_owned())))
}

fn call_to_value(call: &Call) -> Value {
    let (index, symbol) = state_to_symbol(call.state);
    Value::Record(vec![
        ("state".to_owned(), Value::Enum(index, symbol.to_owned())),
        ("name".to_owned(), Value::String(call.name.clone())),
        (
            "requestTime".to_owned(),
            Value::TimestampMillis(timestamp_to_millis(call.request_time)),
        ),
        (
            "responseTime".to_owned(),
            match call.response_time {
                Some(ts) => Value::Union(1, Box::new(Value::TimestampMillis(timestamp_to_millis(ts)))),
                None => Value::Union(0, Box::new(Value::Null)),
            },
        ),
        (
            "downstreamCalls".to_owned(),
            Value::Array(call.downstream_calls.iter().map(call_to_value).collect()),
        ),
    ])
}

fn value_to_call(value: &Value) -> Result<Call> {
    let Value::Record(fields) = value else {
        return Err(RpcError::Tracing(TracingError::Decode("call must be a record".to_owned())));
    };
    let mut state = None;
    let mut name = None;
    let mut request_time = None;
    let mut response_time = None;
    let mut downstream_calls = Vec::new();
    for (field_name, v) in fields {
        match field_name.as_str() {
            "state" => {
                let Value::Enum(_, symbol) = v else {
                    return Err(RpcError::Tracing(TracingError::Decode("state must be an enum".to_owned())));
                };
                state = Some(symbol_to_state(symbol)?);
            }
            "name" => {
                let Value::String(s) = v else {
                    return Err(RpcError::Tracing(TracingError::Decode("name must be a string".to_owned())));
                };
                name = Some(s.clone());
            }
            "requestTime" => request_time = Some(value_to_timestamp(v)?),
            "responseTime" => {
                response_time = match v {
                    Value::Union(_, inner) => match inner.as_ref() {
                        Value::Null => None,
                        other => Some(value_to_timestamp(other)?),
                    },
                    other => Some(value_to_timestamp(other)?),
                };
            }
            "downstreamCalls" => {
                let Value::Array(items) = v else {
                    return Err(RpcError::Tracing(TracingError::Decode(
                        "downstreamCalls must be an array".to_owned(),
                    )));
                };
                downstream_calls = items.iter().map(value_to_call).collect::<Result<Vec<_>>>()?;
            }
            _ => {}
        }
    }
    Ok(Call {
        state: state.ok_or_else(|| RpcError::Tracing(TracingError::Decode("missing state".to_owned())))?,
        name: name.ok_or_else(|| RpcError::Tracing(TracingError::Decode("missing name".to_owned())))?,
        request_time: request_time
            .ok_or_else(|| RpcError::Tracing(TracingError::Decode("missing requestTime".to_owned())))?,
        response_time,
        downstream_calls,
    })
}

fn value_to_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::TimestampMillis(millis) => millis_to_timestamp(*millis),
        Value::Long(millis) => millis_to_timestamp(*millis),
        _ => Err(RpcError::Tracing(TracingError::Decode("expected a timestamp".to_owned()))),
    }
}

impl Trace {
    /// Encode this trace to its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Tracing`] on an internal encode failure.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let value = Value::Record(vec![
            ("uuid".to_owned(), Value::Fixed(16, self.uuid.as_bytes().to_vec())),
            ("calls".to_owned(), Value::Array(self.calls.iter().map(call_to_value).collect())),
        ]);
        to_avro_datum(&trace_schema(), value)
            .map_err(|e| RpcError::Tracing(TracingError::Decode(e.to_string())))
    }

    /// Decode a trace from its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Tracing`] if `bytes` does not decode as a
    /// valid trace.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let value = from_avro_datum(&trace_schema(), &mut reader, None)
            .map_err(|e| RpcError::Tracing(TracingError::Decode(e.to_string())))?;
        let Value::Record(fields) = value else {
            return Err(RpcError::Tracing(TracingError::Decode("trace must be a record".to_owned())));
        };
        let mut uuid = None;
        let mut calls = Vec::new();
        for (name, v) in fields {
            match name.as_str() {
                "uuid" => {
                    let Value::Fixed(16, bytes) = &v else {
                        return Err(RpcError::Tracing(TracingError::Decode("uuid must be fixed[16]".to_owned())));
                    };
                    uuid = Some(Uuid::from_slice(bytes).map_err(|e| RpcError::Tracing(TracingError::Decode(e.to_string())))?);
                }
                "calls" => {
                    let Value::Array(items) = &v else {
                        return Err(RpcError::Tracing(TracingError::Decode("calls must be an array".to_owned())));
                    };
                    calls = items.iter().map(value_to_call).collect::<Result<Vec<_>>>()?;
                }
                _ => {}
            }
        }
        Ok(Self {
            uuid: uuid.ok_or_else(|| RpcError::Tracing(TracingError::Decode("missing uuid".to_owned())))?,
            calls,
        })
    }
}

fn read_header(headers: &Headers, key: &str) -> Option<Vec<u8>> { headers.get(key).cloned() }

fn write_header(headers: &mut Headers, key: &str, value: Vec<u8>) { headers.insert(key.to_owned(), value); }

/// Client-side reverse hook: records the response time and the
/// downstream call subtree on the matching [`Call`] entry.
struct ClientReverse {
    config: TracingConfig,
    handle: TraceHandle,
    call_index: usize,
}

#[async_trait]
impl ReverseHandler for ClientReverse {
    async fn reverse(
        &self,
        _ctx: &mut CallContext,
        res: &mut WrappedResponse,
        err: Option<RpcError>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut result_err = err;

        let incoming = match read_header(&res.headers, &self.config.trace_key) {
            Some(buf) => match Trace::decode(&buf) {
                Ok(trace) => Some(trace),
                Err(e) => {
                    result_err.get_or_insert(e);
                    None
                }
            },
            None if self.config.ignore_missing_incoming => None,
            None => {
                result_err.get_or_insert(RpcError::Tracing(TracingError::MissingIncoming));
                None
            }
        };

        let failed = result_err.is_some() || res.is_error();
        let mut trace = self.handle.lock().await;
        if let Some(call) = trace.calls.get_mut(self.call_index) {
            call.response_time = Some(now);
            call.state = if failed { CallState::Error } else { CallState::Success };
            if let Some(incoming) = incoming {
                call.downstream_calls = incoming.calls;
            }
        }
        drop(trace);

        result_err.map_or(Ok(()), Err)
    }
}

/// Client-side tracing middleware (spec §4.H "Client side").
pub struct ClientTracing {
    config: TracingConfig,
}

impl ClientTracing {
    /// Build the client-side tracing middleware with `config`.
    #[must_use]
    pub const fn new(config: TracingConfig) -> Self { Self { config } }
}

#[async_trait]
impl Middleware for ClientTracing {
    async fn forward(
        &self,
        ctx: &mut CallContext,
        req: &mut WrappedRequest,
    ) -> Result<Option<Arc<dyn ReverseHandler>>> {
        let handle = match ctx.local::<TraceHandle>(&self.config.trace_key) {
            Some(handle) => Arc::clone(handle),
            None if self.config.create_missing_outgoing => {
                let handle: TraceHandle = Arc::new(Mutex::new(Trace::new_random()));
                ctx.set_local(self.config.trace_key.clone(), handle.clone());
                handle
            }
            None => return Err(RpcError::Tracing(TracingError::MissingOutgoing)),
        };

        let message = ctx.message().clone();
        let one_way = message.one_way();
        let call_index;
        let stub;
        {
            let mut trace = handle.lock().await;
            trace.calls.push(Call {
                state: if one_way { CallState::OneWay } else { CallState::Pending },
                name: message.name().to_owned(),
                request_time: Utc::now(),
                response_time: None,
                downstream_calls: Vec::new(),
            });
            call_index = trace.calls.len() - 1;
            stub = trace.outbound_stub();
        }

        write_header(&mut req.headers, &self.config.trace_key, stub.encode()?);

        if one_way {
            return Ok(None);
        }
        Ok(Some(Arc::new(ClientReverse {
            config: self.config.clone(),
            handle,
            call_index,
        })))
    }
}

/// Server-side reverse hook: writes the full accumulated subtree back
/// onto the response headers.
struct ServerReverse {
    config: TracingConfig,
    handle: TraceHandle,
}

#[async_trait]
impl ReverseHandler for ServerReverse {
    async fn reverse(&self, _ctx: &mut CallContext, res: &mut WrappedResponse, err: Option<RpcError>) -> Result<()> {
        let trace = self.handle.lock().await.clone();
        match trace.encode() {
            Ok(bytes) => write_header(&mut res.headers, &self.config.trace_key, bytes),
            Err(e) => debug!(error = %e, "failed to encode outgoing trace header"),
        }
        err.map_or(Ok(()), Err)
    }
}

/// Server-side tracing middleware (spec §4.H "Server side").
pub struct ServerTracing {
    config: TracingConfig,
}

impl ServerTracing {
    /// Build the server-side tracing middleware with `config`.
    #[must_use]
    pub const fn new(config: TracingConfig) -> Self { Self { config } }
}

#[async_trait]
impl Middleware for ServerTracing {
    async fn forward(
        &self,
        ctx: &mut CallContext,
        req: &mut WrappedRequest,
    ) -> Result<Option<Arc<dyn ReverseHandler>>> {
        let incoming_bytes = read_header(&req.headers, &self.config.trace_key);
        let already_set = ctx.local::<TraceHandle>(&self.config.trace_key).is_some();

        let handle = match (incoming_bytes, already_set) {
            (Some(_), true) => return Err(RpcError::Tracing(TracingError::Duplicate)),
            (Some(bytes), false) => {
                let trace = Trace::decode(&bytes)?;
                let handle: TraceHandle = Arc::new(Mutex::new(trace));
                ctx.set_local(self.config.trace_key.clone(), handle.clone());
                handle
            }
            (None, true) => ctx
                .local::<TraceHandle>(&self.config.trace_key)
                .map(Arc::clone)
                .unwrap_or_else(|| Arc::new(Mutex::new(Trace::new_random()))),
            (None, false) => {
                let handle: TraceHandle = Arc::new(Mutex::new(Trace::new_random()));
                ctx.set_local(self.config.trace_key.clone(), handle.clone());
                handle
            }
        };

        Ok(Some(Arc::new(ServerReverse {
            config: self.config.clone(),
            handle,
        })))
    }
}

#[cfg(test)]
mod tests {
    use apache_avro::Schema as AvroSchema;

    use super::*;
    use crate::{
        avro::Message,
        channel::Channel,
        context::Side,
        transport::{StatefulTransport, Transport, memory::memory_pair},
    };

    fn dummy_ctx(name: &str) -> CallContext {
        let (transport, _peer): (StatefulTransport, StatefulTransport) = memory_pair();
        let message = Message::new(name.to_owned(), false, AvroSchema::Int, AvroSchema::Int, AvroSchema::String);
        let channel = Channel::open_client(Transport::Stateful(transport), "", true);
        CallContext::new(Side::Client, message, channel)
    }

    #[test]
    fn trace_round_trips_through_avro() {
        let mut trace = Trace::new_random();
        trace.calls.push(Call {
            state: CallState::Success,
            name: "neg".to_owned(),
            request_time: Utc::now(),
            response_time: Some(Utc::now()),
            downstream_calls: Vec::new(),
        });
        let bytes = trace.encode().expect("encode");
        let decoded = Trace::decode(&bytes).expect("decode");
        assert_eq!(decoded.uuid, trace.uuid);
        assert_eq!(decoded.calls.len(), 1);
        assert_eq!(decoded.calls[0].name, "neg");
        assert_eq!(decoded.calls[0].state, CallState::Success);
    }

    #[tokio::test]
    async fn client_forward_fails_without_a_trace_by_default() {
        let mw = ClientTracing::new(TracingConfig::default());
        let mut ctx = dummy_ctx("neg");
        let mut req = WrappedRequest::new(Value::Int(1));
        let err = mw.forward(&mut ctx, &mut req).await.expect_err("should fail");
        assert!(matches!(err, RpcError::Tracing(TracingError::MissingOutgoing)));
    }

    #[tokio::test]
    async fn client_forward_creates_a_trace_when_configured() {
        let mw = ClientTracing::new(TracingConfig {
            create_missing_outgoing: true,
            ..TracingConfig::default()
        });
        let mut ctx = dummy_ctx("neg");
        let mut req = WrappedRequest::new(Value::Int(1));
        let hook = mw.forward(&mut ctx, &mut req).await.expect("forward succeeds");
        assert!(hook.is_some());
        assert!(req.headers.contains_key(DEFAULT_TRACE_KEY));
    }

    #[tokio::test]
    async fn server_forward_rejects_a_duplicate_trace() {
        let mw = ServerTracing::new(TracingConfig::default());
        let mut ctx = dummy_ctx("neg");
        let handle: TraceHandle = Arc::new(Mutex::new(Trace::new_random()));
        ctx.set_local(DEFAULT_TRACE_KEY, handle);

        let stub = Trace::new_random().outbound_stub();
        let mut req = WrappedRequest::new(Value::Int(1));
        req.headers.insert(DEFAULT_TRACE_KEY.to_owned(), stub.encode().expect("encode"));

        let err = mw.forward(&mut ctx, &mut req).await.expect_err("should fail");
        assert!(matches!(err, RpcError::Tracing(TracingError::Duplicate)));
    }
}
