//! Negotiated sessions over one transport for one (client, server) pair at
//! a given scope.
//!
//! A `Channel` owns its transport exclusively (spec §5: "nobody else may
//! write to or read from it") and serializes its own send/receive,
//! handshake, and id assignment. This mirrors how this codebase's
//! connection-scoped state is owned by exactly one Tokio task
//! (`wireframe/connection.rs`'s thread/task-local handshake metadata)
//! rather than shared behind one big lock.
//!
//! # Wire envelope
//!
//! Spec §4.B treats Avro RPC framing as "assumed provided" and only
//! specifies the handshake's *content*, not the exact buffer layout a
//! request/response frame sequence uses to carry message name, payload,
//! and headers alongside it. This module resolves that gap with one
//! small envelope: call id, optional handshake segment, message name,
//! payload, and a JSON-encoded header map, each as one buffer in the
//! frame sequence [`crate::codec::AvroFrameCodec`] already frames.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock, oneshot};
use tracing::{debug, warn};

use crate::{
    codec::{FrameSequence, HandshakeMatch, HandshakeRequest, HandshakeResponse},
    error::{Result, RpcError},
    transport::Transport,
};

/// Per-call response status, carried alongside the payload so the
/// receiving side knows how to interpret it without re-inspecting the
/// message's error schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `wres.response` was populated.
    Success,
    /// `wres.error` was populated with a declared error variant.
    Application,
    /// A handler threw, panicked, or produced an undeclared error.
    System,
}

/// Headers carried alongside a request or response envelope: a string
/// key to raw-bytes map, per spec §3's `WrappedRequest`/`WrappedResponse`.
pub type Headers = HashMap<String, Vec<u8>>;

/// One call's request, as it travels the wire.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Call identifier, unique within this channel while in flight.
    pub id: u32,
    /// Present on the first call of a channel (or every call, for
    /// transports that do not cache a match).
    pub handshake: Option<HandshakeRequest>,
    /// Target message name.
    pub message: String,
    /// Avro-encoded request record.
    pub payload: Vec<u8>,
    /// Request headers.
    pub headers: Headers,
    /// Whether the caller expects no response.
    pub one_way: bool,
}

/// One call's response, as it travels the wire.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    /// Call identifier, matching the originating [`RequestEnvelope`].
    pub id: u32,
    /// Present when a handshake segment was exchanged on this call.
    pub handshake: Option<HandshakeResponse>,
    /// Outcome of the call.
    pub status: Status,
    /// Avro-encoded response or error payload, depending on `status`.
    pub payload: Vec<u8>,
    /// Response headers.
    pub headers: Headers,
}

fn encode_envelope_frames(
    id: u32,
    handshake: Option<&[u8]>,
    header_fields: [&[u8]; 2],
    payload: &[u8],
    headers: &Headers,
) -> Result<FrameSequence> {
    let headers_json =
        serde_json::to_vec(headers).map_err(|e| RpcError::Codec(format!("header encode: {e}")))?;
    let mut frames = vec![Bytes::copy_from_slice(&id.to_be_bytes())];
    frames.push(handshake.map_or_else(Bytes::new, Bytes::copy_from_slice));
    for field in header_fields {
        frames.push(Bytes::copy_from_slice(field));
    }
    frames.push(Bytes::copy_from_slice(payload));
    frames.push(Bytes::from(headers_json));
    Ok(frames)
}

fn decode_headers(buf: &[u8]) -> Result<Headers> {
    if buf.is_empty() {
        return Ok(Headers::new());
    }
    serde_json::from_slice(buf).map_err(|e| RpcError::Codec(format!("header decode: {e}")))
}

/// Encode a request envelope to its wire frame sequence. `pub(crate)` so
/// the proxy's stateless `avro/binary` POST handler can build a request
/// frame sequence without duplicating this module's envelope layout.
pub(crate) fn encode_request(env: &RequestEnvelope) -> Result<FrameSequence> {
    let handshake_bytes = env.handshake.as_ref().map(HandshakeRequest::encode).transpose()?;
    let message_bytes = env.message.as_bytes();
    let one_way_byte = [u8::from(env.one_way)];
    encode_envelope_frames(
        env.id,
        handshake_bytes.as_deref(),
        [message_bytes, &one_way_byte],
        &env.payload,
        &env.headers,
    )
}

/// Decode a request envelope from its wire frame sequence (see
/// [`encode_request`]).
pub(crate) fn decode_request(frames: &FrameSequence) -> Result<RequestEnvelope> {
    let [id_buf, handshake_buf, message_buf, one_way_buf, payload_buf, headers_buf] =
        take_six(frames)?;
    let id = read_id(id_buf)?;
    let handshake = if handshake_buf.is_empty() {
        None
    } else {
        Some(HandshakeRequest::decode(handshake_buf)?)
    };
    let message =
        String::from_utf8(message_buf.to_vec()).map_err(|e| RpcError::Codec(e.to_string()))?;
    let one_way = one_way_buf.first().copied().unwrap_or(0) != 0;
    Ok(RequestEnvelope {
        id,
        handshake,
        message,
        payload: payload_buf.to_vec(),
        headers: decode_headers(headers_buf)?,
        one_way,
    })
}

/// Encode a response envelope to its wire frame sequence (see
/// [`decode_request`]).
pub(crate) fn encode_response(env: &ResponseEnvelope) -> Result<FrameSequence> {
    let handshake_bytes = env.handshake.as_ref().map(HandshakeResponse::encode).transpose()?;
    let status_byte = [match env.status {
        Status::Success => 0u8,
        Status::Application => 1,
        Status::System => 2,
    }];
    encode_envelope_frames(
        env.id,
        handshake_bytes.as_deref(),
        [&status_byte, &[]],
        &env.payload,
        &env.headers,
    )
}

/// Decode a response envelope from its wire frame sequence.
pub(crate) fn decode_response(frames: &FrameSequence) -> Result<ResponseEnvelope> {
    let [id_buf, handshake_buf, status_buf, _unused, payload_buf, headers_buf] = take_six(frames)?;
    let id = read_id(id_buf)?;
    let handshake = if handshake_buf.is_empty() {
        None
    } else {
        Some(HandshakeResponse::decode(handshake_buf)?)
    };
    let status = match status_buf.first() {
        Some(0) => Status::Success,
        Some(1) => Status::Application,
        Some(2) => Status::System,
        _ => return Err(RpcError::Codec("invalid status byte".to_owned())),
    };
    Ok(ResponseEnvelope {
        id,
        handshake,
        status,
        payload: payload_buf.to_vec(),
        headers: decode_headers(headers_buf)?,
    })
}

fn take_six(frames: &FrameSequence) -> Result<[&[u8]; 6]> {
    if frames.len() != 6 {
        return Err(RpcError::Codec(format!(
            "expected 6 envelope buffers, got {}",
            frames.len()
        )));
    }
    Ok([
        frames[0].as_ref(),
        frames[1].as_ref(),
        frames[2].as_ref(),
        frames[3].as_ref(),
        frames[4].as_ref(),
        frames[5].as_ref(),
    ])
}

fn read_id(buf: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = buf
        .try_into()
        .map_err(|_| RpcError::Codec("call id must be 4 bytes".to_owned()))?;
    Ok(u32::from_be_bytes(arr))
}

/// Decode a [`Status::System`] payload. Always a bare Avro string
/// regardless of the message's declared error schema: a system error is
/// not a declared variant, so it never rides `errorType` (see
/// `server::encode_system_fallback`).
pub(crate) fn decode_system_error(bytes: &[u8]) -> Result<String> {
    let mut reader = bytes;
    match apache_avro::from_avro_datum(&apache_avro::Schema::String, &mut reader, None) {
        Ok(apache_avro::types::Value::String(s)) => Ok(s),
        Ok(_) => Err(RpcError::Codec("system error payload was not a string".to_owned())),
        Err(e) => Err(RpcError::Codec(e.to_string())),
    }
}

/// Receives decoded [`RequestEnvelope`]s on a server-role channel and
/// produces the matching [`ResponseEnvelope`].
///
/// Implemented by [`crate::server::Server`]; kept as a trait so `Channel`
/// has no compile-time dependency on the middleware pipeline.
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    /// Handle one incoming request and produce its response. `channel` is
    /// the live channel the request arrived on, when there is one — the
    /// stateless `POST` bridge dispatches straight from a decoded request
    /// with no channel behind it and passes `None`.
    async fn dispatch(&self, request: RequestEnvelope, channel: Option<&Arc<Channel>>) -> ResponseEnvelope;
}

/// Lifecycle state of a [`Channel`] (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed but not yet handshaken.
    Pending,
    /// Handshake succeeded (or was skipped via `noPing`); calls may
    /// proceed.
    Open,
    /// Closed via explicit destroy or transport EOF.
    Closed,
    /// A fatal codec or transport error occurred.
    Errored,
}

/// Whether this channel emits calls (client role) or receives and
/// dispatches them (server role).
enum Role {
    Client,
    Server(Arc<dyn RequestDispatcher>),
}

/// A negotiated session over one transport, for one scope.
pub struct Channel {
    scope: String,
    transport: Transport,
    role: Role,
    state: RwLock<ChannelState>,
    calls: dashmap::DashMap<u32, oneshot::Sender<Result<ResponseEnvelope>>>,
    next_id: AtomicU32,
    handshake_cached: AtomicBool,
    remote_protocol: Mutex<Option<String>>,
    no_ping: bool,
}

impl Channel {
    /// Open a client-role channel: may emit calls via [`Channel::call`].
    #[must_use]
    pub fn open_client(transport: Transport, scope: impl Into<String>, no_ping: bool) -> Arc<Self> {
        let channel = Arc::new(Self {
            scope: scope.into(),
            transport,
            role: Role::Client,
            state: RwLock::new(if no_ping {
                ChannelState::Open
            } else {
                ChannelState::Pending
            }),
            calls: dashmap::DashMap::new(),
            next_id: AtomicU32::new(1),
            handshake_cached: AtomicBool::new(no_ping),
            remote_protocol: Mutex::new(None),
            no_ping,
        });
        channel.clone().spawn_reader_if_stateful();
        channel
    }

    /// Open a server-role channel: reads incoming requests and dispatches
    /// them to `dispatcher`, writing back responses.
    #[must_use]
    pub fn open_server(
        transport: Transport,
        scope: impl Into<String>,
        no_ping: bool,
        dispatcher: Arc<dyn RequestDispatcher>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            scope: scope.into(),
            transport,
            role: Role::Server(dispatcher),
            state: RwLock::new(ChannelState::Open),
            calls: dashmap::DashMap::new(),
            next_id: AtomicU32::new(1),
            handshake_cached: AtomicBool::new(no_ping),
            remote_protocol: Mutex::new(None),
            no_ping,
        });
        channel.clone().spawn_reader_if_stateful();
        channel
    }

    /// The scope this channel is bound to.
    #[must_use]
    pub fn scope(&self) -> &str { &self.scope }

    /// Current lifecycle state.
    pub async fn state(&self) -> ChannelState { *self.state.read().await }

    /// The remote protocol document, once negotiated.
    pub async fn remote_protocol(&self) -> Option<String> { self.remote_protocol.lock().await.clone() }

    async fn set_state(&self, new_state: ChannelState) { *self.state.write().await = new_state; }

    fn spawn_reader_if_stateful(self: Arc<Self>) {
        let Transport::Stateful(stateful) = &self.transport else {
            return;
        };
        let duplex = stateful.duplex();
        tokio::spawn(async move {
            loop {
                match duplex.recv().await {
                    Ok(Some(frames)) => self.handle_incoming(frames).await,
                    Ok(None) => {
                        debug!(scope = %self.scope, "channel transport reached EOF");
                        self.close_with(ChannelState::Closed, RpcError::ChannelClosed).await;
                        break;
                    }
                    Err(e) => {
                        warn!(scope = %self.scope, error = %e, "channel transport error");
                        self.close_with(ChannelState::Errored, e).await;
                        break;
                    }
                }
            }
        });
    }

    async fn handle_incoming(self: &Arc<Self>, frames: FrameSequence) {
        match &self.role {
            Role::Client => match decode_response(&frames) {
                Ok(response) => {
                    if let Some((_, tx)) = self.calls.remove(&response.id) {
                        let _ = tx.send(Ok(response));
                    } else {
                        warn!(id = response.id, "response for unknown or completed call");
                    }
                }
                Err(e) => warn!(error = %e, "dropping undecodable response frame"),
            },
            Role::Server(dispatcher) => match decode_request(&frames) {
                Ok(request) => {
                    let one_way = request.one_way;
                    let id = request.id;
                    let response = dispatcher.dispatch(request, Some(self)).await;
                    if !one_way {
                        if let Err(e) = self.write_response(response).await {
                            warn!(id, error = %e, "failed to write response");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "dropping undecodable request frame"),
            },
        }
    }

    async fn write_response(&self, response: ResponseEnvelope) -> Result<()> {
        let frames = encode_response(&response)?;
        match &self.transport {
            Transport::Stateful(st) => st.duplex().send(frames).await,
            Transport::Stateless(_) => Ok(()),
        }
    }

    async fn close_with(&self, state: ChannelState, err: RpcError) {
        self.set_state(state).await;
        let ids: Vec<u32> = self.calls.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.calls.remove(&id) {
                let _ = tx.send(Err(match &err {
                    RpcError::ChannelClosed => RpcError::ChannelClosed,
                    other => RpcError::Transport(std::io::Error::other(other.to_string())),
                }));
            }
        }
    }

    /// Explicitly destroy the channel, failing every in-flight call with
    /// a channel-closed error.
    pub async fn destroy(&self) { self.close_with(ChannelState::Closed, RpcError::ChannelClosed).await; }

    fn next_handshake(&self, client_hash: [u8; 16], client_protocol: Option<&str>) -> Option<HandshakeRequest> {
        // Stateless transports carry no persistent connection to cache a
        // match against: every call is its own request, so the handshake
        // segment always rides along regardless of `noPing`.
        if matches!(self.transport, Transport::Stateful(_)) && self.handshake_cached.load(Ordering::Acquire) {
            return None;
        }
        Some(HandshakeRequest {
            client_hash,
            client_protocol: client_protocol.map(ToOwned::to_owned),
            server_hash: None,
        })
    }

    async fn record_handshake_result(&self, response: &HandshakeResponse) -> Result<()> {
        match response.matched {
            HandshakeMatch::None => {
                let msg = response
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknownProtocol".to_owned());
                self.set_state(ChannelState::Errored).await;
                Err(RpcError::Handshake(msg))
            }
            HandshakeMatch::Both | HandshakeMatch::Client => {
                self.handshake_cached.store(true, Ordering::Release);
                if let Some(protocol) = &response.server_protocol {
                    *self.remote_protocol.lock().await = Some(protocol.clone());
                }
                self.set_state(ChannelState::Open).await;
                Ok(())
            }
        }
    }

    /// Emit one call on this (client-role) channel and await its
    /// response. `timeout` enforces spec §4.E's per-call hard upper
    /// bound.
    ///
    /// # Errors
    /// Returns [`RpcError::Handshake`] if the remote rejects the
    /// protocol, [`RpcError::Timeout`] if `timeout` elapses first, or a
    /// transport/codec error from the underlying exchange.
    pub async fn call(
        &self,
        client_hash: [u8; 16],
        client_protocol: Option<&str>,
        message: String,
        payload: Vec<u8>,
        headers: Headers,
        one_way: bool,
        timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        if matches!(*self.state.read().await, ChannelState::Closed | ChannelState::Errored) {
            return Err(RpcError::ChannelClosed);
        }
        let handshake = self.next_handshake(client_hash, client_protocol);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestEnvelope {
            id,
            handshake,
            message,
            payload,
            headers,
            one_way,
        };
        let frames = encode_request(&request)?;

        let response = match &self.transport {
            Transport::Stateless(factory) => {
                let sink = factory.open().await?;
                let response_frames = sink.call(frames).await?;
                decode_response(&response_frames)?
            }
            Transport::Stateful(st) if one_way => {
                st.duplex().send(frames).await?;
                ResponseEnvelope {
                    id,
                    handshake: None,
                    status: Status::Success,
                    payload: Vec::new(),
                    headers: Headers::new(),
                }
            }
            Transport::Stateful(st) => {
                let (tx, rx) = oneshot::channel();
                self.calls.insert(id, tx);
                if let Err(e) = st.duplex().send(frames).await {
                    self.calls.remove(&id);
                    return Err(e);
                }
                let awaited = if let Some(dur) = timeout {
                    match tokio::time::timeout(dur, rx).await {
                        Ok(r) => r,
                        Err(_) => {
                            self.calls.remove(&id);
                            return Err(RpcError::Timeout);
                        }
                    }
                } else {
                    rx.await
                };
                awaited.map_err(|_| RpcError::ChannelClosed)??
            }
        };

        if let Some(hs) = &response.handshake {
            self.record_handshake_result(hs).await?;
        }
        Ok(response)
    }
}
