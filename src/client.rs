//! Message emission surface: owns channels and the client middleware
//! chain (spec §4.E "Client").

use std::{sync::Arc, time::Duration};

use apache_avro::types::Value;
use dashmap::DashMap;
use md5::{Digest, Md5};
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    avro::{Service, ServiceOptions},
    channel::{Channel, ChannelState, Headers},
    context::{CallContext, Side},
    error::{Result, RpcError},
    middleware::{Middleware, Pipeline, WrappedRequest, WrappedResponse},
    tracing_mw::TraceHandle,
    transport::Transport,
};

/// Options accepted by [`Client::emit_message`] (spec §4.E).
#[derive(Default, Clone)]
pub struct CallOptions {
    /// The trace to append this call's [`crate::tracing_mw::Call`] entry
    /// to; consumed by the tracing middleware if installed.
    pub trace: Option<TraceHandle>,
    /// Hard upper bound on this call; firing yields [`RpcError::Timeout`].
    pub timeout: Option<Duration>,
    /// Select a non-default scope when multiple channels are installed.
    pub scope: Option<String>,
}

/// A call queued because no channel was available yet for its scope and
/// [`ServiceOptions::buffering`] was set.
struct PendingEmit {
    message: String,
    request: Value,
    opts: CallOptions,
    reply: tokio::sync::oneshot::Sender<Result<Value>>,
}

/// Observer for a newly installed channel (spec §4.E "Events": `channel`).
pub type ChannelListener = Arc<dyn Fn(&Arc<Channel>) + Send + Sync>;

/// Message emission surface (spec §4.E "Client").
///
/// Owns every channel it has been given, in `scope → channel` form, a
/// middleware chain run around each emitted call, and — when
/// [`ServiceOptions::buffering`] is set — a FIFO queue of calls emitted
/// before their scope's channel existed.
pub struct Client {
    service: Arc<Service>,
    opts: ServiceOptions,
    channels: DashMap<String, Arc<Channel>>,
    middleware: Mutex<Pipeline>,
    pending: DashMap<String, Vec<PendingEmit>>,
    channel_listeners: Mutex<Vec<ChannelListener>>,
    trace_key: String,
    client_protocol: Option<String>,
}

impl Client {
    /// Build a client bound to `service` with `opts`.
    #[must_use]
    pub fn new(service: Arc<Service>, opts: ServiceOptions) -> Self {
        let client_protocol = match service.protocol() {
            Json::Null => None,
            doc => serde_json::to_string(doc).ok(),
        };
        Self {
            service,
            opts,
            channels: DashMap::new(),
            middleware: Mutex::new(Pipeline::new()),
            pending: DashMap::new(),
            channel_listeners: Mutex::new(Vec::new()),
            trace_key: crate::tracing_mw::DEFAULT_TRACE_KEY.to_owned(),
            client_protocol,
        }
    }

    /// The service this client emits calls against.
    #[must_use]
    pub fn service(&self) -> &Arc<Service> { &self.service }

    /// Header/local key under which a trace travels (see
    /// [`crate::tracing_mw::TracingConfig::trace_key`]; kept in sync when
    /// the caller installs tracing middleware under a non-default key).
    pub fn set_trace_key(&mut self, key: impl Into<String>) { self.trace_key = key.into(); }

    /// Append a middleware frame to the chain run around every call.
    ///
    /// Spec §5: "a Client or Server that is currently dispatching calls
    /// must not have new middleware pushed" — callers are expected to
    /// finish installing middleware before the first [`Client::emit_message`].
    pub async fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.lock().await.push(middleware);
    }

    /// Register a listener invoked whenever a new channel is installed
    /// (spec §4.E "Events": `channel`).
    pub async fn on_channel(&self, listener: ChannelListener) {
        self.channel_listeners.lock().await.push(listener);
    }

    /// Install a channel for `scope`, replacing any previous channel
    /// bound to the same scope, and flush any calls buffered for it.
    pub async fn install_channel(&self, scope: impl Into<String>, channel: Arc<Channel>) {
        let scope = scope.into();
        self.channels.insert(scope.clone(), Arc::clone(&channel));
        for listener in self.channel_listeners.lock().await.iter() {
            listener(&channel);
        }
        self.flush_pending(&scope).await;
    }

    async fn flush_pending(&self, scope: &str) {
        let Some((_, queued)) = self.pending.remove(scope) else {
            return;
        };
        for pending in queued {
            let outcome = self.emit_on_scope(scope, &pending.message, pending.request, pending.opts).await;
            let _ = pending.reply.send(outcome);
        }
    }

    fn client_hash(&self) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(self.service.name().as_bytes());
        if let Some(protocol) = &self.client_protocol {
            hasher.update(protocol.as_bytes());
        }
        hasher.finalize().into()
    }

    /// Emit one message and await its response (spec §4.E
    /// `emitMessage(name, request, opts?, cb?)`).
    ///
    /// # Errors
    /// Returns [`RpcError::NoAvailableChannel`] if no channel is bound
    /// for the requested scope and buffering is disabled; a declared
    /// [`RpcError::Application`] error if the remote reported one; or a
    /// transport/codec/middleware error from the call itself.
    pub async fn emit_message(&self, message: &str, request: Value, opts: CallOptions) -> Result<Value> {
        let scope = opts.scope.clone().unwrap_or_default();
        if self.channels.contains_key(&scope) {
            return self.emit_on_scope(&scope, message, request, opts).await;
        }
        if !self.opts.buffering {
            return Err(RpcError::NoAvailableChannel(scope));
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.entry(scope).or_default().push(PendingEmit {
            message: message.to_owned(),
            request,
            opts,
            reply: tx,
        });
        rx.await.map_err(|_| RpcError::ChannelClosed)?
    }

    async fn emit_on_scope(&self, scope: &str, message: &str, request: Value, opts: CallOptions) -> Result<Value> {
        let channel = self
            .channels
            .get(scope)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RpcError::NoAvailableChannel(scope.to_owned()))?;
        if matches!(channel.state().await, ChannelState::Closed | ChannelState::Errored) {
            return Err(RpcError::ChannelClosed);
        }

        let msg = self
            .service
            .message(message)
            .ok_or_else(|| RpcError::Codec(format!("unknown message {message}")))?
            .clone();
        let one_way = msg.one_way();

        let mut ctx = CallContext::new(Side::Client, msg.clone(), Arc::clone(&channel));
        if let Some(handle) = &opts.trace {
            ctx.set_local(self.trace_key.clone(), Arc::clone(handle));
        }

        let mut wreq = WrappedRequest::new(request);
        let timeout = opts.timeout;
        let client_hash = self.client_hash();
        let client_protocol = self.client_protocol.clone();
        let message_name = message.to_owned();

        let pipeline = self.middleware.lock().await.clone();
        let response = pipeline
            .run(&mut ctx, &mut wreq, move |_ctx, wreq| {
                let headers = std::mem::take(&mut wreq.headers);
                let payload_request = wreq.request.clone();
                async move {
                    let payload = msg.encode_request(&payload_request)?;
                    let env = channel
                        .call(
                            client_hash,
                            client_protocol.as_deref(),
                            message_name,
                            payload,
                            headers,
                            one_way,
                            timeout,
                        )
                        .await?;
                    if one_way {
                        return Ok(WrappedResponse::empty());
                    }
                    let mut wres = match env.status {
                        crate::channel::Status::Success => WrappedResponse::success(msg.decode_response(&env.payload)?),
                        crate::channel::Status::Application => {
                            WrappedResponse::failure(msg.decode_error(&env.payload)?)
                        }
                        crate::channel::Status::System => {
                            return Err(RpcError::System(crate::channel::decode_system_error(&env.payload)?));
                        }
                    };
                    wres.headers = env.headers;
                    Ok(wres)
                }
            })
            .await?;

        if one_way {
            return Ok(Value::Null);
        }
        match response.outcome {
            Some(crate::middleware::Outcome::Response(v)) => Ok(v),
            Some(crate::middleware::Outcome::Error(v)) => Err(RpcError::Application(v)),
            None => Err(RpcError::Codec("terminal step produced no outcome".to_owned())),
        }
    }

    /// Close every channel owned by this client (spec §3 "Client/Server
    /// ... destroyed by `destroyChannels`, which closes every owned
    /// channel").
    pub async fn destroy_channels(&self) {
        for entry in self.channels.iter() {
            entry.value().destroy().await;
        }
        info!(scopes = self.channels.len(), "client channels destroyed");
    }

    /// Open a client-role channel over `transport` at `scope` and
    /// install it. A thin convenience wrapper around
    /// [`Channel::open_client`] plus [`Client::install_channel`].
    pub async fn connect(&self, transport: Transport, scope: impl Into<String>, no_ping: bool) -> Arc<Channel> {
        let scope = scope.into();
        let channel = Channel::open_client(transport, scope.clone(), no_ping);
        debug!(scope = %scope, "client channel connecting");
        self.install_channel(scope, Arc::clone(&channel)).await;
        channel
    }
}

#[cfg(test)]
mod tests {
    use apache_avro::Schema;
    use indexmap::IndexMap;

    use super::*;
    use crate::avro::Message;

    fn neg_service() -> Arc<Service> {
        let mut messages = IndexMap::new();
        messages.insert(
            "neg".to_owned(),
            Message::new("neg".to_owned(), false, Schema::Int, Schema::Int, Schema::String),
        );
        Arc::new(Service::new("Math", serde_json::json!({"protocol": "Math"}), messages, IndexMap::new()))
    }

    #[tokio::test]
    async fn emit_without_a_channel_fails_when_not_buffering() {
        let client = Client::new(neg_service(), ServiceOptions::default());
        let err = client
            .emit_message("neg", Value::Int(1), CallOptions::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, RpcError::NoAvailableChannel(_)));
    }

    #[tokio::test]
    async fn emit_unknown_message_fails() {
        let client = Client::new(neg_service(), ServiceOptions::default());
        let (transport, _peer) = crate::transport::memory::memory_pair();
        client.connect(Transport::Stateful(transport), "", true).await;
        let err = client
            .emit_message("plus", Value::Int(1), CallOptions::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, RpcError::Codec(_)));
    }
}
