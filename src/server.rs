//! Incoming-call dispatch: a message → handler registry, server-side
//! middleware, and handshake negotiation (spec §4.E "Server").
//!
//! Mirrors the teacher's `handler::Context`/`Session` split for request
//! state and `wireframe/routes.rs`'s middleware chain for the forward
//! pipeline; the handshake matching this module performs is Avro RPC's
//! own, not something the teacher's binary protocol needed.

use std::{collections::HashMap, sync::Arc};

use apache_avro::types::Value;
use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    avro::{Service, ServiceOptions},
    channel::{Channel, Headers, RequestDispatcher, RequestEnvelope, ResponseEnvelope, Status},
    codec::{HandshakeMatch, HandshakeRequest, HandshakeResponse},
    context::{CallContext, Side},
    error::{Result, RpcError},
    middleware::{Middleware, Outcome, Pipeline, WrappedRequest, WrappedResponse},
    transport::Transport,
};

/// A server-side message handler (spec §4.E `onMessage(name, handler)`).
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one decoded request, returning the decoded response value.
    ///
    /// # Errors
    /// A declared error returned here becomes an [`Outcome::Error`]; any
    /// other error is normalized to a `system` error by the dispatcher
    /// when [`ServiceOptions::strict_errors`] is set.
    async fn call(&self, ctx: &mut CallContext, request: Value) -> Result<Value>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(&mut CallContext, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn call(&self, ctx: &mut CallContext, request: Value) -> Result<Value> { (self.f)(ctx, request).await }
}

/// Incoming-call dispatch surface (spec §4.E "Server").
///
/// Owns a message → [`Handler`] registry and the middleware chain run
/// around every dispatched call. One `Server` may back many [`Channel`]s
/// (one per connected scope), each constructed via [`Server::listen`].
pub struct Server {
    service: Arc<Service>,
    opts: ServiceOptions,
    handlers: HashMap<String, Arc<dyn Handler>>,
    middleware: Mutex<Pipeline>,
    server_protocol: Option<String>,
    server_hash: [u8; 16],
}

impl Server {
    /// Build a server bound to `service` with `opts`, and no handlers
    /// registered yet.
    #[must_use]
    pub fn new(service: Arc<Service>, opts: ServiceOptions) -> Self {
        let server_protocol = match service.protocol() {
            Json::Null => None,
            doc => serde_json::to_string(doc).ok(),
        };
        let server_hash = hash_protocol(service.name(), server_protocol.as_deref());
        Self {
            service,
            opts,
            handlers: HashMap::new(),
            middleware: Mutex::new(Pipeline::new()),
            server_protocol,
            server_hash,
        }
    }

    /// The service this server dispatches calls against.
    #[must_use]
    pub fn service(&self) -> &Arc<Service> { &self.service }

    /// Register the handler invoked for `message` (spec §4.E
    /// `onMessage(name, handler)`). Replaces any previously registered
    /// handler for the same name.
    pub fn on_message<F, Fut>(&mut self, message: impl Into<String>, handler: F)
    where
        F: Fn(&mut CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(message.into(), Arc::new(FnHandler { f: handler }));
    }

    /// Append a middleware frame to the chain run around every dispatched
    /// call (spec §5: installed before the server starts accepting
    /// calls).
    pub async fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.lock().await.push(middleware);
    }

    /// Open a server-role channel over `transport` at `scope`, dispatching
    /// incoming calls to `server`.
    #[must_use]
    pub fn listen(server: &Arc<Self>, transport: Transport, scope: impl Into<String>, no_ping: bool) -> Arc<Channel> {
        Channel::open_server(transport, scope, no_ping, Arc::clone(server) as Arc<dyn RequestDispatcher>)
    }

    fn negotiate(&self, incoming: &HandshakeRequest) -> HandshakeResponse {
        if incoming.client_hash == self.server_hash {
            return HandshakeResponse {
                matched: HandshakeMatch::Both,
                server_protocol: None,
                server_hash: Some(self.server_hash),
                error: None,
            };
        }
        if incoming.client_protocol.is_some() {
            return HandshakeResponse {
                matched: HandshakeMatch::Client,
                server_protocol: self.server_protocol.clone(),
                server_hash: Some(self.server_hash),
                error: None,
            };
        }
        HandshakeResponse {
            matched: HandshakeMatch::None,
            server_protocol: self.server_protocol.clone(),
            server_hash: Some(self.server_hash),
            error: Some("unknownProtocol".to_owned()),
        }
    }

    /// Dispatch one decoded request, producing its response and — when the
    /// request carried a handshake segment — the negotiated
    /// [`HandshakeResponse`] to attach to it regardless of whether the
    /// message itself could be serviced.
    async fn dispatch_inner(
        &self,
        request: RequestEnvelope,
        channel: Option<&Arc<Channel>>,
    ) -> (ResponseEnvelope, Option<HandshakeResponse>) {
        let handshake_response = request.handshake.as_ref().map(|hs| self.negotiate(hs));
        if matches!(handshake_response.as_ref().map(|r| r.matched), Some(HandshakeMatch::None)) {
            let err = handshake_response
                .as_ref()
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| "unknownProtocol".to_owned());
            return (
                self.error_response(request.id, &RpcError::Handshake(err)),
                handshake_response,
            );
        }

        match self.dispatch_message(&request, channel).await {
            Ok(response) => (response, handshake_response),
            Err(e) => (self.error_response(request.id, &e), handshake_response),
        }
    }

    fn error_response(&self, id: u32, err: &RpcError) -> ResponseEnvelope {
        let payload = encode_system_fallback(&system_error_value(err)).unwrap_or_default();
        ResponseEnvelope {
            id,
            handshake: None,
            status: Status::System,
            payload,
            headers: Headers::new(),
        }
    }

    async fn dispatch_message(
        &self,
        request: &RequestEnvelope,
        channel: Option<&Arc<Channel>>,
    ) -> Result<ResponseEnvelope> {
        let msg = self
            .service
            .message(&request.message)
            .ok_or_else(|| RpcError::Codec(format!("unknown message {}", request.message)))?
            .clone();
        let handler = self
            .handlers
            .get(&request.message)
            .cloned()
            .ok_or_else(|| RpcError::System(format!("no handler registered for {}", request.message)))?;

        let request_value = msg.decode_request(&request.payload)?;
        let mut wreq = WrappedRequest::new(request_value);
        wreq.headers = request.headers.clone();

        let channel = channel.map_or_else(stub_channel, Arc::clone);
        let mut ctx = CallContext::new(Side::Server, msg.clone(), channel);
        let one_way = msg.one_way();

        let pipeline = self.middleware.lock().await.clone();
        let handler_message = request.message.clone();
        let result = pipeline
            .run(&mut ctx, &mut wreq, move |ctx, wreq| {
                let handler = Arc::clone(&handler);
                let payload = wreq.request.clone();
                async move {
                    match handler.call(ctx, payload).await {
                        Ok(v) => Ok(WrappedResponse::success(v)),
                        Err(RpcError::Application(v)) => Ok(WrappedResponse::failure(v)),
                        Err(e) => {
                            warn!(message = %handler_message, error = %e, "handler failed with an undeclared error");
                            Err(e)
                        }
                    }
                }
            })
            .await;

        let wres = match result {
            Ok(wres) => wres,
            Err(e) => WrappedResponse {
                outcome: Some(Outcome::Error(system_error_value(&e))),
                headers: Headers::new(),
            },
        };

        // A declared error value that fails to encode against the message's
        // error schema is not a declared variant; normalized to `system`
        // regardless of `strict_errors`, which only documents that this is
        // expected rather than changing the behaviour itself.
        let (status, payload) = match wres.outcome {
            Some(Outcome::Response(v)) => (Status::Success, msg.encode_response(&v)?),
            Some(Outcome::Error(v)) => match msg.encode_error(&v) {
                Ok(bytes) => (Status::Application, bytes),
                Err(_) => (Status::System, encode_system_fallback(&v)?),
            },
            None => (
                Status::System,
                encode_system_fallback(&system_error_value(&RpcError::System(
                    "terminal step produced no outcome".to_owned(),
                )))?,
            ),
        };

        Ok(ResponseEnvelope {
            id: request.id,
            handshake: None,
            status: if one_way { Status::Success } else { status },
            payload: if one_way { Vec::new() } else { payload },
            headers: wres.headers,
        })
    }
}

fn system_error_value(err: &RpcError) -> Value { Value::String(err.to_string()) }

fn encode_system_fallback(value: &Value) -> Result<Vec<u8>> {
    apache_avro::to_avro_datum(&apache_avro::Schema::String, value.clone())
        .map_err(|e| RpcError::Codec(e.to_string()))
}

fn hash_protocol(name: &str, protocol: Option<&str>) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(name.as_bytes());
    if let Some(p) = protocol {
        hasher.update(p.as_bytes());
    }
    hasher.finalize().into()
}

/// A channel handle for contexts dispatched with no live channel behind
/// them — the stateless `POST` bridge (`proxy::post::handle_post`)
/// decodes a request straight off the wire with no persistent connection
/// to attach, so it dispatches with `channel: None` and this stub fills
/// [`CallContext::channel`] instead.
fn stub_channel() -> Arc<Channel> {
    let (transport, _peer) = crate::transport::memory::memory_pair();
    Channel::open_client(Transport::Stateful(transport), "", true)
}

#[async_trait]
impl RequestDispatcher for Server {
    async fn dispatch(&self, request: RequestEnvelope, channel: Option<&Arc<Channel>>) -> ResponseEnvelope {
        let id = request.id;
        let (mut response, handshake) = self.dispatch_inner(request, channel).await;
        if response.status == Status::System {
            debug!(id, "dispatch produced a system error response");
        }
        response.handshake = handshake;
        response
    }
}

#[cfg(test)]
mod tests {
    use apache_avro::Schema;
    use indexmap::IndexMap;

    use super::*;
    use crate::{avro::Message, channel::ChannelState};

    fn neg_service() -> Arc<Service> {
        let mut messages = IndexMap::new();
        messages.insert(
            "neg".to_owned(),
            Message::new("neg".to_owned(), false, Schema::Int, Schema::Int, Schema::String),
        );
        Arc::new(Service::new("Math", serde_json::json!({"protocol": "Math"}), messages, IndexMap::new()))
    }

    fn request(id: u32, payload: Vec<u8>) -> RequestEnvelope {
        RequestEnvelope {
            id,
            handshake: None,
            message: "neg".to_owned(),
            payload,
            headers: Headers::new(),
            one_way: false,
        }
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_handler() {
        let mut server = Server::new(neg_service(), ServiceOptions::default());
        server.on_message("neg", |_ctx, req| async move {
            let Value::Int(n) = req else {
                return Err(RpcError::System("expected int".to_owned()));
            };
            Ok(Value::Int(-n))
        });
        let server = Arc::new(server);

        let msg = server.service.message("neg").expect("neg message").clone();
        let payload = msg.encode_request(&Value::Int(7)).expect("encode");
        let response = server.dispatch(request(1, payload), None).await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(msg.decode_response(&response.payload).expect("decode"), Value::Int(-7));
    }

    #[tokio::test]
    async fn missing_handler_yields_a_system_error() {
        let server = Arc::new(Server::new(neg_service(), ServiceOptions::default()));
        let msg = server.service.message("neg").expect("neg message").clone();
        let payload = msg.encode_request(&Value::Int(1)).expect("encode");
        let response = server.dispatch(request(2, payload), None).await;
        assert_eq!(response.status, Status::System);
    }

    #[tokio::test]
    async fn listen_installs_a_channel_in_the_open_state() {
        let server = Arc::new(Server::new(neg_service(), ServiceOptions::default()));
        let (transport, _peer) = crate::transport::memory::memory_pair();
        let channel = Server::listen(&server, Transport::Stateful(transport), "", true);
        assert_eq!(channel.state().await, ChannelState::Open);
    }
}
