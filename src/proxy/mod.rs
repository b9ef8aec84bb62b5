//! Multi-scope HTTP proxy: routes POST, CONNECT, and WebSocket-upgrade
//! connections to bound servers or client-providers by scope (spec
//! §4.G).
//!
//! No teacher analogue exists for this module (the teacher speaks raw
//! TCP only); the HTTP surface follows the corpus's own idiomatic
//! choice of `axum` for routing plus raw `hyper`/`hyper-util` for the
//! CONNECT upgrade, per the grounding ledger.

pub mod connect;
mod multiplex;
pub mod post;
pub mod tunnel;
pub mod websocket;

use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use axum::http::HeaderMap;
use dashmap::DashMap;
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, sync::Mutex};
use tower::ServiceExt as _;
use tracing::{info, warn};

use crate::{
    channel::{Channel, Headers},
    client::{Client, ChannelListener},
    error::Result,
    server::Server,
    transport::{StatefulTransport, Transport},
};

/// Authenticates or admits an incoming proxy connection before it is
/// bound to a scope (spec §4.G: `receiver(headers, cb)`).
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Inspect `headers`. Return `Ok(None)` to admit with no further
    /// action, `Ok(Some(hook))` to admit and invoke `hook` once the
    /// channel is bound, or `Err` to deny the connection (surfaced as
    /// HTTP/socket `403`).
    async fn admit(&self, headers: &Headers) -> Result<Option<ChannelListener>>;
}

/// A bindable client-side peer for `bindClientProvider` (spec §4.G):
/// receives the client-role channel constructed over a freshly accepted
/// tunnel or WebSocket socket bound to its scope.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Install the freshly opened channel, e.g. via
    /// [`Client::install_channel`].
    async fn on_channel(&self, channel: Arc<Channel>);
}

#[async_trait]
impl ClientProvider for Client {
    async fn on_channel(&self, channel: Arc<Channel>) {
        let scope = channel.scope().to_owned();
        self.install_channel(scope, channel).await;
    }
}

/// What a scope is bound to.
enum Binding {
    Server(Arc<Server>),
    ClientProvider(Arc<dyn ClientProvider>),
}

/// Options accepted by [`Proxy::new`].
#[derive(Debug, Default, Clone)]
pub struct ProxyOptions {
    /// URL path prefix POST scope parsing strips before reading the
    /// trailing scope segment (spec §4.G: "a configurable prefix,
    /// default `/`").
    pub post_scope_prefix: String,
    /// Skip the handshake round-trip on every channel this proxy opens
    /// over an accepted tunnel or WebSocket socket (spec §3:
    /// `createChannel(transport, {scope, noPing, objectMode})`).
    pub no_ping: bool,
}

/// Multi-scope HTTP proxy (spec §4.G).
///
/// Binds `(scope, server)` or `(scope, clientProvider)` pairs; scope
/// identifiers are unique within one proxy (spec §3's "Binding"
/// invariant — a later bind for an already-bound scope replaces it,
/// matching `DashMap::insert`'s semantics).
pub struct Proxy {
    opts: ProxyOptions,
    receiver: Option<Arc<dyn Receiver>>,
    bindings: DashMap<String, Binding>,
    expected_scopes: HashSet<String>,
    channels: Mutex<Vec<Weak<Channel>>>,
}

impl Proxy {
    /// Build a proxy with `opts` and an optional admission hook.
    #[must_use]
    pub fn new(opts: ProxyOptions, receiver: Option<Arc<dyn Receiver>>) -> Self {
        Self {
            opts,
            receiver,
            bindings: DashMap::new(),
            expected_scopes: HashSet::new(),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Declare `scopes` as scopes this proxy will eventually bind, for
    /// [`Proxy::is_ready`] to track (spec §9's "late server mounting"
    /// readiness predicate).
    #[must_use]
    pub fn expect_scopes(mut self, scopes: impl IntoIterator<Item = String>) -> Self {
        self.expected_scopes.extend(scopes);
        self
    }

    /// Bind `scope` to `server`: incoming requests for `scope` dispatch
    /// to it.
    pub fn bind_server(&self, scope: impl Into<String>, server: Arc<Server>) {
        self.bindings.insert(scope.into(), Binding::Server(server));
    }

    /// Bind `scope` to `provider`: a client-role channel is constructed
    /// over each accepted tunnel/WebSocket socket requesting `scope` and
    /// handed to `provider`. Only meaningful for bidirectional wire
    /// modes; POST never constructs a client-role channel.
    pub fn bind_client_provider(&self, scope: impl Into<String>, provider: Arc<dyn ClientProvider>) {
        self.bindings.insert(scope.into(), Binding::ClientProvider(provider));
    }

    /// True once every scope declared via [`Proxy::expect_scopes`] has
    /// been bound (spec §9's readiness predicate; unbound scopes are
    /// rejected with `404` regardless, this only gates whether the
    /// proxy as a whole considers itself ready to serve).
    #[must_use]
    pub fn is_ready(&self) -> bool { self.expected_scopes.iter().all(|s| self.bindings.contains_key(s)) }

    async fn admit(&self, headers: &Headers) -> Result<Option<ChannelListener>> {
        match &self.receiver {
            Some(r) => r.admit(headers).await,
            None => Ok(None),
        }
    }

    fn server_for(&self, scope: &str) -> Option<Arc<Server>> {
        let entry = self.bindings.get(scope)?;
        match entry.value() {
            Binding::Server(s) => Some(Arc::clone(s)),
            Binding::ClientProvider(_) => None,
        }
    }

    fn client_provider_for(&self, scope: &str) -> Option<Arc<dyn ClientProvider>> {
        let entry = self.bindings.get(scope)?;
        match entry.value() {
            Binding::ClientProvider(p) => Some(Arc::clone(p)),
            Binding::Server(_) => None,
        }
    }

    fn has_scope(&self, scope: &str) -> bool { self.bindings.contains_key(scope) }

    /// The POST scope-prefix this proxy was configured with.
    fn post_scope_prefix(&self) -> &str { &self.opts.post_scope_prefix }

    /// Record a channel so [`Proxy::close_tracked_channels`] can close it
    /// on graceful shutdown. Held weakly: a channel whose scope's socket
    /// has already disconnected is simply skipped, not kept alive.
    async fn track_channel(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels.lock().await;
        channels.retain(|c| c.strong_count() > 0);
        channels.push(Arc::downgrade(channel));
    }

    /// Destroy every channel this proxy has opened over an accepted
    /// tunnel or WebSocket socket that is still live (spec's graceful
    /// shutdown supplement: closing the listener must not leave
    /// in-flight channels dangling).
    async fn close_tracked_channels(&self) {
        let channels = self.channels.lock().await;
        for weak in channels.iter() {
            if let Some(channel) = weak.upgrade() {
                channel.destroy().await;
            }
        }
    }

    /// Build the axum router serving `POST` and WebSocket-upgrade scope
    /// traffic. CONNECT is handled separately at the raw hyper
    /// per-connection layer by [`Proxy::serve`], since a CONNECT request's
    /// authority-form target has no path for this router to match.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route(
                "/{*scope}",
                axum::routing::get(websocket::handle_websocket).post(post::handle_post),
            )
            .fallback(post::handle_post)
            .with_state(Arc::clone(self))
    }

    /// Accept connections on `listener` and serve them forever: CONNECT
    /// requests are tunnelled directly (spec §4.G), everything else runs
    /// through [`Proxy::router`].
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Like [`Proxy::serve`], but stops accepting new connections once
    /// `shutdown` resolves and closes every channel this proxy has opened
    /// over an accepted socket (spec's graceful shutdown supplement).
    pub async fn serve_with_shutdown(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        let router = self.router();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("proxy shutting down, closing tracked channels");
                    self.close_tracked_channels().await;
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let proxy = Arc::clone(&self);
                    let router = router.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = hyper::service::service_fn(move |req| {
                            let proxy = Arc::clone(&proxy);
                            let router = router.clone();
                            async move {
                                if req.method() == hyper::Method::CONNECT {
                                    Ok(connect::handle_connect(&proxy, req).await)
                                } else {
                                    let req = req.map(axum::body::Body::new);
                                    router.oneshot(req).await
                                }
                            }
                        });
                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            warn!(peer = %peer, error = %e, "proxy connection error");
                        }
                    });
                }
            }
        }
    }
}

/// Collect an HTTP header map into the plain byte-string [`Headers`] map
/// the RPC layer uses, dropping any header whose value is not valid
/// UTF-8 (spec §4.G admission headers are ASCII metadata, never binary).
#[must_use]
pub(crate) fn header_map_to_call_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_owned(), v.as_bytes().to_vec())))
        .collect()
}

/// Wrap `physical` behind the scope multiplexer and bind one
/// [`StatefulTransport`] per entry in `scopes` to its scope's server or
/// client-provider (spec §4.G: "multiple scopes map one socket to
/// multiple channels").
///
/// Used by both the CONNECT tunnel handler and the WebSocket upgrade
/// handler once the underlying physical duplex is established;
/// `object_mode` distinguishes a WebSocket's already-framed binary
/// messages from a CONNECT tunnel's raw byte stream.
pub(crate) async fn bind_transport_to_scopes(
    proxy: &Arc<Proxy>,
    physical: Arc<dyn crate::transport::Duplex>,
    object_mode: bool,
    scopes: Vec<String>,
    hook: Option<ChannelListener>,
) {
    let no_ping = proxy.opts.no_ping;
    let mut scoped = multiplex::multiplex(physical, object_mode, &scopes);
    for scope in scopes {
        let Some(transport) = scoped.remove(&scope) else { continue };
        if let Some(server) = proxy.server_for(&scope) {
            let channel = Server::listen(&server, Transport::Stateful(transport), scope.clone(), no_ping);
            proxy.track_channel(&channel).await;
            if let Some(hook) = &hook {
                hook(&channel);
            }
        } else if let Some(provider) = proxy.client_provider_for(&scope) {
            let channel = Channel::open_client(Transport::Stateful(transport), scope.clone(), no_ping);
            proxy.track_channel(&channel).await;
            provider.on_channel(Arc::clone(&channel)).await;
            if let Some(hook) = &hook {
                hook(&channel);
            }
        } else {
            warn!(scope = %scope, "no server or client-provider bound for requested scope");
        }
    }
}

/// Parse scope identifiers for a CONNECT or WebSocket-upgrade request
/// (spec §4.G): the `scopes` header (comma-separated) takes precedence
/// over the URL path's `+`-joined first segment (spec.md is silent on
/// precedence; this crate picks header-wins since an explicit header is
/// the more specific signal).
#[must_use]
pub fn parse_scopes(scopes_header: Option<&str>, path: &str) -> Vec<String> {
    if let Some(header) = scopes_header {
        return header
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect();
    }
    path.trim_start_matches('/')
        .split('+')
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Parse the trailing scope segment from a POST request path, after
/// stripping `prefix` (spec §4.G: "a configurable prefix, default
/// `/`").
#[must_use]
pub fn parse_post_scope(prefix: &str, path: &str) -> Option<String> {
    let stripped = path.strip_prefix(prefix).unwrap_or(path);
    let trimmed = stripped.trim_matches('/');
    if trimmed.is_empty() { None } else { Some(trimmed.to_owned()) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::header_wins_over_path(Some("math, log"), "/ignored+path", vec!["math".to_owned(), "log".to_owned()])]
    #[case::plus_joined_path(None, "/math+log", vec!["math".to_owned(), "log".to_owned()])]
    #[case::single_segment_path(None, "/math", vec!["math".to_owned()])]
    #[case::empty_path_has_no_scopes(None, "/", Vec::<String>::new())]
    #[case::blank_header_segments_are_dropped(Some("math, , log"), "/ignored", vec!["math".to_owned(), "log".to_owned()])]
    fn parse_scopes_cases(#[case] header: Option<&str>, #[case] path: &str, #[case] expected: Vec<String>) {
        assert_eq!(parse_scopes(header, path), expected);
    }

    #[rstest]
    #[case::strips_multi_segment_prefix("/rpc", "/rpc/math", Some("math"))]
    #[case::root_prefix_strips_nothing("/", "/math", Some("math"))]
    #[case::empty_trailing_segment_is_none("/rpc", "/rpc/", None)]
    #[case::no_prefix_match_falls_through_unstripped("/rpc", "/other/math", Some("other/math"))]
    fn parse_post_scope_cases(#[case] prefix: &str, #[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_post_scope(prefix, path).as_deref(), expected);
    }

    #[tokio::test]
    async fn is_ready_waits_for_every_expected_scope() {
        let proxy = Proxy::new(ProxyOptions::default(), None).expect_scopes(["math".to_owned(), "log".to_owned()]);
        assert!(!proxy.is_ready());
        let service = Arc::new(crate::avro::Service::new(
            "Math",
            serde_json::json!({"protocol": "Math"}),
            indexmap::IndexMap::new(),
            indexmap::IndexMap::new(),
        ));
        proxy.bind_server("math", Arc::new(Server::new(Arc::clone(&service), crate::avro::ServiceOptions::default())));
        assert!(!proxy.is_ready());
        proxy.bind_server("log", Arc::new(Server::new(service, crate::avro::ServiceOptions::default())));
        assert!(proxy.is_ready());
    }

    #[tokio::test]
    async fn serve_with_shutdown_stops_accepting_once_signalled() {
        let proxy = Arc::new(Proxy::new(ProxyOptions::default(), None));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            proxy
                .serve_with_shutdown(listener, async {
                    let _ = rx.await;
                })
                .await
        });
        tx.send(()).expect("signal shutdown");
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("serve_with_shutdown returned promptly")
            .expect("serve task did not panic");
        assert!(result.is_ok());
    }
}
