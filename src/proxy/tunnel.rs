//! Client-side counterpart of [`super::connect`]: open a `CONNECT`
//! tunnel to a multi-scope proxy and hand back one client-role
//! [`Channel`] per requested scope (spec §4.G `startTunnel`).

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::warn;

use super::multiplex;
use crate::{
    channel::Channel,
    error::{Result, RpcError},
    transport::{StatefulTransport, Transport},
};

/// Connect to `proxy_addr`, `CONNECT`-tunnel through it, and open one
/// client-role channel per entry in `scopes`. `no_ping` is forwarded to
/// every opened channel (spec §4.A's handshake-skip option).
pub async fn start_tunnel(
    proxy_addr: &str,
    scopes: &[String],
    no_ping: bool,
) -> Result<HashMap<String, Arc<Channel>>> {
    let stream = TcpStream::connect(proxy_addr).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| RpcError::Transport(std::io::Error::other(e)))?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            warn!(error = %e, "CONNECT tunnel connection driver error");
        }
    });

    let request = Request::builder()
        .method(Method::CONNECT)
        .uri(proxy_addr)
        .header("scopes", scopes.join(","))
        .body(Empty::<Bytes>::new())
        .map_err(|e| RpcError::Handshake(e.to_string()))?;

    let mut response = sender
        .send_request(request)
        .await
        .map_err(|e| RpcError::Transport(std::io::Error::other(e)))?;

    if response.status() != hyper::StatusCode::OK {
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        let detail = String::from_utf8_lossy(&body).into_owned();
        return Err(RpcError::Handshake(format!("CONNECT tunnel refused: {status} {detail}")));
    }

    let upgraded = hyper::upgrade::on(&mut response)
        .await
        .map_err(|e| RpcError::Transport(std::io::Error::other(e)))?;
    let physical = StatefulTransport::from_duplex(TokioIo::new(upgraded));

    let mut scoped = multiplex::multiplex(physical.duplex(), false, scopes);
    let mut channels = HashMap::with_capacity(scopes.len());
    for scope in scopes {
        let Some(transport) = scoped.remove(scope) else { continue };
        let channel = Channel::open_client(Transport::Stateful(transport), scope.clone(), no_ping);
        channels.insert(scope.clone(), channel);
    }
    Ok(channels)
}
