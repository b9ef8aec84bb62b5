//! WebSocket-upgrade entry point (spec §4.G): an object-mode duplex
//! where each binary message carries exactly one complete frame
//! sequence, bridged into the scope multiplexer the same way a
//! `CONNECT` tunnel's raw byte stream is.

use std::sync::Arc;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Proxy, bind_transport_to_scopes, header_map_to_call_headers, parse_scopes};
use crate::{codec::AvroFrameCodec, transport::StatefulTransport};

const QUEUE_DEPTH: usize = 64;

/// Axum handler for a WebSocket-upgrade scope request.
pub async fn handle_websocket(
    State(proxy): State<Arc<Proxy>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let call_headers = header_map_to_call_headers(&headers);
    let hook = match proxy.admit(&call_headers).await {
        Ok(hook) => hook,
        Err(_) => return (StatusCode::FORBIDDEN, "receiver denied").into_response(),
    };

    let scopes_header = headers.get("scopes").and_then(|v| v.to_str().ok());
    let scopes = parse_scopes(scopes_header, &path);
    if scopes.is_empty() {
        return (StatusCode::BAD_REQUEST, "no scope requested").into_response();
    }
    if let Some(unknown) = scopes.iter().find(|s| !proxy.has_scope(s)) {
        warn!(scope = %unknown, "WebSocket upgrade requested an unbound scope");
        return (StatusCode::NOT_FOUND, "unknown scope").into_response();
    }

    ws.on_upgrade(move |socket| async move {
        bridge(&proxy, socket, scopes, hook).await;
    })
}

async fn bridge(proxy: &Arc<Proxy>, socket: WebSocket, scopes: Vec<String>, hook: Option<crate::client::ChannelListener>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (to_ws_tx, mut to_ws_rx) = mpsc::channel::<crate::codec::FrameSequence>(QUEUE_DEPTH);
    let (from_ws_tx, from_ws_rx) = mpsc::channel::<crate::codec::FrameSequence>(QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        let mut codec = AvroFrameCodec::new();
        while let Some(frames) = to_ws_rx.recv().await {
            let mut buf = BytesMut::new();
            if codec.encode(frames, &mut buf).is_err() {
                warn!("failed to encode an outgoing WebSocket frame sequence");
                continue;
            }
            if ws_sink.send(Message::Binary(buf.freeze())).await.is_err() {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        let mut codec = AvroFrameCodec::new();
        while let Some(Ok(message)) = ws_stream.next().await {
            let Message::Binary(bytes) = message else { continue };
            let mut buf = BytesMut::from(bytes.as_ref());
            match codec.decode(&mut buf) {
                Ok(Some(frames)) => {
                    if from_ws_tx.send(frames).await.is_err() {
                        break;
                    }
                }
                Ok(None) => warn!("incomplete frame sequence in a WebSocket message"),
                Err(e) => {
                    warn!(error = %e, "malformed WebSocket frame sequence");
                    break;
                }
            }
        }
    });

    let transport = StatefulTransport::from_object_channel(to_ws_tx, from_ws_rx);
    bind_transport_to_scopes(proxy, transport.duplex(), true, scopes, hook).await;

    let _ = writer.await;
    let _ = reader.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scopes_rejects_an_empty_path() {
        assert!(parse_scopes(None, "").is_empty());
    }
}
