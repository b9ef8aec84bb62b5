//! `POST` entry point: `avro/binary` (stateless frame-sequence bridge)
//! and `avro/json` (human-readable bridge) content types (spec §4.G
//! `postRequestHandler`).
//!
//! Both content types dispatch straight through the target scope's
//! [`Server`] via [`crate::channel::RequestDispatcher::dispatch`],
//! skipping the channel/duplex layer entirely: a POST request has no
//! persistent connection to multiplex calls over, so there is nothing
//! for a [`crate::channel::Channel`] to add here that direct dispatch
//! does not already provide.

use std::{collections::HashMap, sync::Arc};

use apache_avro::types::Value;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Proxy, header_map_to_call_headers, parse_post_scope};
use crate::{
    channel::{RequestDispatcher, RequestEnvelope, Status, decode_request, encode_response},
    codec::AvroFrameCodec,
    server::Server,
};

/// Body shape accepted for `Content-Type: avro/json` (spec §4.G).
#[derive(Debug, Deserialize)]
struct JsonCall {
    message: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    request: serde_json::Value,
}

/// Body shape written back for `Content-Type: avro/json`.
#[derive(Debug, Serialize)]
struct JsonResult {
    headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

/// Axum handler for `POST` (spec §4.G `postRequestHandler`).
pub async fn handle_post(State(proxy): State<Arc<Proxy>>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let Some(scope) = parse_post_scope(proxy.post_scope_prefix(), uri.path()) else {
        return (StatusCode::NOT_FOUND, "unknown scope").into_response();
    };

    let call_headers = header_map_to_call_headers(&headers);
    if proxy.admit(&call_headers).await.is_err() {
        return (StatusCode::FORBIDDEN, "receiver denied").into_response();
    }

    let Some(server) = proxy.server_for(&scope) else {
        return (StatusCode::NOT_FOUND, "unknown scope").into_response();
    };

    match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some("avro/binary") => handle_binary(&server, &body).await,
        Some("avro/json") => handle_json(&server, &body).await,
        _ => (StatusCode::BAD_REQUEST, "unknown content type").into_response(),
    }
}

async fn handle_binary(server: &Arc<Server>, body: &[u8]) -> Response {
    let frames = match decode_frame_sequence(body) {
        Ok(frames) => frames,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("malformed frame sequence: {e}")).into_response(),
    };
    let request = match decode_request(&frames) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("malformed request envelope: {e}")).into_response(),
    };
    let response = server.dispatch(request, None).await;
    let response_frames = match encode_response(&response) {
        Ok(frames) => frames,
        Err(e) => {
            warn!(error = %e, "failed to encode avro/binary response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let mut codec = AvroFrameCodec::new();
    let mut buf = BytesMut::new();
    if codec.encode(response_frames, &mut buf).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(CONTENT_TYPE, "avro/binary")], buf.freeze()).into_response()
}

fn decode_frame_sequence(body: &[u8]) -> crate::error::Result<crate::codec::FrameSequence> {
    let mut codec = AvroFrameCodec::new();
    let mut buf = BytesMut::from(body);
    codec
        .decode(&mut buf)?
        .ok_or_else(|| crate::error::RpcError::Codec("incomplete frame sequence".to_owned()))
}

async fn handle_json(server: &Arc<Server>, body: &[u8]) -> Response {
    let call: JsonCall = match serde_json::from_slice(body) {
        Ok(call) => call,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("malformed avro/json body: {e}")).into_response(),
    };

    let Some(msg) = server.service().message(&call.message).cloned() else {
        return (StatusCode::BAD_REQUEST, format!("unknown message {}", call.message)).into_response();
    };

    let request_value = match apache_avro::to_value(call.request).and_then(|v| v.resolve(msg.request_type())) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("request does not match schema: {e}")).into_response(),
    };
    let payload = match msg.encode_request(&request_value) {
        Ok(p) => p,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let request = RequestEnvelope {
        id: 0,
        handshake: None,
        message: call.message.clone(),
        payload,
        headers: call.headers.into_iter().map(|(k, v)| (k, v.into_bytes())).collect(),
        one_way: msg.one_way(),
    };
    let response = server.dispatch(request, None).await;

    let response_headers: HashMap<String, String> = response
        .headers
        .into_iter()
        .filter_map(|(k, v)| String::from_utf8(v).ok().map(|v| (k, v)))
        .collect();

    let (response_json, error_json) = match response.status {
        Status::Success => (decode_to_json(&msg.decode_response(&response.payload)), None),
        Status::Application => (None, decode_to_json(&msg.decode_error(&response.payload))),
        Status::System => (
            None,
            crate::channel::decode_system_error(&response.payload).ok().map(serde_json::Value::String),
        ),
    };

    let out = JsonResult {
        headers: response_headers,
        response: response_json,
        error: error_json,
    };
    let Ok(body) = serde_json::to_vec(&out) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    ([(CONTENT_TYPE, "avro/json")], body).into_response()
}

fn decode_to_json(value: &crate::error::Result<Value>) -> Option<serde_json::Value> {
    value.as_ref().ok().and_then(|v| serde_json::Value::try_from(v.clone()).ok())
}

#[cfg(test)]
mod tests {
    use apache_avro::Schema;
    use indexmap::IndexMap;

    use super::*;
    use crate::avro::{Message, Service, ServiceOptions};

    fn neg_server() -> Arc<Server> {
        let mut messages = IndexMap::new();
        messages.insert(
            "neg".to_owned(),
            Message::new("neg".to_owned(), false, Schema::Int, Schema::Int, Schema::String),
        );
        let service = Arc::new(Service::new(
            "Math",
            serde_json::json!({"protocol": "Math"}),
            messages,
            IndexMap::new(),
        ));
        let mut server = Server::new(service, ServiceOptions::default());
        server.on_message("neg", |_ctx, req| async move {
            let Value::Int(n) = req else {
                return Err(crate::error::RpcError::System("expected int".to_owned()));
            };
            Ok(Value::Int(-n))
        });
        Arc::new(server)
    }

    #[tokio::test]
    async fn json_round_trip_negates_a_number() {
        use http_body_util::BodyExt as _;

        let server = neg_server();
        let body = serde_json::json!({"message": "neg", "request": 7}).to_string();
        let response = handle_json(&server, body.as_bytes()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.expect("collect body").to_bytes();
        let out: serde_json::Value = serde_json::from_slice(&bytes).expect("parse json body");
        assert_eq!(out["response"], serde_json::json!(-7));
        assert!(out.get("error").is_none());
    }

    #[tokio::test]
    async fn json_rejects_an_unknown_message() {
        let server = neg_server();
        let body = serde_json::json!({"message": "plus", "request": 1}).to_string();
        let response = handle_json(&server, body.as_bytes()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
