//! `CONNECT` tunnel entry point (spec §4.G): the client opens a raw
//! byte-stream tunnel to one or more scopes, tagged by the `scopes`
//! header or the `+`-joined request-target path.
//!
//! Unlike `POST` and the WebSocket upgrade, a `CONNECT` request's
//! authority-form target carries no meaningful path for axum's router to
//! match against, so this handler runs directly inside the raw hyper
//! per-connection service built by [`super::Proxy::serve`], ahead of the
//! axum router.

use std::sync::Arc;

use http::{HeaderMap, header};
use hyper::{Request, Response, StatusCode, body::Incoming, ext::ReasonPhrase};
use hyper_util::rt::TokioIo;
use tracing::warn;

use super::{Proxy, bind_transport_to_scopes, header_map_to_call_headers, parse_scopes};
use crate::transport::StatefulTransport;

fn text_response(status: StatusCode, body: &'static str) -> Response<axum::body::Body> {
    Response::builder()
        .status(status)
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| Response::new(axum::body::Body::from(body)))
}

/// Handle one `CONNECT` request: admit, resolve scopes, and on success
/// answer `200 Connection Established` then hand the upgraded socket to
/// the scope multiplexer once the client starts reading it.
pub async fn handle_connect(proxy: &Arc<Proxy>, req: Request<Incoming>) -> Response<axum::body::Body> {
    let call_headers = header_map_to_call_headers(req.headers());
    let hook = match proxy.admit(&call_headers).await {
        Ok(hook) => hook,
        Err(_) => return text_response(StatusCode::FORBIDDEN, "receiver denied"),
    };

    let scopes_header = req.headers().get("scopes").and_then(|v| v.to_str().ok());
    let scopes = parse_scopes(scopes_header, req.uri().path());
    if scopes.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "no scope requested");
    }
    if let Some(unknown) = scopes.iter().find(|s| !proxy.has_scope(s)) {
        warn!(scope = %unknown, "CONNECT requested an unbound scope");
        return text_response(StatusCode::NOT_FOUND, "unknown scope");
    }

    // A CONNECT request establishing a tunnel carries no body (spec
    // §4.G, §8: "CONNECT with trailing data -> 400 Bad Request"); a
    // declared body is the signal available at the header-parsing stage,
    // before any bytes are read, that the client is not speaking a plain
    // tunnel request.
    if has_declared_body(req.headers()) {
        return text_response(StatusCode::BAD_REQUEST, "unexpected data before tunnel established");
    }

    let proxy = Arc::clone(proxy);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let transport = StatefulTransport::from_duplex(io);
                bind_transport_to_scopes(&proxy, transport.duplex(), false, scopes, hook).await;
            }
            Err(e) => warn!(error = %e, "CONNECT upgrade failed"),
        }
    });

    let mut response = Response::new(axum::body::Body::empty());
    *response.status_mut() = StatusCode::OK;
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Whether a request's headers declare a body via `Content-Length`
/// (non-zero) or `Transfer-Encoding`, either of which a well-formed
/// CONNECT request must not carry.
fn has_declared_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_response_carries_the_requested_status() {
        let response = text_response(StatusCode::FORBIDDEN, "nope");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    fn headers_with(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(name.clone(), value.parse().expect("valid header value"));
        }
        headers
    }

    #[test]
    fn no_body_headers_is_not_a_declared_body() {
        assert!(!has_declared_body(&headers_with(&[])));
    }

    #[test]
    fn a_zero_content_length_is_not_a_declared_body() {
        assert!(!has_declared_body(&headers_with(&[(header::CONTENT_LENGTH, "0")])));
    }

    #[test]
    fn a_nonzero_content_length_is_a_declared_body() {
        assert!(has_declared_body(&headers_with(&[(header::CONTENT_LENGTH, "12")])));
    }

    #[test]
    fn transfer_encoding_is_a_declared_body() {
        assert!(has_declared_body(&headers_with(&[(header::TRANSFER_ENCODING, "chunked")])));
    }
}
