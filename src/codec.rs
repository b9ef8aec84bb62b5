//! Avro RPC wire framing and the handshake schema.
//!
//! Avro RPC frames a logical request or response as a sequence of
//! length-prefixed buffers terminated by a zero-length buffer (the "frame
//! sequence"). This mirrors the header-validation and multi-fragment
//! reassembly shape this codebase's binary protocol codec uses, adapted
//! from a fixed 20-byte header to Avro RPC's simpler 4-byte length
//! prefixes.

use std::collections::VecDeque;

use apache_avro::{Schema, from_avro_datum, to_avro_datum, types::Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, RpcError};

/// Maximum bytes accepted for a single buffer within a frame sequence.
///
/// Guards against a corrupt or hostile peer claiming an unbounded length
/// prefix; chosen generously relative to typical Avro RPC payloads.
pub const MAX_BUFFER_LEN: u32 = 16 * 1024 * 1024;

/// One logical Avro RPC message: the ordered buffers between two
/// zero-length terminators.
pub type FrameSequence = Vec<Bytes>;

#[derive(Debug, Default)]
enum ReadState {
    #[default]
    Length,
    Payload(u32),
}

/// `tokio_util::codec::{Decoder, Encoder}` implementation for Avro RPC's
/// length-prefixed framing.
#[derive(Debug, Default)]
pub struct AvroFrameCodec {
    state: ReadState,
    buffers: VecDeque<Bytes>,
}

impl AvroFrameCodec {
    /// Construct a fresh codec with no partially-read frame state.
    #[must_use]
    pub fn new() -> Self { Self::default() }
}

impl Decoder for AvroFrameCodec {
    type Error = RpcError;
    type Item = FrameSequence;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ReadState::Length => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let len = src.get_u32();
                    if len > MAX_BUFFER_LEN {
                        return Err(RpcError::Codec(format!(
                            "frame buffer length {len} exceeds maximum {MAX_BUFFER_LEN}"
                        )));
                    }
                    if len == 0 {
                        let frames: Vec<Bytes> = self.buffers.drain(..).collect();
                        return Ok(Some(frames));
                    }
                    self.state = ReadState::Payload(len);
                }
                ReadState::Payload(len) => {
                    let len = len as usize;
                    if src.len() < len {
                        return Ok(None);
                    }
                    let chunk = src.split_to(len).freeze();
                    self.buffers.push_back(chunk);
                    self.state = ReadState::Length;
                }
            }
        }
    }
}

impl Encoder<FrameSequence> for AvroFrameCodec {
    type Error = RpcError;

    fn encode(&mut self, item: FrameSequence, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        for buf in &item {
            dst.put_u32(
                u32::try_from(buf.len())
                    .map_err(|_| RpcError::Codec("buffer too large to frame".to_owned()))?,
            );
            dst.put_slice(buf);
        }
        dst.put_u32(0);
        Ok(())
    }
}

/// Concatenate a frame sequence's buffers into one contiguous payload.
#[must_use]
pub fn flatten(frames: &FrameSequence) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames.iter().map(Bytes::len).sum());
    for frame in frames {
        out.extend_from_slice(frame);
    }
    out
}

/// Split a flat payload into one or more frames no larger than
/// `max_frame_len`, matching how a stateful transport fragments a large
/// request across several physical writes.
#[must_use]
pub fn chunk(payload: &[u8], max_frame_len: usize) -> FrameSequence {
    if payload.is_empty() {
        return vec![Bytes::new()];
    }
    payload
        .chunks(max_frame_len.max(1))
        .map(|c| Bytes::copy_from_slice(c))
        .collect()
}

/// Outcome of a handshake exchange, from the client's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// The server recognised the client's protocol hash; only the hash
    /// needs to be sent on subsequent calls.
    Both,
    /// The server's protocol differs but is compatible; the client
    /// protocol was required and accepted.
    Client,
    /// The server does not recognise this protocol at all; the channel
    /// must abort.
    None,
}

/// Client handshake request: protocol hash, plus the full protocol
/// document when the server has not already cached it.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// MD5 hash of the client's canonical protocol JSON.
    pub client_hash: [u8; 16],
    /// The full protocol document, sent once per channel (or always, for
    /// stateless transports).
    pub client_protocol: Option<String>,
    /// MD5 hash of the protocol the client last received from this
    /// server, if any.
    pub server_hash: Option<[u8; 16]>,
}

/// Server handshake response.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    /// Whether the client's protocol hash/document matched the server's.
    pub matched: HandshakeMatch,
    /// The server's protocol document, included when `matched` is not
    /// [`HandshakeMatch::Both`].
    pub server_protocol: Option<String>,
    /// The server's protocol hash.
    pub server_hash: Option<[u8; 16]>,
    /// `unknownProtocol` diagnostic message, present only when `matched`
    /// is [`HandshakeMatch::None`].
    pub error: Option<String>,
}

fn handshake_request_schema() -> Schema {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "HandshakeRequest",
            "fields": [
                {"name": "clientHash", "type": {"type": "fixed", "name": "MD5", "size": 16}},
                {"name": "clientProtocol", "type": ["null", "string"], "default": null},
                {"name": "serverHash", "type": ["null", "MD5"], "default": null}
            ]
        }"#,
    )
    .unwrap_or(Schema::Null)
}

fn handshake_response_schema() -> Schema {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "HandshakeResponse",
            "fields": [
                {"name": "match", "type": {"type": "enum", "name": "HandshakeMatch", "symbols": ["BOTH", "CLIENT", "NONE"]}},
                {"name": "serverProtocol", "type": ["null", "string"], "default": null},
                {"name": "serverHash", "type": ["null", "MD5"], "default": null},
                {"name": "meta", "type": ["null", "string"], "default": null}
            ]
        }"#,
    )
    .unwrap_or(Schema::Null)
}

impl HandshakeRequest {
    /// Encode this handshake request to its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] on an internal encode failure.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let value = Value::Record(vec![
            ("clientHash".to_owned(), Value::Fixed(16, self.client_hash.to_vec())),
            (
                "clientProtocol".to_owned(),
                match &self.client_protocol {
                    Some(p) => Value::Union(1, Box::new(Value::String(p.clone()))),
                    None => Value::Union(0, Box::new(Value::Null)),
                },
            ),
            (
                "serverHash".to_owned(),
                match self.server_hash {
                    Some(h) => Value::Union(1, Box::new(Value::Fixed(16, h.to_vec()))),
                    None => Value::Union(0, Box::new(Value::Null)),
                },
            ),
        ]);
        to_avro_datum(&handshake_request_schema(), value).map_err(|e| RpcError::Codec(e.to_string()))
    }

    /// Decode a handshake request from its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if `bytes` does not decode as a valid
    /// handshake request.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let schema = handshake_request_schema();
        let mut reader = bytes;
        let value =
            from_avro_datum(&schema, &mut reader, None).map_err(|e| RpcError::Codec(e.to_string()))?;
        decode_request_value(&value)
    }
}

fn decode_request_value(value: &Value) -> Result<HandshakeRequest> {
    let Value::Record(fields) = value else {
        return Err(RpcError::Codec("handshake request must be a record".to_owned()));
    };
    let mut client_hash = None;
    let mut client_protocol = None;
    let mut server_hash = None;
    for (name, v) in fields {
        match name.as_str() {
            "clientHash" => client_hash = Some(fixed16(v)?),
            "clientProtocol" => client_protocol = optional_string(v)?,
            "serverHash" => server_hash = optional_fixed16(v)?,
            _ => {}
        }
    }
    Ok(HandshakeRequest {
        client_hash: client_hash.ok_or_else(|| RpcError::Codec("missing clientHash".to_owned()))?,
        client_protocol,
        server_hash,
    })
}

fn fixed16(value: &Value) -> Result<[u8; 16]> {
    match value {
        Value::Fixed(16, bytes) => {
            let mut out = [0u8; 16];
            out.copy_from_slice(bytes);
            Ok(out)
        }
        _ => Err(RpcError::Codec("expected 16-byte fixed field".to_owned())),
    }
}

fn optional_fixed16(value: &Value) -> Result<Option<[u8; 16]>> {
    match value {
        Value::Union(_, inner) => match inner.as_ref() {
            Value::Null => Ok(None),
            other => Ok(Some(fixed16(other)?)),
        },
        other => Ok(Some(fixed16(other)?)),
    }
}

fn optional_string(value: &Value) -> Result<Option<String>> {
    match value {
        Value::Union(_, inner) => match inner.as_ref() {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            _ => Err(RpcError::Codec("expected string field".to_owned())),
        },
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err(RpcError::Codec("expected string field".to_owned())),
    }
}

impl HandshakeResponse {
    /// Encode this handshake response to its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] on an internal encode failure.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let match_symbol = match self.matched {
            HandshakeMatch::Both => "BOTH",
            HandshakeMatch::Client => "CLIENT",
            HandshakeMatch::None => "NONE",
        };
        let match_index = match self.matched {
            HandshakeMatch::Both => 0,
            HandshakeMatch::Client => 1,
            HandshakeMatch::None => 2,
        };
        let value = Value::Record(vec![
            (
                "match".to_owned(),
                Value::Enum(match_index, match_symbol.to_owned()),
            ),
            (
                "serverProtocol".to_owned(),
                match &self.server_protocol {
                    Some(p) => Value::Union(1, Box::new(Value::String(p.clone()))),
                    None => Value::Union(0, Box::new(Value::Null)),
                },
            ),
            (
                "serverHash".to_owned(),
                match self.server_hash {
                    Some(h) => Value::Union(1, Box::new(Value::Fixed(16, h.to_vec()))),
                    None => Value::Union(0, Box::new(Value::Null)),
                },
            ),
            (
                "meta".to_owned(),
                match &self.error {
                    Some(m) => Value::Union(1, Box::new(Value::String(m.clone()))),
                    None => Value::Union(0, Box::new(Value::Null)),
                },
            ),
        ]);
        to_avro_datum(&handshake_response_schema(), value).map_err(|e| RpcError::Codec(e.to_string()))
    }

    /// Decode a handshake response from its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if `bytes` does not decode as a valid
    /// handshake response.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let schema = handshake_response_schema();
        let mut reader = bytes;
        let value =
            from_avro_datum(&schema, &mut reader, None).map_err(|e| RpcError::Codec(e.to_string()))?;
        let Value::Record(fields) = value else {
            return Err(RpcError::Codec("handshake response must be a record".to_owned()));
        };
        let mut matched = None;
        let mut server_protocol = None;
        let mut server_hash = None;
        let mut error = None;
        for (name, v) in fields {
            match name.as_str() {
                "match" => matched = Some(parse_match(&v)?),
                "serverProtocol" => server_protocol = optional_string(&v)?,
                "serverHash" => server_hash = optional_fixed16(&v)?,
                "meta" => error = optional_string(&v)?,
                _ => {}
            }
        }
        Ok(Self {
            matched: matched.ok_or_else(|| RpcError::Codec("missing match field".to_owned()))?,
            server_protocol,
            server_hash,
            error,
        })
    }
}

fn parse_match(value: &Value) -> Result<HandshakeMatch> {
    match value {
        Value::Enum(_, symbol) => match symbol.as_str() {
            "BOTH" => Ok(HandshakeMatch::Both),
            "CLIENT" => Ok(HandshakeMatch::Client),
            "NONE" => Ok(HandshakeMatch::None),
            other => Err(RpcError::Codec(format!("unknown match symbol {other}"))),
        },
        _ => Err(RpcError::Codec("match field must be an enum".to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Any sequence of buffers the encoder writes decodes back to
        /// itself, whatever their count and sizes (spec §8's "round-trip"
        /// invariant, applied to the frame codec rather than an Avro value).
        #[test]
        fn roundtrips_any_frame_sequence(buffers in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..256), 0..8)) {
            let frames: FrameSequence = buffers.into_iter().map(Bytes::from).collect();
            let mut codec = AvroFrameCodec::new();
            let mut buf = BytesMut::new();
            codec.encode(frames.clone(), &mut buf).expect("encode");
            let decoded = codec.decode(&mut buf).expect("decode").expect("some frames");
            prop_assert_eq!(decoded, frames);
            prop_assert!(buf.is_empty());
        }
    }

    #[test]
    fn frame_codec_round_trips_a_sequence() {
        let mut codec = AvroFrameCodec::new();
        let mut buf = BytesMut::new();
        let frames = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")];
        codec.encode(frames.clone(), &mut buf).expect("encode");

        let decoded = codec.decode(&mut buf).expect("decode").expect("some frames");
        assert_eq!(decoded, frames);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_codec_waits_for_more_data() {
        let mut codec = AvroFrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"hel");
        let decoded = codec.decode(&mut buf).expect("decode");
        assert!(decoded.is_none());
    }

    #[test]
    fn handshake_request_round_trips() {
        let req = HandshakeRequest {
            client_hash: [7u8; 16],
            client_protocol: Some("{}".to_owned()),
            server_hash: None,
        };
        let bytes = req.encode().expect("encode");
        let decoded = HandshakeRequest::decode(&bytes).expect("decode");
        assert_eq!(decoded.client_hash, [7u8; 16]);
        assert_eq!(decoded.client_protocol.as_deref(), Some("{}"));
        assert!(decoded.server_hash.is_none());
    }

    #[test]
    fn handshake_response_round_trips_none_match() {
        let resp = HandshakeResponse {
            matched: HandshakeMatch::None,
            server_protocol: None,
            server_hash: None,
            error: Some("unknownProtocol".to_owned()),
        };
        let bytes = resp.encode().expect("encode");
        let decoded = HandshakeResponse::decode(&bytes).expect("decode");
        assert_eq!(decoded.matched, HandshakeMatch::None);
        assert_eq!(decoded.error.as_deref(), Some("unknownProtocol"));
    }
}
