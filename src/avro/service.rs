//! Compiled representation of an Avro protocol.

use apache_avro::Schema;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::message::Message;
use crate::error::{Result, RpcError};

/// Options accepted by [`Service::create_client`] and
/// [`Service::create_server`].
///
/// Mirrors the options table in the runtime's component design: strict
/// ingress typing, strict error-variant enforcement, and queueing of
/// calls emitted before any channel is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceOptions {
    /// Reject implicit coercions on ingress.
    pub strict_types: bool,
    /// Require declared error variants to be used; anything else is
    /// normalized to a `system` error.
    pub strict_errors: bool,
    /// Queue calls emitted before a channel is open, flushing them in
    /// call order once the handshake completes.
    pub buffering: bool,
}

/// A compiled Avro protocol: a named, ordered set of [`Message`]
/// definitions plus the named types they reference.
///
/// `Service` is immutable after construction — protocols are parsed once
/// (assumed to be produced by an external Avro IDL layer, out of scope
/// here) and shared behind an `Arc` by every [`crate::client::Client`] and
/// [`crate::server::Server`] built from them.
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
    protocol: Json,
    messages: IndexMap<String, Message>,
    types: IndexMap<String, Schema>,
}

/// Minimal JSON shape this crate accepts for a protocol document.
///
/// Full Avro IDL assembly is explicitly out of scope (it is assumed to be
/// produced by an external collaborator); this is only rich enough to
/// build [`Service`] values for tests, the demo binary, and callers who
/// already have request/response/error schemas in hand.
#[derive(Debug, Deserialize, Serialize)]
struct ProtocolDoc {
    protocol: String,
    #[serde(default)]
    types: IndexMap<String, Json>,
    #[serde(default)]
    messages: IndexMap<String, MessageDoc>,
}

#[derive(Debug, Deserialize, Serialize)]
struct MessageDoc {
    request: Json,
    response: Json,
    #[serde(default)]
    errors: Option<Json>,
    #[serde(default, rename = "one-way")]
    one_way: bool,
}

impl Service {
    /// Build a `Service` directly from already-compiled messages and
    /// types, without parsing a protocol document.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        protocol: Json,
        messages: IndexMap<String, Message>,
        types: IndexMap<String, Schema>,
    ) -> Self {
        Self {
            name: name.into(),
            protocol,
            messages,
            types,
        }
    }

    /// Parse a minimal protocol document (see [`ProtocolDoc`]) into a
    /// `Service`.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if the document is malformed or any
    /// declared schema fails to parse.
    pub fn from_protocol_json(doc_value: &Json) -> Result<Self> {
        let doc: ProtocolDoc =
            serde_json::from_value(doc_value.clone()).map_err(|e| RpcError::Codec(e.to_string()))?;

        let mut types = IndexMap::new();
        for (name, schema_json) in &doc.types {
            let schema = parse_schema(schema_json)?;
            types.insert(name.clone(), schema);
        }

        let mut messages = IndexMap::new();
        for (name, message_doc) in doc.messages {
            let request = parse_schema(&message_doc.request)?;
            let response = parse_schema(&message_doc.response)?;
            let error = match message_doc.errors {
                Some(errors_json) => parse_schema(&errors_json)?,
                None => default_error_schema(),
            };
            messages.insert(
                name.clone(),
                Message::new(name, message_doc.one_way, request, response, error),
            );
        }

        Ok(Self {
            name: doc.protocol,
            protocol: doc_value.clone(),
            messages,
            types,
        })
    }

    /// The protocol's canonical name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// The raw protocol document, if this `Service` was constructed with
    /// one.
    #[must_use]
    pub const fn protocol(&self) -> &Json { &self.protocol }

    /// Look up a message by name.
    #[must_use]
    pub fn message(&self, name: &str) -> Option<&Message> { self.messages.get(name) }

    /// Iterate messages in declaration order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> { self.messages.values() }

    /// Look up a named type.
    #[must_use]
    pub fn r#type(&self, name: &str) -> Option<&Schema> { self.types.get(name) }

    /// Build a [`crate::client::Client`] bound to this service.
    #[must_use]
    pub fn create_client(self: std::sync::Arc<Self>, opts: ServiceOptions) -> crate::client::Client {
        crate::client::Client::new(self, opts)
    }

    /// Build a [`crate::server::Server`] bound to this service.
    #[must_use]
    pub fn create_server(self: std::sync::Arc<Self>, opts: ServiceOptions) -> crate::server::Server {
        crate::server::Server::new(self, opts)
    }
}

fn parse_schema(json: &Json) -> Result<Schema> {
    Schema::parse_str(&json.to_string()).map_err(|e| RpcError::Codec(e.to_string()))
}

fn default_error_schema() -> Schema {
    Schema::parse_str(r#"["string"]"#).unwrap_or(Schema::String)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn math_protocol() -> Json {
        json!({
            "protocol": "Math",
            "messages": {
                "neg": {
                    "request": {"type": "record", "name": "NegRequest", "fields": [
                        {"name": "n", "type": "int"}
                    ]},
                    "response": "int",
                }
            }
        })
    }

    #[test]
    fn parses_minimal_protocol() {
        let service = Service::from_protocol_json(&math_protocol()).expect("parse");
        assert_eq!(service.name(), "Math");
        let neg = service.message("neg").expect("neg message");
        assert!(!neg.one_way());
    }

    #[test]
    fn unknown_message_is_none() {
        let service = Service::from_protocol_json(&math_protocol()).expect("parse");
        assert!(service.message("plus").is_none());
    }
}
