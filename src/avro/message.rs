//! Compiled representation of one Avro protocol message.

use apache_avro::{Schema, from_avro_datum, to_avro_datum, types::Value};

use crate::error::{Result, RpcError};

/// One message declared by a [`super::Service`]'s protocol.
///
/// A message owns the three schemas the wire protocol encodes against:
/// the request record, the response type, and the (usually unioned)
/// error type. `oneWay` messages never produce a response.
#[derive(Debug, Clone)]
pub struct Message {
    name: String,
    one_way: bool,
    request_type: Schema,
    response_type: Schema,
    error_type: Schema,
}

impl Message {
    /// Build a message from its name and declared schemas.
    #[must_use]
    pub const fn new(
        name: String,
        one_way: bool,
        request_type: Schema,
        response_type: Schema,
        error_type: Schema,
    ) -> Self {
        Self {
            name,
            one_way,
            request_type,
            response_type,
            error_type,
        }
    }

    /// The message name, as declared in the protocol document.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Whether this message never produces a response.
    #[must_use]
    pub const fn one_way(&self) -> bool { self.one_way }

    /// The request record schema.
    #[must_use]
    pub const fn request_type(&self) -> &Schema { &self.request_type }

    /// The response schema.
    #[must_use]
    pub const fn response_type(&self) -> &Schema { &self.response_type }

    /// The error (typically unioned) schema.
    #[must_use]
    pub const fn error_type(&self) -> &Schema { &self.error_type }

    /// Encode a request record to its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if `value` does not conform to
    /// [`Self::request_type`].
    pub fn encode_request(&self, value: &Value) -> Result<Vec<u8>> {
        encode(&self.request_type, value)
    }

    /// Decode a request record from its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if `bytes` is not a valid encoding of
    /// [`Self::request_type`].
    pub fn decode_request(&self, bytes: &[u8]) -> Result<Value> { decode(&self.request_type, bytes) }

    /// Encode a response value to its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if `value` does not conform to
    /// [`Self::response_type`].
    pub fn encode_response(&self, value: &Value) -> Result<Vec<u8>> {
        encode(&self.response_type, value)
    }

    /// Decode a response value from its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if `bytes` is not a valid encoding of
    /// [`Self::response_type`].
    pub fn decode_response(&self, bytes: &[u8]) -> Result<Value> { decode(&self.response_type, bytes) }

    /// Encode a declared error value to its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if `value` does not conform to
    /// [`Self::error_type`].
    pub fn encode_error(&self, value: &Value) -> Result<Vec<u8>> { encode(&self.error_type, value) }

    /// Decode a declared error value from its Avro binary form.
    ///
    /// # Errors
    /// Returns [`RpcError::Codec`] if `bytes` is not a valid encoding of
    /// [`Self::error_type`].
    pub fn decode_error(&self, bytes: &[u8]) -> Result<Value> { decode(&self.error_type, bytes) }
}

fn encode(schema: &Schema, value: &Value) -> Result<Vec<u8>> {
    to_avro_datum(schema, value.clone()).map_err(|e| RpcError::Codec(e.to_string()))
}

fn decode(schema: &Schema, bytes: &[u8]) -> Result<Value> {
    let mut reader = bytes;
    from_avro_datum(schema, &mut reader, None).map_err(|e| RpcError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use apache_avro::schema::Schema;

    use super::*;

    fn int_schema() -> Schema { Schema::parse_str("\"int\"").expect("parse schema") }

    #[test]
    fn round_trips_request_value() {
        let message = Message::new(
            "neg".to_owned(),
            false,
            int_schema(),
            int_schema(),
            Schema::parse_str(r#"["string"]"#).expect("parse error schema"),
        );
        let bytes = message.encode_request(&Value::Int(10)).expect("encode");
        let decoded = message.decode_request(&bytes).expect("decode");
        assert_eq!(decoded, Value::Int(10));
    }

    #[test]
    fn one_way_flag_is_preserved() {
        let message = Message::new(
            "notify".to_owned(),
            true,
            int_schema(),
            Schema::Null,
            Schema::parse_str(r#"["string"]"#).expect("parse error schema"),
        );
        assert!(message.one_way());
    }
}
