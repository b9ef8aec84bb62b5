//! In-memory duplex pair used by the proxy's `avro/json` bridge.
//!
//! Spec §9: "any bounded queue-based channel pair that preserves order
//! and signals closure." `tokio::io::duplex` already provides exactly
//! that for byte-mode duplexes, so the pair is built on top of it and
//! wrapped with the same [`AvroFrameCodec`] every other stateful
//! transport uses.

use super::stateful::StatefulTransport;

/// Default buffer size for each half of an in-memory duplex pair.
pub const DEFAULT_BUFFER: usize = 64 * 1024;

/// Create a connected pair of stateful transports backed by an in-memory
/// duplex. Writes to one side become readable on the other in order;
/// dropping either half signals EOF to the other.
#[must_use]
pub fn memory_pair() -> (StatefulTransport, StatefulTransport) {
    let (a, b) = tokio::io::duplex(DEFAULT_BUFFER);
    (StatefulTransport::from_duplex(a), StatefulTransport::from_duplex(b))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn memory_pair_delivers_frames_in_order() {
        let (client, server) = memory_pair();
        let first = vec![Bytes::from_static(b"one")];
        let second = vec![Bytes::from_static(b"two")];
        client.duplex().send(first.clone()).await.expect("send first");
        client.duplex().send(second.clone()).await.expect("send second");

        let got_first = server.duplex().recv().await.expect("recv").expect("frames");
        let got_second = server.duplex().recv().await.expect("recv").expect("frames");
        assert_eq!(got_first, first);
        assert_eq!(got_second, second);
    }
}
