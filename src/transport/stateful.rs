//! Stateful transport: a long-lived duplex multiplexing many calls.
//!
//! Spec §4.A: "a duplex stream ... many calls may be multiplexed on one
//! stream. A handshake is exchanged once, on channel open." Wraps any
//! `AsyncRead + AsyncWrite` byte duplex with the [`AvroFrameCodec`], or an
//! already-framed object-mode channel (used for the WebSocket proxy
//! handler, where each WS binary message is already one frame sequence).

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, mpsc},
};
use tokio_util::codec::Framed;

use super::Duplex;
use crate::{
    codec::{AvroFrameCodec, FrameSequence},
    error::{Result, RpcError},
};

/// A stateful transport: either a framed byte duplex or an object-mode
/// channel of already-assembled frame sequences.
pub struct StatefulTransport {
    duplex: Arc<dyn Duplex>,
    object_mode: bool,
}

impl StatefulTransport {
    /// Wrap a byte-mode `AsyncRead + AsyncWrite` duplex (a TCP socket, a
    /// CONNECT-tunnelled socket, an in-memory duplex pair, ...) with the
    /// Avro RPC frame codec.
    pub fn from_duplex<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(io, AvroFrameCodec::new());
        let (sink, stream) = framed.split();
        Self {
            duplex: Arc::new(FramedDuplex {
                sink: Mutex::new(sink),
                stream: Mutex::new(stream),
            }),
            object_mode: false,
        }
    }

    /// Wrap an already object-mode channel of frame sequences, e.g. a
    /// WebSocket connection where each binary message is one frame
    /// sequence.
    #[must_use]
    pub fn from_object_channel(
        outgoing: mpsc::Sender<FrameSequence>,
        incoming: mpsc::Receiver<FrameSequence>,
    ) -> Self {
        Self {
            duplex: Arc::new(ObjectDuplex {
                outgoing,
                incoming: Mutex::new(incoming),
            }),
            object_mode: true,
        }
    }

    /// Wrap an already-constructed duplex without building a fresh codec
    /// around it. Used by the proxy's scope multiplexer
    /// (`crate::proxy::multiplex`), where several logical transports — one
    /// per scope — share one physical CONNECT-tunnelled socket or
    /// WebSocket connection.
    #[must_use]
    pub(crate) fn from_shared(duplex: Arc<dyn Duplex>, object_mode: bool) -> Self {
        Self { duplex, object_mode }
    }

    /// Whether this transport passes whole frame sequences rather than
    /// length-prefixed bytes.
    #[must_use]
    pub const fn object_mode(&self) -> bool { self.object_mode }

    /// Access the underlying duplex for send/recv.
    #[must_use]
    pub fn duplex(&self) -> Arc<dyn Duplex> { Arc::clone(&self.duplex) }
}

struct FramedDuplex<T> {
    sink: Mutex<futures::stream::SplitSink<Framed<T, AvroFrameCodec>, FrameSequence>>,
    stream: Mutex<futures::stream::SplitStream<Framed<T, AvroFrameCodec>>>,
}

#[async_trait]
impl<T> Duplex for FramedDuplex<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frames: FrameSequence) -> Result<()> {
        self.sink.lock().await.send(frames).await
    }

    async fn recv(&self) -> Result<Option<FrameSequence>> {
        match self.stream.lock().await.next().await {
            Some(Ok(frames)) => Ok(Some(frames)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

struct ObjectDuplex {
    outgoing: mpsc::Sender<FrameSequence>,
    incoming: Mutex<mpsc::Receiver<FrameSequence>>,
}

#[async_trait]
impl Duplex for ObjectDuplex {
    async fn send(&self, frames: FrameSequence) -> Result<()> {
        self.outgoing
            .send(frames)
            .await
            .map_err(|_| RpcError::ChannelClosed)
    }

    async fn recv(&self) -> Result<Option<FrameSequence>> { Ok(self.incoming.lock().await.recv().await) }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn byte_duplex_round_trips_a_frame_sequence() {
        let (a, b) = duplex(4096);
        let ta = StatefulTransport::from_duplex(a);
        let tb = StatefulTransport::from_duplex(b);

        let frames = vec![Bytes::from_static(b"hello")];
        ta.duplex().send(frames.clone()).await.expect("send");
        let received = tb.duplex().recv().await.expect("recv").expect("some frames");
        assert_eq!(received, frames);
    }

    #[tokio::test]
    async fn recv_propagates_a_transport_read_error() {
        let io = tokio_test::io::Builder::new()
            .read_error(std::io::Error::other("boom"))
            .build();
        let transport = StatefulTransport::from_duplex(io);
        let err = transport.duplex().recv().await.expect_err("read error should surface");
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn object_channel_round_trips_a_frame_sequence() {
        let (tx_a, rx_b) = mpsc::channel(8);
        let (tx_b, rx_a) = mpsc::channel(8);
        let ta = StatefulTransport::from_object_channel(tx_a, rx_a);
        let tb = StatefulTransport::from_object_channel(tx_b, rx_b);
        assert!(ta.object_mode());

        let frames = vec![Bytes::from_static(b"ping")];
        ta.duplex().send(frames.clone()).await.expect("send");
        let received = tb.duplex().recv().await.expect("recv").expect("some frames");
        assert_eq!(received, frames);
    }
}
