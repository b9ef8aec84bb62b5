//! Transport adapters: the uniform duplex surface a [`crate::channel::Channel`]
//! drives, normalizing stateless (handshake-per-call) and stateful
//! (handshake-once) wire shapes.

pub mod memory;
pub mod stateful;
pub mod stateless;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::memory_pair;
pub use stateful::StatefulTransport;
pub use stateless::{StatelessFactory, StatelessSink};

use crate::{codec::FrameSequence, error::Result};

/// A transport as seen by a [`crate::channel::Channel`]: either a
/// per-call sink factory (stateless) or a long-lived duplex (stateful).
pub enum Transport {
    /// One fresh sink per logical call; the handshake rides inside every
    /// request.
    Stateless(Box<dyn StatelessFactory>),
    /// A long-lived duplex multiplexing many calls; the handshake runs
    /// once unless `noPing` is set.
    Stateful(StatefulTransport),
}

impl Transport {
    /// Whether this transport multiplexes many calls over one connection.
    #[must_use]
    pub const fn is_stateful(&self) -> bool { matches!(self, Self::Stateful(_)) }

    /// Whether frames on this transport carry whole Avro values rather
    /// than length-prefixed byte buffers.
    #[must_use]
    pub fn object_mode(&self) -> bool {
        match self {
            Self::Stateless(_) => false,
            Self::Stateful(s) => s.object_mode(),
        }
    }
}

/// A duplex, byte- or object-mode, that a stateful transport multiplexes
/// calls over.
#[async_trait]
pub trait Duplex: Send + Sync {
    /// Write one frame sequence (request or response) to the peer.
    async fn send(&self, frames: FrameSequence) -> Result<()>;

    /// Read the next frame sequence from the peer, or `None` on clean
    /// EOF.
    async fn recv(&self) -> Result<Option<FrameSequence>>;
}

/// A single logical call's raw bytes, used by both transport shapes to
/// hand a request to the channel and receive its response.
#[derive(Debug, Clone)]
pub struct RawMessage(pub Bytes);
