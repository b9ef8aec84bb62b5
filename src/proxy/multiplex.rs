//! Scope multiplexing over one physical CONNECT-tunnelled or WebSocket
//! duplex (spec §4.G: "Multiple scopes map one socket to multiple
//! channels").
//!
//! The envelope [`crate::channel`] frames carries no scope field of its
//! own — a channel always assumes it owns its transport exclusively
//! (spec §5). Rather than growing that envelope for the multi-scope
//! case, this module wraps the shared physical [`Duplex`] with one
//! scope-tagged view per requested scope: outgoing frame sequences gain
//! a leading scope-name buffer, and one demultiplexing task reads the
//! physical duplex, strips that tag, and routes the remainder to the
//! matching scope's queue. Each tagged view is then handed to
//! [`crate::channel::Channel`] as an ordinary [`StatefulTransport`],
//! which never has to know it is sharing a socket.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

use crate::{
    codec::FrameSequence,
    error::Result,
    transport::{Duplex, StatefulTransport},
};

const QUEUE_DEPTH: usize = 64;

struct TaggedDuplex {
    scope: String,
    physical: Arc<dyn Duplex>,
    incoming: Mutex<mpsc::Receiver<FrameSequence>>,
}

#[async_trait]
impl Duplex for TaggedDuplex {
    async fn send(&self, mut frames: FrameSequence) -> Result<()> {
        frames.insert(0, Bytes::copy_from_slice(self.scope.as_bytes()));
        self.physical.send(frames).await
    }

    async fn recv(&self) -> Result<Option<FrameSequence>> { Ok(self.incoming.lock().await.recv().await) }
}

/// Wrap `physical` with a scope tag on every frame sequence, returning
/// one [`StatefulTransport`] per entry in `scopes`, and spawn the
/// demultiplexing reader task that keeps them fed.
pub(crate) fn multiplex(
    physical: Arc<dyn Duplex>,
    object_mode: bool,
    scopes: &[String],
) -> HashMap<String, StatefulTransport> {
    let mut senders = HashMap::with_capacity(scopes.len());
    let mut transports = HashMap::with_capacity(scopes.len());
    for scope in scopes {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        senders.insert(scope.clone(), tx);
        let tagged: Arc<dyn Duplex> = Arc::new(TaggedDuplex {
            scope: scope.clone(),
            physical: Arc::clone(&physical),
            incoming: Mutex::new(rx),
        });
        transports.insert(scope.clone(), StatefulTransport::from_shared(tagged, object_mode));
    }
    tokio::spawn(demultiplex(physical, senders));
    transports
}

async fn demultiplex(physical: Arc<dyn Duplex>, senders: HashMap<String, mpsc::Sender<FrameSequence>>) {
    loop {
        match physical.recv().await {
            Ok(Some(mut frames)) => {
                if frames.is_empty() {
                    warn!("dropping empty frame sequence on a multiplexed transport");
                    continue;
                }
                let tag = frames.remove(0);
                let Ok(scope) = std::str::from_utf8(&tag) else {
                    warn!("dropping frame sequence with a non-utf8 scope tag");
                    continue;
                };
                match senders.get(scope) {
                    Some(tx) if tx.send(frames).await.is_ok() => {}
                    Some(_) => warn!(scope, "scope channel closed while demultiplexing"),
                    None => warn!(scope, "dropping frame sequence for an unbound scope"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "multiplexed transport error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn routes_tagged_frames_to_the_matching_scope() {
        let (a, b) = duplex(4096);
        let physical_a = StatefulTransport::from_duplex(a);
        let physical_b = StatefulTransport::from_duplex(b);

        let scopes = vec!["math".to_owned(), "log".to_owned()];
        let mut transports = multiplex(physical_a.duplex(), false, &scopes);

        let math = transports.remove("math").expect("math transport");
        let log = transports.remove("log").expect("log transport");

        physical_b
            .duplex()
            .send(vec![Bytes::from_static(b"math"), Bytes::from_static(b"ping")])
            .await
            .expect("send");
        physical_b
            .duplex()
            .send(vec![Bytes::from_static(b"log"), Bytes::from_static(b"line")])
            .await
            .expect("send");

        let math_frames = math.duplex().recv().await.expect("recv").expect("some frames");
        assert_eq!(math_frames, vec![Bytes::from_static(b"ping")]);

        let log_frames = log.duplex().recv().await.expect("recv").expect("some frames");
        assert_eq!(log_frames, vec![Bytes::from_static(b"line")]);
    }

    #[tokio::test]
    async fn tagged_sends_are_routed_back_with_the_scope_prefix() {
        let (a, b) = duplex(4096);
        let physical_a = StatefulTransport::from_duplex(a);
        let physical_b = StatefulTransport::from_duplex(b);

        let scopes = vec!["math".to_owned()];
        let transports = multiplex(physical_a.duplex(), false, &scopes);
        let math = transports.get("math").expect("math transport");

        math.duplex().send(vec![Bytes::from_static(b"pong")]).await.expect("send");
        let received = physical_b.duplex().recv().await.expect("recv").expect("some frames");
        assert_eq!(received, vec![Bytes::from_static(b"math"), Bytes::from_static(b"pong")]);
    }
}
