//! Stateless transport: one fresh sink per call.
//!
//! Spec §4.A: "a function `() -> writableSink` such that writing a full
//! request to the sink and then ending it produces, via a completion
//! callback, an object yielding the response bytes." The proxy's
//! `avro/binary` POST handler is the canonical stateless transport: one
//! HTTP request body in, one HTTP response body out.

use async_trait::async_trait;

use crate::{codec::FrameSequence, error::Result};

/// One call's write-then-await-response lifecycle over a stateless
/// transport.
#[async_trait]
pub trait StatelessSink: Send {
    /// Write the full request frame sequence (handshake + request) and
    /// await the response frame sequence.
    async fn call(self: Box<Self>, request: FrameSequence) -> Result<FrameSequence>;
}

/// Allocates a fresh [`StatelessSink`] for each logical call.
#[async_trait]
pub trait StatelessFactory: Send + Sync {
    /// Open a new sink for one call.
    async fn open(&self) -> Result<Box<dyn StatelessSink>>;
}

/// Adapts any async closure `Fn(FrameSequence) -> Future<Output =
/// Result<FrameSequence>>` into a [`StatelessFactory`], the common case
/// where no extra per-sink state is needed (e.g. an HTTP client POSTing
/// the framed request as its body).
pub struct FnStatelessFactory<F> {
    f: F,
}

impl<F> FnStatelessFactory<F> {
    /// Wrap `f` as a [`StatelessFactory`].
    #[must_use]
    pub const fn new(f: F) -> Self { Self { f } }
}

struct FnSink<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> StatelessSink for FnSink<F>
where
    F: FnOnce(FrameSequence) -> Fut + Send,
    Fut: std::future::Future<Output = Result<FrameSequence>> + Send,
{
    async fn call(self: Box<Self>, request: FrameSequence) -> Result<FrameSequence> { (self.f)(request).await }
}

#[async_trait]
impl<F, Fut> StatelessFactory for FnStatelessFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Box<dyn StatelessSink>>> + Send,
{
    async fn open(&self) -> Result<Box<dyn StatelessSink>> { (self.f)().await }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    struct EchoSink;

    #[async_trait]
    impl StatelessSink for EchoSink {
        async fn call(self: Box<Self>, request: FrameSequence) -> Result<FrameSequence> { Ok(request) }
    }

    #[tokio::test]
    async fn fn_factory_opens_a_working_sink() {
        let factory = FnStatelessFactory::new(|| async { Ok(Box::new(EchoSink) as Box<dyn StatelessSink>) });
        let sink = factory.open().await.expect("open");
        let frames = vec![Bytes::from_static(b"ping")];
        let response = sink.call(frames.clone()).await.expect("call");
        assert_eq!(response, frames);
    }
}
