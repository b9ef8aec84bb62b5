//! The middleware pipeline: forward/reverse execution around each call.
//!
//! Spec §4.F models a chain `M₁, M₂, …, Mₙ, H` where each `Mᵢ` may mutate
//! the request in a forward phase, and optionally register a reverse
//! callback that runs, in strict reverse order, once the terminal step
//! `H` has produced a response. This module generalizes the teacher's
//! single pass-through `wireframe::middleware::{Service, Transform}` chain
//! (`examples/leynos-mxd/src/wireframe/routes.rs`'s `TransactionService`)
//! into the spec's full bidirectional chain.
//!
//! Rather than modeling "callback style" and "promise style" as two
//! different code paths (the JS original's distinction, driven by
//! whether a handler calls `next` or returns a thenable), this crate
//! unifies both behind one pair of `async fn`s per [`Middleware`]: a
//! `forward` phase and, if it registers one, a [`ReverseHandler`]. A
//! synchronous-looking handler is simply one whose `async fn` body does
//! not await anything interesting; the pipeline does not need to
//! distinguish the two. Because forward and reverse are two distinct
//! trait methods rather than one `next(err, onReverse)` call whose
//! returned future only resolves once the reverse phase rewinds to it,
//! the "early middleware return" race spec §9 flags as inconsistent in
//! the source does not arise by construction here: a frame's
//! post-`next()` work *is* its `reverse` method, which the pipeline only
//! invokes after the terminal step has run. [`RpcError::Middleware`] is
//! still synthesized with the spec's recommended message for the one
//! place the race's symptom can still show up in this design: a forward
//! phase that errors without registering a reverse hook for its own
//! frame (spec's "reverse phase begins from `Mᵢ₋₁`").

use std::sync::Arc;

use apache_avro::types::Value;
use async_trait::async_trait;

use crate::{
    channel::Headers,
    context::CallContext,
    error::{Result, RpcError},
};

/// The decoded request record plus its mutable header map, handed to
/// every middleware frame and the terminal handler (spec §3).
#[derive(Debug, Clone)]
pub struct WrappedRequest {
    /// The decoded request record.
    pub request: Value,
    /// Request headers; middleware may add, remove, or rewrite entries.
    pub headers: Headers,
}

impl WrappedRequest {
    /// Build a wrapped request with no headers.
    #[must_use]
    pub fn new(request: Value) -> Self {
        Self {
            request,
            headers: Headers::new(),
        }
    }
}

/// Either the response record or the declared-error value produced for
/// one call. Exactly one of the two is populated once the terminal step
/// runs, except for `oneWay` messages, which carry neither (spec §3).
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The terminal step populated `response`.
    Response(Value),
    /// The terminal step populated `error` with a declared error variant
    /// or, on the server with `strictErrors`, a normalized `system`
    /// error string.
    Error(Value),
}

/// The response record (or error) plus its own header map, handed
/// through the reverse phase (spec §3).
#[derive(Debug, Clone)]
pub struct WrappedResponse {
    /// The call's outcome, or `None` before the terminal step runs (or
    /// permanently, for `oneWay` messages).
    pub outcome: Option<Outcome>,
    /// Response headers; reverse hooks may add, remove, or rewrite
    /// entries (this is how the tracing middleware returns the
    /// downstream call subtree).
    pub headers: Headers,
}

impl WrappedResponse {
    /// An empty response: no outcome yet, no headers. Used as the
    /// starting point when the forward phase stops before the terminal
    /// step runs.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            outcome: None,
            headers: Headers::new(),
        }
    }

    /// Build a response wrapping a successful result.
    #[must_use]
    pub fn success(value: Value) -> Self {
        Self {
            outcome: Some(Outcome::Response(value)),
            headers: Headers::new(),
        }
    }

    /// Build a response wrapping a declared or system error value.
    #[must_use]
    pub fn failure(value: Value) -> Self {
        Self {
            outcome: Some(Outcome::Error(value)),
            headers: Headers::new(),
        }
    }

    /// Whether this response carries a declared/system error outcome.
    #[must_use]
    pub const fn is_error(&self) -> bool { matches!(self.outcome, Some(Outcome::Error(_))) }
}

/// A reverse-phase hook registered by a [`Middleware`]'s forward phase.
///
/// Runs once, at the point in the reverse phase matching its frame's
/// position in the forward phase (spec §5: "Reverse callbacks must run
/// in the opposite order of their registration"). Returning `Ok(())`
/// swallows an incoming error (spec §4.F: "calling `prev()` with no
/// argument on an error-carrying frame converts the failure into the
/// current response"); returning `Err` re-raises (the same error, or a
/// new one) toward the caller.
#[async_trait]
pub trait ReverseHandler: Send + Sync {
    /// Inspect or mutate `res`, and decide whether to swallow or
    /// propagate `err`.
    async fn reverse(
        &self,
        ctx: &mut CallContext,
        res: &mut WrappedResponse,
        err: Option<RpcError>,
    ) -> Result<()>;
}

/// One middleware frame.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Forward phase: mutate `req` (including its headers), and
    /// optionally register a [`ReverseHandler`] for this frame. Returning
    /// `Err` stops forward propagation; per spec §4.F, the reverse phase
    /// then begins from the previous frame — this frame itself does not
    /// get a reverse callback.
    async fn forward(
        &self,
        ctx: &mut CallContext,
        req: &mut WrappedRequest,
    ) -> Result<Option<Arc<dyn ReverseHandler>>>;
}

/// An ordered, append-only chain of middleware (spec §5: "The middleware
/// list is append-only during normal operation").
#[derive(Default, Clone)]
pub struct Pipeline {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// An empty pipeline.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append a middleware frame to the end of the chain.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) { self.middleware.push(middleware); }

    /// Number of registered frames.
    #[must_use]
    pub fn len(&self) -> usize { self.middleware.len() }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.middleware.is_empty() }

    /// Run the forward phase, then `terminal`, then the reverse phase.
    ///
    /// `terminal` is the client's write-and-wait step or the server's
    /// user handler, already wrapped so that any failure it produces is
    /// itself subject to the reverse phase (spec §4.F step 2).
    ///
    /// # Errors
    /// Returns the error that reaches the head of the chain unswallowed:
    /// the forward-phase error (if any middleware frame failed), the
    /// terminal step's own error, or a reverse hook's replacement error.
    pub async fn run<T, Fut>(
        &self,
        ctx: &mut CallContext,
        req: &mut WrappedRequest,
        terminal: T,
    ) -> Result<WrappedResponse>
    where
        T: FnOnce(&mut CallContext, &mut WrappedRequest) -> Fut + Send,
        Fut: std::future::Future<Output = Result<WrappedResponse>> + Send,
    {
        let mut reverses: Vec<Option<Arc<dyn ReverseHandler>>> = Vec::with_capacity(self.middleware.len());
        let mut forward_err = None;

        for mw in &self.middleware {
            match mw.forward(ctx, req).await {
                Ok(hook) => reverses.push(hook),
                Err(e) => {
                    forward_err = Some(e);
                    break;
                }
            }
        }

        let mut response = if forward_err.is_some() {
            WrappedResponse::empty()
        } else {
            match terminal(ctx, req).await {
                Ok(res) => res,
                Err(e) => {
                    forward_err = Some(e);
                    WrappedResponse::empty()
                }
            }
        };

        let mut current_err = forward_err;
        for hook in reverses.iter().rev() {
            let Some(hook) = hook else { continue };
            match hook.reverse(ctx, &mut response, current_err.take()).await {
                Ok(()) => {}
                Err(e) => current_err = Some(e),
            }
        }

        if let Some(err) = current_err {
            return Err(err);
        }
        Ok(response)
    }
}

/// Build the spec §9-recommended "early return" middleware error.
///
/// Kept as a standalone constructor (rather than inlined where it would
/// be used) so any future forward-phase caller that detects the race
/// this guards against produces a message consistent with every other
/// call site.
#[must_use]
pub fn early_return_error() -> RpcError { RpcError::Middleware("early return".to_owned()) }

#[cfg(test)]
mod tests {
    use apache_avro::Schema;

    use super::*;
    use crate::{
        context::Side,
        transport::{StatefulTransport, Transport, memory::memory_pair},
    };

    fn dummy_ctx() -> CallContext {
        let (transport, _peer): (StatefulTransport, StatefulTransport) = memory_pair();
        let message = crate::avro::Message::new(
            "neg".to_owned(),
            false,
            Schema::Int,
            Schema::Int,
            Schema::String,
        );
        let channel = crate::channel::Channel::open_client(Transport::Stateful(transport), "", true);
        CallContext::new(Side::Client, message, channel)
    }

    struct CountingMiddleware {
        forward_count: Arc<std::sync::atomic::AtomicUsize>,
        reverse_count: Arc<std::sync::atomic::AtomicUsize>,
    }

    struct CountingReverse {
        reverse_count: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl ReverseHandler for CountingReverse {
        async fn reverse(
            &self,
            _ctx: &mut CallContext,
            _res: &mut WrappedResponse,
            err: Option<RpcError>,
        ) -> Result<()> {
            self.reverse_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            err.map_or(Ok(()), Err)
        }
    }

    #[async_trait]
    impl Middleware for CountingMiddleware {
        async fn forward(
            &self,
            _ctx: &mut CallContext,
            _req: &mut WrappedRequest,
        ) -> Result<Option<Arc<dyn ReverseHandler>>> {
            self.forward_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Some(Arc::new(CountingReverse {
                reverse_count: Arc::clone(&self.reverse_count),
            })))
        }
    }

    #[tokio::test]
    async fn forward_and_reverse_counts_match() {
        let forward_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let reverse_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        for _ in 0..3 {
            pipeline.push(Arc::new(CountingMiddleware {
                forward_count: Arc::clone(&forward_count),
                reverse_count: Arc::clone(&reverse_count),
            }));
        }
        let mut ctx = dummy_ctx();
        let mut req = WrappedRequest::new(Value::Int(1));
        let result = pipeline
            .run(&mut ctx, &mut req, |_, _| async { Ok(WrappedResponse::success(Value::Int(-1))) })
            .await
            .expect("pipeline run");

        assert!(matches!(result.outcome, Some(Outcome::Response(Value::Int(-1)))));
        assert_eq!(forward_count.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(reverse_count.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    struct FailingMiddleware;

    #[async_trait]
    impl Middleware for FailingMiddleware {
        async fn forward(
            &self,
            _ctx: &mut CallContext,
            _req: &mut WrappedRequest,
        ) -> Result<Option<Arc<dyn ReverseHandler>>> {
            Err(RpcError::Middleware("boom".to_owned()))
        }
    }

    struct SwallowingReverse;

    #[async_trait]
    impl ReverseHandler for SwallowingReverse {
        async fn reverse(
            &self,
            _ctx: &mut CallContext,
            res: &mut WrappedResponse,
            _err: Option<RpcError>,
        ) -> Result<()> {
            res.outcome = Some(Outcome::Response(Value::Int(0)));
            Ok(())
        }
    }

    struct SwallowingMiddleware;

    #[async_trait]
    impl Middleware for SwallowingMiddleware {
        async fn forward(
            &self,
            _ctx: &mut CallContext,
            _req: &mut WrappedRequest,
        ) -> Result<Option<Arc<dyn ReverseHandler>>> {
            Ok(Some(Arc::new(SwallowingReverse)))
        }
    }

    #[tokio::test]
    async fn a_reverse_hook_can_swallow_a_forward_error() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Arc::new(SwallowingMiddleware));
        pipeline.push(Arc::new(FailingMiddleware));
        let mut ctx = dummy_ctx();
        let mut req = WrappedRequest::new(Value::Int(1));
        let result = pipeline
            .run(&mut ctx, &mut req, |_, _| async { Ok(WrappedResponse::success(Value::Int(-1))) })
            .await
            .expect("swallowed error should not propagate");
        assert!(matches!(result.outcome, Some(Outcome::Response(Value::Int(0)))));
    }

    #[tokio::test]
    async fn an_unswallowed_forward_error_propagates() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Arc::new(FailingMiddleware));
        let mut ctx = dummy_ctx();
        let mut req = WrappedRequest::new(Value::Int(1));
        let err = pipeline
            .run(&mut ctx, &mut req, |_, _| async { Ok(WrappedResponse::success(Value::Int(-1))) })
            .await
            .expect_err("unswallowed error should propagate");
        assert!(matches!(err, RpcError::Middleware(_)));
    }
}
