//! Per-call context visible to middleware and handlers.
//!
//! Spec §3's `CallContext` is the implicit "receiver" every middleware
//! frame and server handler runs against: a private `locals` bag (tracing
//! stores its working `Trace` here), the target message, and the owning
//! channel. Mirrors the teacher's `handler::Context`/`Session` split — one
//! small struct threaded through request processing rather than
//! thread-local state.

use std::{any::Any, collections::HashMap, sync::Arc};

use crate::{avro::Message, channel::Channel};

/// Whether a [`CallContext`] was created for an outgoing (client) call or
/// an incoming (server) dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The context belongs to a client emitting a call.
    Client,
    /// The context belongs to a server dispatching a call.
    Server,
}

/// Per-call state visible to every middleware frame and the terminal
/// handler, scoped to exactly one call (spec §3, §5: "`locals` is
/// private to one call; there is no cross-call implicit state").
pub struct CallContext {
    side: Side,
    message: Message,
    channel: Arc<Channel>,
    locals: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl CallContext {
    /// Build a fresh context for one call.
    #[must_use]
    pub fn new(side: Side, message: Message, channel: Arc<Channel>) -> Self {
        Self {
            side,
            message,
            channel,
            locals: HashMap::new(),
        }
    }

    /// Whether this context belongs to an outgoing or incoming call.
    #[must_use]
    pub const fn side(&self) -> Side { self.side }

    /// The message this call targets.
    #[must_use]
    pub const fn message(&self) -> &Message { &self.message }

    /// The channel carrying this call.
    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> { &self.channel }

    /// Store a value under `key`, replacing any previous value.
    pub fn set_local<T: Send + Sync + 'static>(&mut self, key: impl Into<String>, value: T) {
        self.locals.insert(key.into(), Box::new(value));
    }

    /// Borrow the value stored under `key`, if any and if it matches `T`.
    #[must_use]
    pub fn local<T: Send + Sync + 'static>(&self, key: &str) -> Option<&T> {
        self.locals.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Mutably borrow the value stored under `key`, if any and if it
    /// matches `T`.
    pub fn local_mut<T: Send + Sync + 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.locals.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Remove and return the value stored under `key`.
    #[must_use]
    pub fn take_local<T: Send + Sync + 'static>(&mut self, key: &str) -> Option<T> {
        let boxed = self.locals.remove(key)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                self.locals.insert(key.to_owned(), boxed);
                None
            }
        }
    }

    /// Whether a local is currently set under `key`.
    #[must_use]
    pub fn has_local(&self, key: &str) -> bool { self.locals.contains_key(key) }
}

#[cfg(test)]
mod tests {
    use apache_avro::Schema;

    use super::*;
    use crate::transport::{StatefulTransport, memory::memory_pair};

    fn dummy_channel() -> Arc<Channel> {
        let (transport, _peer): (StatefulTransport, StatefulTransport) = memory_pair();
        Channel::open_client(crate::transport::Transport::Stateful(transport), "", true)
    }

    fn dummy_message() -> Message {
        Message::new("neg".to_owned(), false, Schema::Int, Schema::Int, Schema::String)
    }

    #[test]
    fn locals_round_trip_by_type() {
        let mut ctx = CallContext::new(Side::Client, dummy_message(), dummy_channel());
        ctx.set_local("count", 3usize);
        assert_eq!(ctx.local::<usize>("count"), Some(&3));
        assert!(ctx.local::<String>("count").is_none());
    }

    #[test]
    fn take_local_removes_the_value() {
        let mut ctx = CallContext::new(Side::Server, dummy_message(), dummy_channel());
        ctx.set_local("trace", "abc".to_owned());
        assert!(ctx.has_local("trace"));
        let taken: Option<String> = ctx.take_local("trace");
        assert_eq!(taken.as_deref(), Some("abc"));
        assert!(!ctx.has_local("trace"));
    }
}
