//! Subscriber handles and publish-side interfaces.

use std::sync::{Arc, Weak};

/// One message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubMessage {
    /// The glob pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Channel the message was published on.
    pub channel: Vec<u8>,
    /// Message payload.
    pub message: Vec<u8>,
}

/// Session-side sink a subscription delivers into.
///
/// Sinks are owned by their connection's thread; the store holds weak references so a vanished
/// connection is silently skipped.
pub trait SubscriberSink: Send + Sync {
    /// Accepts one published message.
    fn deliver(&self, message: PubMessage);
}

/// One resolved subscriber of a channel, sorted by owning thread for per-thread dispatch.
#[derive(Clone)]
pub struct Subscriber {
    /// Session sink; may have expired.
    pub sink: Weak<dyn SubscriberSink>,
    /// Thread owning the session.
    pub thread_id: u32,
    /// Pattern that produced this subscriber, when any.
    pub pattern: Option<String>,
}

impl Subscriber {
    /// Whether the session behind this subscriber is gone.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.sink.strong_count() == 0
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("thread_id", &self.thread_id)
            .field("pattern", &self.pattern)
            .field("expired", &self.is_expired())
            .finish()
    }
}

/// Publish-side thread services: outbound-buffer budgeting and per-thread task dispatch.
pub trait PublishDispatcher {
    /// Blocks until the destination thread's outbound buffers can take more traffic.
    fn ensure_buffer_budget(&self, thread_id: u32);

    /// Runs a task on the destination thread. Tasks to one destination arrive in dispatch
    /// order.
    fn dispatch(&self, thread_id: u32, task: Box<dyn FnOnce() + Send>);
}

/// Stable identity of a session used as the subscriber-map key.
pub(crate) fn sink_key(session: &Arc<dyn SubscriberSink>) -> usize {
    Arc::as_ptr(session).cast::<()>() as usize
}
