//! Process-facing pub/sub surface: subscriptions, publication, quiescence.

use std::sync::Arc;

use crate::store::{ChannelStore, ControlBlock};
use crate::subscriber::{PubMessage, PublishDispatcher, SubscriberSink};
use crate::updater::ChannelStoreUpdater;

/// Cross-thread barrier used after a store update: every shard thread runs the task (typically
/// refreshing its thread-local store reference) before the call returns.
pub trait ThreadBroadcast {
    /// Number of shard threads.
    fn thread_count(&self) -> u32;

    /// Runs the task once per thread and returns after all runs completed.
    fn broadcast(&self, task: &(dyn Fn(u32) + Sync));
}

/// Broadcast that runs inline on the calling thread. Suits single-reactor deployments and
/// tests; a threaded deployment provides its own dispatch-based implementation.
#[derive(Debug, Clone, Copy)]
pub struct ImmediateDispatcher {
    threads: u32,
}

impl ImmediateDispatcher {
    /// Creates a dispatcher modeling the given thread count.
    #[must_use]
    pub fn new(threads: u32) -> Self {
        Self {
            threads: threads.max(1),
        }
    }
}

impl ThreadBroadcast for ImmediateDispatcher {
    fn thread_count(&self) -> u32 {
        self.threads
    }

    fn broadcast(&self, task: &(dyn Fn(u32) + Sync)) {
        for thread in 0..self.threads {
            task(thread);
        }
    }
}

impl PublishDispatcher for ImmediateDispatcher {
    fn ensure_buffer_budget(&self, _thread_id: u32) {}

    fn dispatch(&self, _thread_id: u32, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// The pub/sub channel registry of one process.
pub struct ChannelRegistry {
    control: ControlBlock,
    broadcast: Arc<dyn ThreadBroadcast>,
}

impl ChannelRegistry {
    /// Creates an empty registry over the given quiescence broadcast.
    #[must_use]
    pub fn new(broadcast: Arc<dyn ThreadBroadcast>) -> Self {
        Self {
            control: ControlBlock::new(),
            broadcast,
        }
    }

    /// The current store snapshot. Readers never lock.
    #[must_use]
    pub fn current(&self) -> Arc<ChannelStore> {
        self.control.load()
    }

    /// Subscribes a session to channels or patterns.
    pub fn subscribe(
        &self,
        keys: &[&str],
        pattern: bool,
        session: &Arc<dyn SubscriberSink>,
        thread_id: u32,
    ) {
        let mut updater = ChannelStoreUpdater::new(pattern, true, session, thread_id);
        for key in keys {
            updater.record(key);
        }
        self.apply(updater);
    }

    /// Removes a session's subscriptions from channels or patterns.
    pub fn unsubscribe(&self, keys: &[&str], pattern: bool, session: &Arc<dyn SubscriberSink>) {
        let mut updater = ChannelStoreUpdater::new(pattern, false, session, 0);
        for key in keys {
            updater.record(key);
        }
        self.apply(updater);
    }

    fn apply(&self, updater: ChannelStoreUpdater) {
        if updater.is_empty() {
            return;
        }
        let detached = updater.apply(&self.control);
        // Quiescence barrier: after every thread refreshed its reference, no reader can still
        // hold the replaced maps, and dropping them is safe.
        self.broadcast.broadcast(&|_thread| {});
        drop(detached.store);
        drop(detached.sub_maps);
    }

    /// Publishes messages to a channel's subscribers, one dispatch per destination thread.
    ///
    /// Returns the number of subscribers messaged. Expired sessions are silently skipped;
    /// publication itself never fails.
    pub fn send_messages(
        &self,
        channel: &str,
        messages: &[Vec<u8>],
        dispatcher: &dyn PublishDispatcher,
    ) -> usize {
        let store = self.control.load();
        let subscribers = store.fetch_subscribers(channel);
        if subscribers.is_empty() {
            return 0;
        }

        // Budget pass first: block here rather than overrun consumer buffers mid-dispatch.
        let mut last_thread = None;
        for subscriber in &subscribers {
            if last_thread == Some(subscriber.thread_id) || subscriber.is_expired() {
                continue;
            }
            dispatcher.ensure_buffer_budget(subscriber.thread_id);
            last_thread = Some(subscriber.thread_id);
        }

        let total = subscribers.len();
        let mut index = 0;
        while index < total {
            let thread_id = subscribers[index].thread_id;
            let mut batch = Vec::new();
            while index < total && subscribers[index].thread_id == thread_id {
                batch.push(subscribers[index].clone());
                index += 1;
            }
            let channel_bytes = channel.as_bytes().to_vec();
            let messages = messages.to_vec();
            dispatcher.dispatch(
                thread_id,
                Box::new(move || {
                    for subscriber in &batch {
                        let Some(sink) = subscriber.sink.upgrade() else {
                            continue;
                        };
                        for message in &messages {
                            sink.deliver(PubMessage {
                                pattern: subscriber.pattern.clone(),
                                channel: channel_bytes.clone(),
                                message: message.clone(),
                            });
                        }
                    }
                }),
            );
        }
        total
    }
}
