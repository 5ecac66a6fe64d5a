//! Serialized store updates: per-slot RCU, copy on resize.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::store::{ChannelMap, ChannelStore, ControlBlock, SubEntry, clone_channel_map};
use crate::subscriber::{SubscriberSink, sink_key};

/// One batched subscribe/unsubscribe update for a single session.
///
/// Record the affected channels (or patterns), then `apply`. The update either swaps the
/// touched slots' subscriber maps in place, or publishes a rebuilt map pair when channels are
/// added or removed at the top level. Replaced maps are returned so the caller can hold them
/// until the quiescence broadcast returns.
pub struct ChannelStoreUpdater {
    pattern: bool,
    to_add: bool,
    session_key: usize,
    entry: SubEntry,
    ops: Vec<String>,
}

/// Maps detached by an update, kept alive until quiescence.
pub(crate) struct Detached {
    pub(crate) store: Option<Arc<ChannelStore>>,
    pub(crate) sub_maps: Vec<Arc<crate::store::SubscribeMap>>,
}

impl ChannelStoreUpdater {
    /// Starts an update for one session.
    #[must_use]
    pub fn new(
        pattern: bool,
        to_add: bool,
        session: &Arc<dyn SubscriberSink>,
        thread_id: u32,
    ) -> Self {
        Self {
            pattern,
            to_add,
            session_key: sink_key(session),
            entry: SubEntry {
                sink: Arc::downgrade(session),
                thread_id,
            },
            ops: Vec::new(),
        }
    }

    /// Adds one channel or pattern to the batch.
    pub fn record(&mut self, key: &str) {
        self.ops.push(key.to_owned());
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn needs_copy(&self, target: &ChannelMap) -> bool {
        self.ops.iter().any(|key| match target.get(key) {
            None => {
                debug_assert!(self.to_add, "unsubscribe from a channel with no subscribers");
                self.to_add
            }
            Some(slot) => !self.to_add && slot.load().len() == 1,
        })
    }

    fn modify(&self, target: &mut ChannelMap, key: &str, detached: &mut Detached) {
        match target.get(key) {
            // New channel: add a fresh slot.
            None => {
                if self.to_add {
                    let mut subs = crate::store::SubscribeMap::new();
                    let _ = subs.insert(self.session_key, self.entry.clone());
                    let _ = target.insert(key.to_owned(), ArcSwap::from_pointee(subs));
                }
            }
            Some(slot) if !self.to_add && slot.load().len() == 1 => {
                // Last subscriber: remove the whole slot.
                detached.sub_maps.push(slot.load_full());
                let _ = target.remove(key);
            }
            Some(slot) => {
                // RCU the existing subscriber map behind the slot.
                let current = slot.load_full();
                let mut replacement = (*current).clone();
                if self.to_add {
                    let _ = replacement.insert(self.session_key, self.entry.clone());
                } else {
                    let _ = replacement.remove(&self.session_key);
                }
                detached.sub_maps.push(current);
                slot.store(Arc::new(replacement));
            }
        }
    }

    /// Applies the batch under the writer lock and publishes the result.
    ///
    /// Returns the detached maps; the caller drops them only after the cross-thread broadcast
    /// has returned, which is the quiescence barrier for readers still holding the old
    /// snapshot.
    pub(crate) fn apply(self, control: &ControlBlock) -> Detached {
        let mut detached = Detached {
            store: None,
            sub_maps: Vec::new(),
        };
        if self.ops.is_empty() {
            return detached;
        }

        let guard = control
            .update_mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let store = control.current.load_full();
        let target = if self.pattern {
            &store.patterns
        } else {
            &store.channels
        };

        if self.needs_copy(target) {
            let mut rebuilt = clone_channel_map(target);
            for key in &self.ops {
                self.modify(&mut rebuilt, key, &mut detached);
            }
            let rebuilt = Arc::new(rebuilt);
            let replacement = if self.pattern {
                ChannelStore {
                    channels: Arc::clone(&store.channels),
                    patterns: rebuilt,
                }
            } else {
                ChannelStore {
                    channels: rebuilt,
                    patterns: Arc::clone(&store.patterns),
                }
            };
            control.current.store(Arc::new(replacement));
            detached.store = Some(store);
        } else {
            // Top-level shape unchanged: swap the touched slots in place.
            for key in &self.ops {
                match target.get(key) {
                    Some(slot) => {
                        let current = slot.load_full();
                        let mut replacement = (*current).clone();
                        if self.to_add {
                            let _ = replacement.insert(self.session_key, self.entry.clone());
                        } else {
                            let _ = replacement.remove(&self.session_key);
                        }
                        detached.sub_maps.push(current);
                        slot.store(Arc::new(replacement));
                    }
                    None => {
                        tracing::error!(key, "in-place update against a missing channel slot");
                        debug_assert!(false, "needs_copy missed a structural change");
                    }
                }
            }
        }
        drop(guard);
        detached
    }
}
