//! The immutable-snapshot channel store.

use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;
use hashbrown::HashMap;

use crate::subscriber::{Subscriber, SubscriberSink};

/// Subscribers of one channel or pattern: session identity → (sink, owning thread).
pub(crate) type SubscribeMap = HashMap<usize, SubEntry>;

#[derive(Clone)]
pub(crate) struct SubEntry {
    pub(crate) sink: Weak<dyn SubscriberSink>,
    pub(crate) thread_id: u32,
}

/// Channel (or pattern) → RCU slot holding that channel's subscriber map.
///
/// The slot is an atomic pointer: readers load it without locking, writers swap in a rebuilt
/// subscriber map. Adding or removing a channel itself requires cloning the whole map into a
/// replacement store.
pub(crate) type ChannelMap = HashMap<String, ArcSwap<SubscribeMap>>;

pub(crate) fn clone_channel_map(source: &ChannelMap) -> ChannelMap {
    source
        .iter()
        .map(|(key, slot)| (key.clone(), ArcSwap::new(slot.load_full())))
        .collect()
}

/// One immutable snapshot of the channel and pattern maps.
pub struct ChannelStore {
    pub(crate) channels: Arc<ChannelMap>,
    pub(crate) patterns: Arc<ChannelMap>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Arc::new(ChannelMap::new()),
            patterns: Arc::new(ChannelMap::new()),
        }
    }

    /// Subscribers of a channel: exact matches plus every pattern that glob-matches it, sorted
    /// by owning thread so one dispatch per thread suffices.
    #[must_use]
    pub fn fetch_subscribers(&self, channel: &str) -> Vec<Subscriber> {
        let mut result = Vec::new();
        if let Some(slot) = self.channels.get(channel) {
            fill(&slot.load(), None, &mut result);
        }
        for (pattern, slot) in self.patterns.iter() {
            let Ok(matcher) = glob::Pattern::new(pattern) else {
                continue;
            };
            if matcher.matches(channel) {
                fill(&slot.load(), Some(pattern.clone()), &mut result);
            }
        }
        result.sort_by_key(|subscriber| subscriber.thread_id);
        result
    }

    /// Channels with at least one subscriber, filtered by an optional glob pattern.
    #[must_use]
    pub fn list_channels(&self, pattern: &str) -> Vec<String> {
        let matcher = if pattern.is_empty() {
            None
        } else {
            glob::Pattern::new(pattern).ok()
        };
        let mut result: Vec<String> = self
            .channels
            .keys()
            .filter(|channel| {
                matcher
                    .as_ref()
                    .is_none_or(|matcher| matcher.matches(channel))
            })
            .cloned()
            .collect();
        result.sort();
        result
    }

    /// Number of live pattern subscriptions.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

fn fill(source: &SubscribeMap, pattern: Option<String>, out: &mut Vec<Subscriber>) {
    out.reserve(source.len());
    for entry in source.values() {
        out.push(Subscriber {
            sink: entry.sink.clone(),
            thread_id: entry.thread_id,
            pattern: pattern.clone(),
        });
    }
}

/// The single shared pointer naming the current store, plus the writer lock.
pub struct ControlBlock {
    pub(crate) current: ArcSwap<ChannelStore>,
    pub(crate) update_mu: Mutex<()>,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlock {
    /// Creates a control block over an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ChannelStore::new()),
            update_mu: Mutex::new(()),
        }
    }

    /// The current store snapshot. Readers never lock.
    #[must_use]
    pub fn load(&self) -> Arc<ChannelStore> {
        self.current.load_full()
    }
}
