//! Pub/sub channel store with lock-free readers.
//!
//! A single shared atomic pointer names the current pair of channel/pattern maps; publishers
//! read the pointer once and work on that snapshot. Writers serialize on a mutex, update either
//! by swapping one slot's subscriber-map pointer or by publishing a rebuilt map pair, then run a
//! quiescence broadcast across shard threads before releasing the replaced maps.

mod registry;
mod store;
mod subscriber;
mod updater;

pub use registry::{ChannelRegistry, ImmediateDispatcher, ThreadBroadcast};
pub use store::{ChannelStore, ControlBlock};
pub use subscriber::{PubMessage, PublishDispatcher, Subscriber, SubscriberSink};
pub use updater::ChannelStoreUpdater;

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
