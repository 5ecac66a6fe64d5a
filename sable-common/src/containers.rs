//! Hot-path container aliases used by core data structures.
//!
//! Shard-local tables sit on every read and write path, so container choices are centralized
//! here. Swapping the hasher or the map implementation later is a one-line change that does not
//! touch table or slice logic.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hot-path hash map used by shard-local state tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hot-path hash set used by secondary indexes and dedup scratch state.
pub type HotSet<T> = HbSet<T>;
