//! In-memory tiered backend used by tests and single-process setups.

use std::cell::{Cell, RefCell};

use sable_common::containers::HotMap;
use sable_common::ids::DbIndex;

use crate::future::ValueFuture;
use crate::{ExternalDescriptor, TieredStorage};

/// Backend that keeps "offloaded" values in a plain map.
///
/// Reads resolve immediately, which keeps the delayed-entry machinery of the snapshot producer
/// exercised without real disk latency. The reclaimable budget is a test knob.
#[derive(Debug, Default)]
pub struct InMemoryTieredStorage {
    pages: RefCell<HotMap<u64, Vec<u8>>>,
    next_offset: Cell<u64>,
    reclaimable: Cell<usize>,
    stashed: Cell<u64>,
    cancelled: Cell<u64>,
    deleted: Cell<u64>,
}

impl InMemoryTieredStorage {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many bytes `reclaim_memory` may pretend to release.
    pub fn set_reclaimable(&self, bytes: usize) {
        self.reclaimable.set(bytes);
    }

    /// Number of accepted stashes.
    #[must_use]
    pub fn stashed(&self) -> u64 {
        self.stashed.get()
    }

    /// Number of cancelled stashes.
    #[must_use]
    pub fn cancelled(&self) -> u64 {
        self.cancelled.get()
    }

    /// Number of deleted offloaded values.
    #[must_use]
    pub fn deleted(&self) -> u64 {
        self.deleted.get()
    }
}

impl TieredStorage for InMemoryTieredStorage {
    fn read(&self, _db: DbIndex, _key: &[u8], descriptor: &ExternalDescriptor) -> ValueFuture {
        let pages = self.pages.borrow();
        let value = pages.get(&descriptor.offset).cloned().unwrap_or_default();
        ValueFuture::ready(value)
    }

    fn try_stash(&self, _db: DbIndex, _key: &[u8], value: &[u8]) -> Option<ExternalDescriptor> {
        let offset = self.next_offset.get();
        self.next_offset.set(offset + 1);
        self.pages.borrow_mut().insert(offset, value.to_vec());
        self.stashed.set(self.stashed.get() + 1);
        Some(ExternalDescriptor {
            offset,
            len: value.len() as u32,
        })
    }

    fn cancel_stash(&self, _db: DbIndex, _key: &[u8], descriptor: &ExternalDescriptor) {
        let _ = self.pages.borrow_mut().remove(&descriptor.offset);
        self.cancelled.set(self.cancelled.get() + 1);
    }

    fn delete(&self, _db: DbIndex, descriptor: &ExternalDescriptor) {
        let _ = self.pages.borrow_mut().remove(&descriptor.offset);
        self.deleted.set(self.deleted.get() + 1);
    }

    fn reclaim_memory(&self, goal_bytes: usize) -> usize {
        let available = self.reclaimable.get();
        let released = available.min(goal_bytes);
        self.reclaimable.set(available - released);
        released
    }

    fn cool_memory_usage(&self) -> usize {
        self.reclaimable.get()
    }

    fn modify(
        &self,
        _db: DbIndex,
        _key: &[u8],
        descriptor: &ExternalDescriptor,
        edit: &mut dyn FnMut(&mut Vec<u8>),
    ) -> ValueFuture {
        let mut pages = self.pages.borrow_mut();
        let slot = pages.entry(descriptor.offset).or_default();
        edit(slot);
        ValueFuture::ready(slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryTieredStorage;
    use crate::TieredStorage;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn stash_read_roundtrip() {
        let backend = InMemoryTieredStorage::new();
        let descriptor = backend
            .try_stash(0, b"key", b"cold-value")
            .expect("stub accepts every stash");
        let future = backend.read(0, b"key", &descriptor);
        assert_that!(future.wait(), eq(&b"cold-value".to_vec()));
    }

    #[rstest]
    fn reclaim_respects_the_configured_budget() {
        let backend = InMemoryTieredStorage::new();
        backend.set_reclaimable(1000);
        assert_that!(backend.reclaim_memory(300), eq(300));
        assert_that!(backend.reclaim_memory(900), eq(700));
        assert_that!(backend.reclaim_memory(10), eq(0));
    }

    #[rstest]
    fn delete_drops_the_page() {
        let backend = InMemoryTieredStorage::new();
        let descriptor = backend
            .try_stash(0, b"key", b"value")
            .expect("stub accepts every stash");
        backend.delete(0, &descriptor);
        let future = backend.read(0, b"key", &descriptor);
        assert_that!(future.wait(), eq(&Vec::<u8>::new()));
        assert_that!(backend.deleted(), eq(1));
    }
}
