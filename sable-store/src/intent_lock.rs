//! Fingerprint-keyed intent locks held on behalf of the external transaction scheduler.

use sable_common::containers::HotMap;

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared read intent; any number may coexist.
    Shared,
    /// Exclusive write intent.
    Exclusive,
}

#[derive(Debug, Default, Clone, Copy)]
struct IntentLock {
    shared: u32,
    exclusive: u32,
}

impl IntentLock {
    fn is_free(self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }

    fn can_acquire(self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive == 0,
            LockMode::Exclusive => self.is_free(),
        }
    }
}

/// Per-database lock table keyed by key fingerprint.
#[derive(Debug, Default)]
pub struct IntentLockTable {
    locks: HotMap<u64, IntentLock>,
}

impl IntentLockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take a lock on a fingerprint. Returns whether it was granted.
    pub fn acquire(&mut self, fingerprint: u64, mode: LockMode) -> bool {
        let lock = self.locks.entry(fingerprint).or_default();
        if !lock.can_acquire(mode) {
            return false;
        }
        match mode {
            LockMode::Shared => lock.shared += 1,
            LockMode::Exclusive => lock.exclusive += 1,
        }
        true
    }

    /// Releases a previously granted lock.
    pub fn release(&mut self, fingerprint: u64, mode: LockMode) {
        let Some(lock) = self.locks.get_mut(&fingerprint) else {
            debug_assert!(false, "release without a matching acquire");
            return;
        };
        match mode {
            LockMode::Shared => lock.shared = lock.shared.saturating_sub(1),
            LockMode::Exclusive => lock.exclusive = lock.exclusive.saturating_sub(1),
        }
        if lock.is_free() {
            let _ = self.locks.remove(&fingerprint);
        }
    }

    /// Whether a fresh acquisition in the given mode would be granted right now.
    #[must_use]
    pub fn check(&self, fingerprint: u64, mode: LockMode) -> bool {
        self.locks
            .get(&fingerprint)
            .is_none_or(|lock| lock.can_acquire(mode))
    }

    /// Whether any lock is held on the fingerprint.
    #[must_use]
    pub fn is_locked(&self, fingerprint: u64) -> bool {
        self.locks.contains_key(&fingerprint)
    }

    /// Number of fingerprints with live locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no locks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{IntentLockTable, LockMode};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn shared_locks_stack_and_block_exclusive() {
        let mut table = IntentLockTable::new();
        assert_that!(table.acquire(7, LockMode::Shared), eq(true));
        assert_that!(table.acquire(7, LockMode::Shared), eq(true));
        assert_that!(table.acquire(7, LockMode::Exclusive), eq(false));
        table.release(7, LockMode::Shared);
        assert_that!(table.acquire(7, LockMode::Exclusive), eq(false));
        table.release(7, LockMode::Shared);
        assert_that!(table.acquire(7, LockMode::Exclusive), eq(true));
    }

    #[rstest]
    fn exclusive_blocks_everything() {
        let mut table = IntentLockTable::new();
        assert_that!(table.acquire(9, LockMode::Exclusive), eq(true));
        assert_that!(table.acquire(9, LockMode::Shared), eq(false));
        assert_that!(table.check(9, LockMode::Exclusive), eq(false));
        table.release(9, LockMode::Exclusive);
        assert_that!(table.is_locked(9), eq(false));
        assert_that!(table.check(9, LockMode::Exclusive), eq(true));
    }
}
