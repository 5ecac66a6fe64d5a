//! Cooperative synchronization scaffolding for the single-threaded shard model.

use std::cell::Cell;

thread_local! {
    static ATOMIC_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Cooperative counter serializing snapshot-critical regions against bucket reordering.
///
/// Acquisition only increments the counter; a matching `wait` asserts the counter is zero. On a
/// cooperative shard both sides run on the same scheduler, so a non-zero counter at a wait point
/// means a critical region was left open across a yield, which is a bug rather than a race.
#[derive(Debug, Default)]
pub struct LocalLatch {
    count: Cell<u64>,
}

impl LocalLatch {
    /// Creates an open latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a critical region.
    #[must_use]
    pub fn lock(&self) -> LatchGuard<'_> {
        self.count.set(self.count.get() + 1);
        LatchGuard { latch: self }
    }

    /// Observes that no critical region is open.
    pub fn wait(&self) {
        debug_assert_eq!(
            self.count.get(),
            0,
            "serialization latch held across a suspension point"
        );
    }

    /// Whether no critical region is open.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.count.get() == 0
    }
}

/// Guard for one critical region of a [`LocalLatch`].
#[derive(Debug)]
pub struct LatchGuard<'a> {
    latch: &'a LocalLatch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        let count = self.latch.count.get();
        debug_assert!(count > 0);
        self.latch.count.set(count.saturating_sub(1));
    }
}

/// Debug marker for regions that must not suspend.
///
/// The guard itself does nothing in release builds; eviction and garbage-collection hooks
/// construct it so debug assertions can catch accidental suspension points.
#[derive(Debug)]
pub struct FiberAtomicGuard(());

impl FiberAtomicGuard {
    /// Enters a non-suspending region.
    #[must_use]
    pub fn new() -> Self {
        ATOMIC_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }
}

impl Default for FiberAtomicGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FiberAtomicGuard {
    fn drop(&mut self) {
        ATOMIC_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether the current thread is inside a non-suspending region.
#[must_use]
pub fn in_atomic_section() -> bool {
    ATOMIC_DEPTH.with(Cell::get) > 0
}
