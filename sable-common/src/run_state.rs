//! Shared shutdown flag observed by long-running background passes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative run flag shared between a shard owner and its background sweeps.
///
/// Background work (slot flushes, snapshot passes, incremental expiry) checks the flag at each
/// iteration and exits at the next yield point once shutdown is requested.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    shutting_down: Arc<AtomicBool>,
}

impl RunState {
    /// Creates a running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether background work may continue.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
    }

    /// Requests that all observers stop at their next check.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::RunState;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn clones_observe_shutdown() {
        let state = RunState::new();
        let observer = state.clone();
        assert_that!(observer.is_running(), eq(true));
        state.shutdown();
        assert_that!(observer.is_running(), eq(false));
    }
}
