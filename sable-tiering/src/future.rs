//! One-shot value future with an optional pre-attached continuation.

use std::sync::{Arc, Condvar, Mutex};

struct FutureState {
    value: Option<Vec<u8>>,
    resolved: bool,
    continuation: Option<Box<dyn FnOnce(&[u8]) + Send>>,
}

struct FutureInner {
    state: Mutex<FutureState>,
    ready: Condvar,
}

/// Resolution side of a one-shot future.
///
/// Dropping an unresolved promise resolves the future with empty bytes so waiters never hang on
/// an abandoned read.
pub struct ValuePromise {
    inner: Arc<FutureInner>,
}

impl ValuePromise {
    /// Resolves the future, running any attached continuation.
    pub fn resolve(self, value: Vec<u8>) {
        self.inner.fulfill(value);
    }
}

impl Drop for ValuePromise {
    fn drop(&mut self) {
        let abandoned = {
            let state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            !state.resolved
        };
        if abandoned {
            self.inner.fulfill(Vec::new());
        }
    }
}

impl FutureInner {
    fn fulfill(&self, value: Vec<u8>) {
        let continuation = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.resolved {
                return;
            }
            state.resolved = true;
            state.value = Some(value);
            state.continuation.take()
        };
        if let Some(continuation) = continuation {
            let state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(value) = state.value.as_deref() {
                let value = value.to_vec();
                drop(state);
                continuation(&value);
            }
        }
        self.ready.notify_all();
    }
}

/// Await side of a one-shot future.
pub struct ValueFuture {
    inner: Arc<FutureInner>,
}

impl ValueFuture {
    /// Creates a connected promise/future pair.
    #[must_use]
    pub fn pair() -> (ValuePromise, ValueFuture) {
        let inner = Arc::new(FutureInner {
            state: Mutex::new(FutureState {
                value: None,
                resolved: false,
                continuation: None,
            }),
            ready: Condvar::new(),
        });
        (
            ValuePromise {
                inner: Arc::clone(&inner),
            },
            ValueFuture { inner },
        )
    }

    /// Creates an already-resolved future.
    #[must_use]
    pub fn ready(value: Vec<u8>) -> Self {
        let (promise, future) = Self::pair();
        promise.resolve(value);
        future
    }

    /// Whether the value has arrived.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .resolved
    }

    /// Attaches a continuation run at resolution time. Runs immediately when the value is
    /// already there. At most one continuation may be attached.
    pub fn on_resolve(&self, continuation: impl FnOnce(&[u8]) + Send + 'static) {
        let run_now = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.resolved {
                state.value.as_ref().map(|value| value.clone())
            } else {
                debug_assert!(state.continuation.is_none());
                state.continuation = Some(Box::new(continuation));
                return;
            }
        };
        if let Some(value) = run_now {
            continuation(&value);
        }
    }

    /// Blocks until the value arrives and takes it.
    #[must_use]
    pub fn wait(self) -> Vec<u8> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !state.resolved {
            state = self
                .inner
                .ready
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state.value.take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::ValueFuture;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[rstest]
    fn ready_future_resolves_immediately() {
        let future = ValueFuture::ready(b"payload".to_vec());
        assert_that!(future.is_resolved(), eq(true));
        assert_that!(future.wait(), eq(&b"payload".to_vec()));
    }

    #[rstest]
    fn promise_resolution_unblocks_waiters() {
        let (promise, future) = ValueFuture::pair();
        assert_that!(future.is_resolved(), eq(false));
        promise.resolve(b"late".to_vec());
        assert_that!(future.wait(), eq(&b"late".to_vec()));
    }

    #[rstest]
    fn continuation_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&calls);
        let (promise, future) = ValueFuture::pair();
        future.on_resolve(move |value| {
            assert_that!(value, eq(b"x".as_slice()));
            observed.fetch_add(1, Ordering::SeqCst);
        });
        promise.resolve(b"x".to_vec());
        assert_that!(calls.load(Ordering::SeqCst), eq(1));
    }

    #[rstest]
    fn dropped_promise_resolves_empty() {
        let (promise, future) = ValueFuture::pair();
        drop(promise);
        assert_that!(future.wait(), eq(&Vec::<u8>::new()));
    }
}
