//! Sequence gate keeping snapshot flushes in ticket order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// Monotonic-ticket gate: each producer takes a ticket per flush and waits its turn, so chunks
/// reach the consumer in exactly the order they were cut, even across producer threads.
#[derive(Debug, Default)]
pub struct FlushGate {
    next_ticket: AtomicU64,
    last_pushed: Mutex<u64>,
    turn: Condvar,
}

impl FlushGate {
    /// Creates a gate with no outstanding tickets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next flush slot.
    #[must_use]
    pub fn take_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Blocks until every earlier ticket has completed.
    pub fn wait_turn(&self, ticket: u64) {
        let mut last = self
            .last_pushed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while *last + 1 != ticket {
            last = self
                .turn
                .wait(last)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Marks a ticket complete, releasing the next one in line.
    pub fn complete(&self, ticket: u64) {
        let mut last = self
            .last_pushed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug_assert_eq!(*last + 1, ticket, "flush completed out of order");
        *last = ticket;
        drop(last);
        self.turn.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::FlushGate;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[rstest]
    fn tickets_complete_in_order_across_threads() {
        let gate = Arc::new(FlushGate::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            let started = Arc::clone(&started);
            handles.push(thread::spawn(move || {
                let ticket = gate.take_ticket();
                started.fetch_add(1, Ordering::SeqCst);
                gate.wait_turn(ticket);
                order
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(ticket);
                gate.complete(ticket);
            }));
        }
        for handle in handles {
            handle.join().expect("worker must not panic");
        }

        let order = order
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let expected: Vec<u64> = (1..=8).collect();
        assert_that!(order.as_slice(), eq(expected.as_slice()));
    }
}
