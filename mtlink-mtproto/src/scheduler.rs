//! Deadline-ordered task queue driven by an external clock.
//!
//! The owner's event loop asks for [`Scheduler::next_deadline`], sleeps until
//! then (or until other input arrives) and drains [`Scheduler::pop_due`].
//! Time is an opaque millisecond counter, so tests can advance it by hand.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Handle returned by [`Scheduler::schedule`], used to cancel the entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// A min-heap of `(deadline, action)` pairs.
#[derive(Debug)]
pub struct Scheduler<A> {
    heap: BinaryHeap<Reverse<(u64, TimerId)>>,
    actions: HashMap<TimerId, A>,
    next_id: u64,
}

impl<A> Default for Scheduler<A> {
    fn default() -> Self { Self::new() }
}

impl<A> Scheduler<A> {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), actions: HashMap::new(), next_id: 0 }
    }

    /// Run `action` once the clock reaches `deadline`.
    pub fn schedule(&mut self, deadline: u64, action: A) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.actions.insert(id, action);
        id
    }

    /// Drop a pending entry. Returns its action if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<A> {
        self.actions.remove(&id)
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.actions.contains_key(&id)
    }

    /// Number of live (not cancelled, not fired) entries.
    pub fn len(&self) -> usize { self.actions.len() }

    pub fn is_empty(&self) -> bool { self.actions.is_empty() }

    /// Earliest deadline among live entries.
    pub fn next_deadline(&mut self) -> Option<u64> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.actions.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every entry whose deadline is `<= now`, in deadline
    /// order (ties in scheduling order).
    pub fn pop_due(&mut self, now: u64) -> Vec<(TimerId, A)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(action) = self.actions.remove(&id) {
                due.push((id, action));
            }
        }
        due
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.actions.clear();
    }
}
