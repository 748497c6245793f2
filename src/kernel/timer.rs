//! Timer System
//!
//! Backs `delay` and timeouts.
//!
//! Design:
//! - TimerQueue is a min-heap keyed by (deadline, insertion sequence), so
//!   timers sharing a deadline fire in the order they were scheduled
//! - Timer bodies live in a slab; heap entries carry the sequence number so a
//!   stale entry never fires a timer that reused the same slot
//! - Firing a timer hands back its waker; the run loop wakes it outside the borrow

use slab::Slab;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::task::Waker;
use std::time::Duration;

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    key: usize,
    seq: u64,
}

/// A pending timer
#[derive(Debug)]
struct Timer {
    seq: u64,
    deadline: Duration,
    waker: Waker,
}

/// Entry in the timer heap (for ordering)
#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: Duration,
    seq: u64,
    key: usize,
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap: earliest deadline first, then oldest timer
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Timer queue - manages all pending timers
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    timers: Slab<Timer>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a one-shot timer that wakes `waker` at `deadline`
    pub fn schedule(&mut self, deadline: Duration, waker: Waker) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;

        let key = self.timers.insert(Timer {
            seq,
            deadline,
            waker,
        });
        self.heap.push(TimerEntry { deadline, seq, key });

        TimerId { key, seq }
    }

    /// Replace the waker of a pending timer (a task may be polled with a new one)
    pub fn update_waker(&mut self, id: TimerId, waker: &Waker) {
        if let Some(timer) = self.lookup_mut(id)
            && !timer.waker.will_wake(waker)
        {
            timer.waker = waker.clone();
        }
    }

    /// Cancel a timer
    /// Returns false if the timer already fired or was cancelled
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.lookup_mut(id).is_some() {
            self.timers.remove(id.key);
            true
        } else {
            false
        }
    }

    /// Remove every timer whose deadline is at or before `now`
    ///
    /// Wakers come back in firing order. The heap entries of cancelled timers
    /// are discarded along the way.
    pub fn fire_due(&mut self, now: Duration) -> Vec<Waker> {
        let mut woken = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else { break };
            let id = TimerId {
                key: entry.key,
                seq: entry.seq,
            };
            if self.lookup_mut(id).is_some() {
                woken.push(self.timers.remove(entry.key).waker);
            }
        }

        woken
    }

    /// Earliest deadline among pending timers
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_stale();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Number of pending timers
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.timers.get(id.key).is_some_and(|t| t.seq == id.seq)
    }

    /// Deadline of a pending timer
    pub fn deadline(&self, id: TimerId) -> Option<Duration> {
        self.timers
            .get(id.key)
            .filter(|t| t.seq == id.seq)
            .map(|t| t.deadline)
    }

    /// Drop every timer without waking anything
    pub fn clear(&mut self) {
        self.heap.clear();
        self.timers.clear();
    }

    fn lookup_mut(&mut self, id: TimerId) -> Option<&mut Timer> {
        self.timers.get_mut(id.key).filter(|t| t.seq == id.seq)
    }

    fn discard_stale(&mut self) {
        while let Some(entry) = self.heap.peek() {
            let live = self
                .timers
                .get(entry.key)
                .is_some_and(|t| t.seq == entry.seq);
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}
