//! Runtime clock
//!
//! Time is measured as a `Duration` since the runtime started.
//! - Virtual: logical time that only moves when the run loop is idle and jumps
//!   straight to the next timer deadline. Deterministic, no real sleeping.
//! - Wall: monotonic real time; the run loop sleeps the thread until the next deadline.

use std::cell::Cell;
use std::time::{Duration, Instant};

/// Which notion of time a runtime uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    #[default]
    Virtual,
    Wall,
}

#[derive(Debug)]
pub(crate) enum Clock {
    Virtual(Cell<Duration>),
    Wall(Instant),
}

impl Clock {
    pub(crate) fn new(mode: ClockMode) -> Self {
        match mode {
            ClockMode::Virtual => Clock::Virtual(Cell::new(Duration::ZERO)),
            ClockMode::Wall => Clock::Wall(Instant::now()),
        }
    }

    pub(crate) fn now(&self) -> Duration {
        match self {
            Clock::Virtual(now) => now.get(),
            Clock::Wall(start) => start.elapsed(),
        }
    }

    /// Move time forward to `deadline`. Never moves backwards.
    pub(crate) fn advance_to(&self, deadline: Duration) {
        match self {
            Clock::Virtual(now) => {
                if deadline > now.get() {
                    now.set(deadline);
                }
            }
            Clock::Wall(start) => {
                let elapsed = start.elapsed();
                if deadline > elapsed {
                    std::thread::sleep(deadline - elapsed);
                }
            }
        }
    }
}
