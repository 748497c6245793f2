//! Suspension primitives: `delay`, `yield_now`, and clock access

use super::executor::Executor;
use super::timer::TimerId;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

/// Future returned by [`delay`]
///
/// The deadline is fixed and the timer registered on first poll, so a delay
/// built ahead of time still waits its full duration once awaited. Dropping
/// it (for example because the task was cancelled) removes the timer.
pub struct Delay {
    duration: Duration,
    deadline: Option<Duration>,
    timer: Option<TimerId>,
    executor: Weak<Executor>,
}

impl Delay {
    /// Absolute deadline on the runtime clock; `None` until first polled
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(executor) = self.executor.upgrade() else {
            return Poll::Ready(());
        };

        let now = executor.now();
        let duration = self.duration;
        // Durations near `Duration::MAX` mean "never"
        let deadline = *self
            .deadline
            .get_or_insert_with(|| now.saturating_add(duration));

        if now >= deadline {
            if let Some(id) = self.timer.take() {
                executor.cancel_timer(id);
            }
            return Poll::Ready(());
        }

        match self.timer {
            Some(id) => executor.update_timer(id, cx.waker()),
            None => {
                let id = executor.schedule_timer(deadline, cx.waker().clone());
                self.timer = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take()
            && let Some(executor) = self.executor.upgrade()
        {
            executor.cancel_timer(id);
        }
    }
}

/// Suspend the calling task for `duration`
///
/// The task becomes eligible again no earlier than `now() + duration`; tasks
/// whose deadlines tie resume in the order they called `delay`. A zero
/// duration completes without suspending.
///
/// # Panics
/// Panics when called outside `run_blocking`.
pub fn delay(duration: Duration) -> Delay {
    let executor = Executor::current();
    Delay {
        duration,
        deadline: None,
        timer: None,
        executor: Rc::downgrade(&executor),
    }
}

/// Future returned by [`yield_now`]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Give the other runnable tasks a turn; resumes after them
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Current time on the runtime clock
///
/// # Panics
/// Panics when called outside `run_blocking`.
pub fn now() -> Duration {
    Executor::current().now()
}

/// Run `future` and report how much runtime-clock time it took
pub async fn measure_time<F: Future>(future: F) -> (F::Output, Duration) {
    let start = now();
    let output = future.await;
    (output, now() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::run_blocking;
    use std::cell::RefCell;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_delay_advances_virtual_clock() {
        let elapsed = run_blocking(|_| async {
            let start = now();
            delay(ms(100)).await;
            now() - start
        })
        .unwrap();

        assert_eq!(elapsed, ms(100));
    }

    #[test]
    fn test_zero_delay_does_not_suspend() {
        run_blocking(|_| async {
            let mut d = delay(Duration::ZERO);
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert_eq!(Pin::new(&mut d).poll(&mut cx), Poll::Ready(()));
        })
        .unwrap();
    }

    #[test]
    fn test_dropped_delay_removes_timer() {
        run_blocking(|_| async {
            let mut d = delay(ms(50));
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert!(Pin::new(&mut d).poll(&mut cx).is_pending());

            let executor = Executor::current();
            assert_eq!(executor.pending_timers(), 1);
            drop(d);
            assert_eq!(executor.pending_timers(), 0);
        })
        .unwrap();
    }

    #[test]
    fn test_huge_delay_after_clock_moved() {
        run_blocking(|_| async {
            delay(ms(1)).await;

            let mut d = delay(Duration::MAX);
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert!(Pin::new(&mut d).poll(&mut cx).is_pending());
            assert_eq!(d.deadline(), Some(Duration::MAX));
        })
        .unwrap();
    }

    #[test]
    fn test_deadline_fixed_on_first_poll() {
        let finished_at = run_blocking(|_| async {
            let later = delay(ms(50));
            assert_eq!(later.deadline(), None);

            delay(ms(30)).await;
            later.await;
            now()
        })
        .unwrap();

        assert_eq!(finished_at, ms(80));
    }

    #[test]
    fn test_equal_deadlines_resume_in_call_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let out = order.clone();

        run_blocking(|scope| async move {
            for i in 0..4 {
                let out = out.clone();
                scope.launch(async move {
                    delay(ms(10)).await;
                    out.borrow_mut().push(i);
                });
            }
        })
        .unwrap();

        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_yield_now_interleaves() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let out = order.clone();

        run_blocking(|scope| async move {
            for name in ["a", "b"] {
                let out = out.clone();
                scope.launch(async move {
                    out.borrow_mut().push(format!("{name}1"));
                    yield_now().await;
                    out.borrow_mut().push(format!("{name}2"));
                });
            }
        })
        .unwrap();

        assert_eq!(*order.borrow(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_measure_time() {
        let (value, elapsed) = run_blocking(|_| {
            measure_time(async {
                delay(ms(40)).await;
                delay(ms(60)).await;
                7
            })
        })
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(elapsed, ms(100));
    }

    #[test]
    #[should_panic(expected = "no corun runtime")]
    fn test_delay_outside_runtime_panics() {
        let _ = delay(ms(1));
    }
}
