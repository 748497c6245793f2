//! Timeout support
//!
//! `with_timeout_or_null` runs its body in a nested scope and races it
//! against a timer. If the timer wins, the body and every child it launched
//! are cancelled and the result is `None`; the timeout itself is not an error.
//! Failures inside the body still propagate.

use super::delay::{Delay, delay};
use super::executor::Executor;
use super::scope::{Scope, ScopeFuture};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

pin_project! {
    /// Future returned by [`with_timeout_or_null`]
    pub struct WithTimeout<Fut: Future> {
        #[pin]
        inner: Option<ScopeFuture<Fut>>,
        #[pin]
        timer: Delay,
    }
}

impl<Fut: Future> Future for WithTimeout<Fut> {
    type Output = Option<Fut::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        // The body gets the last word when both are ready at the same instant
        let polled = match this.inner.as_mut().as_pin_mut() {
            Some(inner) => inner.poll(cx),
            None => return Poll::Ready(None),
        };
        if let Poll::Ready(value) = polled {
            this.inner.set(None);
            return Poll::Ready(Some(value));
        }

        if this.timer.poll(cx).is_ready() {
            log::debug!("timeout elapsed, cancelling body");
            // Dropping the scope future cancels the body's children
            this.inner.set(None);
            return Poll::Ready(None);
        }

        Poll::Pending
    }
}

/// Run `body` in a nested scope for at most `duration`
///
/// Returns `Some(value)` if the body (and everything it launched) finished in
/// time, `None` otherwise. The clock starts when the returned future is first
/// polled, not when it is built. `Duration::MAX` never times out.
///
/// # Panics
/// Panics when called outside `run_blocking`.
pub fn with_timeout_or_null<F, Fut>(duration: Duration, body: F) -> WithTimeout<Fut>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future,
{
    let executor = Executor::current();
    let scope = Scope::new(&executor);
    WithTimeout {
        inner: Some(ScopeFuture::new(body(scope.clone()), scope)),
        timer: delay(duration),
    }
}
