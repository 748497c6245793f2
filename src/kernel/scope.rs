//! Structured concurrency scopes
//!
//! A scope groups the tasks launched through it:
//! - Its owner (the future driving the scope) completes only after every
//!   child has finished
//! - Cancelling the scope cancels every live child
//! - The first child failure cancels the siblings and is re-raised in the
//!   owner, so it travels up the scope tree until something absorbs it
//!
//! Scopes hold child *ids*, never futures, so there are no reference cycles:
//! the executor owns the futures and each future owns the scopes it drives.

use super::error::TaskFailure;
use super::executor::Executor;
use super::task::{Deferred, Job, JobCell, TaskId, TaskState};
use pin_project_lite::pin_project;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Unique identifier for a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u64);

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scope({})", self.0)
    }
}

/// Scope lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Accepting new children
    Open,
    /// Owner and all children finished
    Closed,
    /// Cancelled; children were cancelled and new launches are refused
    Cancelled,
}

struct ScopeInner {
    id: ScopeId,
    executor: Weak<Executor>,
    state: Cell<ScopeState>,
    children: RefCell<BTreeSet<TaskId>>,
    failure: RefCell<Option<TaskFailure>>,
    owner: RefCell<Option<Waker>>,
}

/// Handle for launching children into a scope
///
/// Cheap to clone; every clone refers to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

impl Scope {
    pub(crate) fn new(executor: &Rc<Executor>) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                id: ScopeId(executor.next_scope_id()),
                executor: Rc::downgrade(executor),
                state: Cell::new(ScopeState::Open),
                children: RefCell::new(BTreeSet::new()),
                failure: RefCell::new(None),
                owner: RefCell::new(None),
            }),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn state(&self) -> ScopeState {
        self.inner.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ScopeState::Open
    }

    /// Number of children still running
    pub fn child_count(&self) -> usize {
        self.inner.children.borrow().len()
    }

    /// Launch a child task; returns immediately
    ///
    /// The child starts when the run loop reaches it. Launching into a scope
    /// that is closed or cancelled returns a job that is already cancelled.
    pub fn launch<F>(&self, work: F) -> Job
    where
        F: Future<Output = ()> + 'static,
    {
        let executor = match self.inner.executor.upgrade() {
            Some(executor) if self.is_active() => executor,
            executor => {
                log::warn!("{} is {:?}, refusing to launch", self.id(), self.state());
                return refused_job(executor);
            }
        };

        let job = executor.spawn(work, Some(self.clone()));
        self.inner.children.borrow_mut().insert(job.id());
        log::debug!("[{}] {} launched {}", executor.name(), self.id(), job.id());
        job
    }

    /// Launch a child task whose result can be awaited
    pub fn spawn_async<T, F>(&self, work: F) -> Deferred<T>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let result = slot.clone();
        let job = self.launch(async move {
            let value = work.await;
            *result.borrow_mut() = Some(value);
        });
        Deferred::new(job, slot)
    }

    /// Cancel every live child and refuse further launches
    pub fn cancel(&self) {
        if self.state() == ScopeState::Open {
            self.inner.state.set(ScopeState::Cancelled);
            log::debug!("{} cancelled", self.id());
        }
        self.cancel_children();
        self.wake_owner();
    }

    fn cancel_children(&self) {
        let children = std::mem::take(&mut *self.inner.children.borrow_mut());
        if let Some(executor) = self.inner.executor.upgrade() {
            for id in children {
                executor.cancel_task(id);
            }
        }
    }

    /// Called by the executor when a child leaves
    pub(crate) fn child_finished(&self, id: TaskId, failure: Option<TaskFailure>) {
        self.inner.children.borrow_mut().remove(&id);

        if let Some(failure) = failure {
            let first = self.inner.failure.borrow().is_none();
            if first {
                log::debug!("{} failing because of {}", self.id(), failure.task);
                *self.inner.failure.borrow_mut() = Some(failure);
            }
            self.cancel_children();
        }

        self.wake_owner();
    }

    fn take_failure(&self) -> Option<TaskFailure> {
        self.inner.failure.borrow_mut().take()
    }

    fn set_owner(&self, waker: &Waker) {
        let mut owner = self.inner.owner.borrow_mut();
        match owner.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *owner = Some(waker.clone()),
        }
    }

    fn wake_owner(&self) {
        let owner = self.inner.owner.borrow().clone();
        if let Some(waker) = owner {
            waker.wake();
        }
    }

    fn close(&self) {
        if self.state() == ScopeState::Open {
            self.inner.state.set(ScopeState::Closed);
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("children", &self.inner.children.borrow().len())
            .finish()
    }
}

/// A job that never ran
fn refused_job(executor: Option<Rc<Executor>>) -> Job {
    let cell = Rc::new(JobCell::new(TaskId(u64::MAX)));
    cell.finish(TaskState::Cancelled, None);
    let executor = executor.as_ref().map(Rc::downgrade).unwrap_or_default();
    Job::new(cell, executor)
}

/// Cancels the scope if its owner goes away before closing it
pub(crate) struct ScopeGuard {
    scope: Scope,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.scope.state() == ScopeState::Open {
            self.scope.cancel();
        }
    }
}

pin_project! {
    /// Drives a scope's body, then waits for the scope's children
    ///
    /// Output is the body's value. A child failure cancels the rest of the
    /// scope and unwinds out of `poll` carrying the original `TaskFailure`.
    /// Dropping this future cancels every child still running.
    pub struct ScopeFuture<Fut: Future> {
        #[pin]
        body: Option<Fut>,
        output: Option<Fut::Output>,
        guard: ScopeGuard,
    }
}

impl<Fut: Future> ScopeFuture<Fut> {
    pub(crate) fn new(body: Fut, scope: Scope) -> Self {
        Self {
            body: Some(body),
            output: None,
            guard: ScopeGuard { scope },
        }
    }
}

impl<Fut: Future> Future for ScopeFuture<Fut> {
    type Output = Fut::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let scope = this.guard.scope.clone();
        scope.set_owner(cx.waker());

        if let Some(failure) = scope.take_failure() {
            this.body.set(None);
            scope.cancel();
            std::panic::resume_unwind(Box::new(failure));
        }

        let polled = match this.body.as_mut().as_pin_mut() {
            Some(body) => body.poll(cx),
            None => Poll::Pending,
        };
        if let Poll::Ready(value) = polled {
            *this.output = Some(value);
            this.body.set(None);
        }

        if scope.child_count() == 0
            && let Some(value) = this.output.take()
        {
            scope.close();
            return Poll::Ready(value);
        }

        Poll::Pending
    }
}

/// Run `body` in a nested scope; completes once `body` and every child
/// launched into the scope have finished
///
/// # Panics
/// Panics when called outside `run_blocking`.
pub fn coroutine_scope<F, Fut>(body: F) -> ScopeFuture<Fut>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future,
{
    let executor = Executor::current();
    let scope = Scope::new(&executor);
    ScopeFuture::new(body(scope.clone()), scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{delay, run_blocking};
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_scope_waits_for_children() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let out = log.clone();

        run_blocking(|_| async move {
            coroutine_scope(|scope| {
                let log = out.clone();
                async move {
                    for (name, wait) in [("World 2", 200), ("World 1", 100)] {
                        let log = log.clone();
                        scope.launch(async move {
                            delay(ms(wait)).await;
                            log.borrow_mut().push(name);
                        });
                    }
                    log.borrow_mut().push("Hello");
                }
            })
            .await;
            out.borrow_mut().push("Done");
        })
        .unwrap();

        assert_eq!(*log.borrow(), vec!["Hello", "World 1", "World 2", "Done"]);
    }

    #[test]
    fn test_cancel_scope_stops_children() {
        let ticks = Rc::new(Cell::new(0));
        let seen = ticks.clone();

        run_blocking(|root| async move {
            for _ in 0..3 {
                let seen = seen.clone();
                root.launch(async move {
                    loop {
                        delay(ms(10)).await;
                        seen.set(seen.get() + 1);
                    }
                });
            }
            delay(ms(25)).await;
            root.cancel();
            assert_eq!(root.child_count(), 0);
        })
        .unwrap();

        // Each child ticked at 10 and 20 before the cancel at 25
        assert_eq!(ticks.get(), 6);
    }

    #[test]
    fn test_launch_into_closed_scope_is_refused() {
        run_blocking(|_| async move {
            let scope = coroutine_scope(|scope| async move { scope }).await;
            assert_eq!(scope.state(), ScopeState::Closed);

            let job = scope.launch(async {});
            assert!(job.is_cancelled());
            assert_eq!(scope.child_count(), 0);
        })
        .unwrap();
    }

    #[test]
    fn test_child_failure_cancels_siblings() {
        let sibling_ran = Rc::new(Cell::new(false));
        let flag = sibling_ran.clone();

        let result = run_blocking(|scope| async move {
            scope.launch(async move {
                delay(ms(100)).await;
                flag.set(true);
            });
            scope.launch(async {
                delay(ms(10)).await;
                panic!("child blew up");
            });
        });

        let err = result.unwrap_err();
        match err {
            crate::kernel::RuntimeError::UnhandledTaskFailure(failure) => {
                assert_eq!(failure.message, "child blew up");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!sibling_ran.get());
    }

    #[test]
    fn test_scope_ids_are_unique() {
        run_blocking(|root| async move {
            let a = coroutine_scope(|s| async move { s.id() }).await;
            let b = coroutine_scope(|s| async move { s.id() }).await;
            assert_ne!(a, b);
            assert_ne!(a, root.id());
        })
        .unwrap();
    }
}
