//! Task abstraction
//!
//! A Task is the unit of execution in corun. Tasks are cooperative: they run
//! until they hit a suspension point (`delay`, a join, a flow pull) and hand
//! control back to the run loop. The executor owns every task; callers only
//! ever hold a [`Job`] or [`Deferred`] handle.

use super::error::{TaskError, TaskFailure};
use super::executor::Executor;
use std::cell::{Cell, RefCell};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, or currently being polled
    Runnable,
    /// Parked at a suspension point until its waker fires
    Suspended,
    /// Finished, with a value or a failure
    Completed,
    /// Dropped before finishing
    Cancelled,
}

impl TaskState {
    /// Completed and Cancelled are final
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

/// A boxed task future, already wrapped so panics surface as `Err`
pub type BoxFuture = Pin<Box<dyn Future<Output = std::thread::Result<()>> + 'static>>;

/// Completion record shared between the executor and every handle to a task
#[derive(Debug)]
pub(crate) struct JobCell {
    id: TaskId,
    state: Cell<TaskState>,
    failure: RefCell<Option<TaskFailure>>,
    waiters: RefCell<Vec<Waker>>,
}

impl JobCell {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            state: Cell::new(TaskState::Runnable),
            failure: RefCell::new(None),
            waiters: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        if !self.state.get().is_terminal() {
            self.state.set(state);
        }
    }

    pub(crate) fn failure(&self) -> Option<TaskFailure> {
        self.failure.borrow().clone()
    }

    /// Record the final state and wake everyone joining on this task
    pub(crate) fn finish(&self, state: TaskState, failure: Option<TaskFailure>) {
        debug_assert!(state.is_terminal());
        self.state.set(state);
        *self.failure.borrow_mut() = failure;
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waker in waiters {
            waker.wake();
        }
    }

    fn register(&self, waker: &Waker) {
        let mut waiters = self.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }

    /// Terminal outcome, if there is one yet
    fn outcome(&self) -> Option<Result<(), TaskError>> {
        match self.state.get() {
            TaskState::Cancelled => Some(Err(TaskError::Cancelled(self.id))),
            TaskState::Completed => match self.failure() {
                Some(failure) => Some(Err(TaskError::Failed(failure))),
                None => Some(Ok(())),
            },
            _ => None,
        }
    }
}

/// Handle to a launched task
///
/// Dropping a `Job` does not cancel the task; the owning scope keeps it alive.
#[derive(Clone)]
pub struct Job {
    cell: Rc<JobCell>,
    executor: Weak<Executor>,
}

impl Job {
    pub(crate) fn new(cell: Rc<JobCell>, executor: Weak<Executor>) -> Self {
        Self { cell, executor }
    }

    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    pub fn is_active(&self) -> bool {
        !self.cell.state().is_terminal()
    }

    /// True once the task finished on its own (successfully or not)
    pub fn is_completed(&self) -> bool {
        self.cell.state() == TaskState::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.state() == TaskState::Cancelled
    }

    /// The failure the task ended with, if any
    pub fn failure(&self) -> Option<TaskFailure> {
        self.cell.failure()
    }

    /// Cancel the task. Its future is dropped and it never resumes.
    ///
    /// Returns false if the task had already finished.
    pub fn cancel(&self) -> bool {
        match self.executor.upgrade() {
            Some(executor) => executor.cancel_task(self.id()),
            None => false,
        }
    }

    /// Suspend until the task has finished
    pub fn join(&self) -> Join {
        Join {
            cell: self.cell.clone(),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.cell.id)
            .field("state", &self.cell.state())
            .finish()
    }
}

/// Future returned by [`Job::join`]
pub struct Join {
    cell: Rc<JobCell>,
}

impl Future for Join {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                self.cell.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

/// Handle to a task that produces a value
///
/// Await it to get the value back: `let n = deferred.await?;`
pub struct Deferred<T> {
    job: Job,
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> Deferred<T> {
    pub(crate) fn new(job: Job, slot: Rc<RefCell<Option<T>>>) -> Self {
        Self { job, slot }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn cancel(&self) -> bool {
        self.job.cancel()
    }
}

impl<T> IntoFuture for Deferred<T> {
    type Output = Result<T, TaskError>;
    type IntoFuture = Await<T>;

    fn into_future(self) -> Await<T> {
        Await { deferred: self }
    }
}

/// Future that resolves a [`Deferred`] into its value
pub struct Await<T> {
    deferred: Deferred<T>,
}

impl<T> Future for Await<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let cell = &self.deferred.job.cell;
        match cell.outcome() {
            Some(Ok(())) => match self.deferred.slot.borrow_mut().take() {
                Some(value) => Poll::Ready(Ok(value)),
                // Already taken by an earlier await of the same slot
                None => Poll::Ready(Err(TaskError::Cancelled(cell.id))),
            },
            Some(Err(err)) => Poll::Ready(Err(err)),
            None => {
                cell.register(cx.waker());
                Poll::Pending
            }
        }
    }
}
