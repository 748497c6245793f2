//! Async executor for cooperative multitasking
//!
//! One executor per `run_blocking` call, driven on the calling thread:
//! - FIFO run queue fed by wakers (no busy-waiting)
//! - Timer queue for `delay`; when nothing is runnable the clock jumps (virtual)
//!   or sleeps (wall) to the next deadline
//! - Cancellation drops the task's future, so `Drop` impls are the release path
//! - Panics are caught at the task boundary and reported to the task's scope
//!
//! Invariant: no `RefCell` borrow is held while a task future is polled or
//! dropped. Polling and dropping re-enter the executor (spawn, timers, cancel).

use super::clock::{Clock, ClockMode};
use super::config::Config;
use super::error::{RuntimeError, TaskFailure};
use super::scope::Scope;
use super::task::{BoxFuture, Job, JobCell, TaskId, TaskState};
use super::timer::{TimerId, TimerQueue};
use futures::FutureExt;
use futures::task::ArcWake;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

thread_local! {
    /// The executor driving the current `run_blocking` call, if any
    static CURRENT: RefCell<Option<Rc<Executor>>> = const { RefCell::new(None) };
}

/// Restores the previously installed executor when dropped
pub(crate) struct EnterGuard {
    previous: Option<Rc<Executor>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

// ============================================================================
// Wake queue
// ============================================================================

/// FIFO of task ids whose wakers fired
///
/// Wakers must be `Send + Sync`, so this is the one piece of shared state
/// behind a lock. Each id is queued at most once.
#[derive(Default)]
struct WakeQueue {
    inner: Mutex<WakeQueueInner>,
}

#[derive(Default)]
struct WakeQueueInner {
    order: VecDeque<TaskId>,
    queued: HashSet<TaskId>,
}

impl WakeQueue {
    fn push(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.queued.insert(id) {
            inner.order.push_back(id);
        }
    }

    fn pop(&self) -> Option<TaskId> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.order.pop_front()?;
        inner.queued.remove(&id);
        Some(id)
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.order.clear();
        inner.queued.clear();
    }
}

/// Waker payload: re-queue one task
struct TaskWaker {
    id: TaskId,
    queue: Arc<WakeQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.queue.push(arc_self.id);
    }
}

// ============================================================================
// Executor
// ============================================================================

/// A managed task with metadata
struct ManagedTask {
    id: TaskId,
    future: BoxFuture,
    /// Scope the task was launched into; `None` for the root task
    scope: Option<Scope>,
    job: Rc<JobCell>,
    /// Built once so every poll hands the task the same waker
    waker: Waker,
}

/// How a task left the executor
enum Exit {
    Completed,
    Cancelled,
    Failed(TaskFailure),
}

/// The executor - runs async tasks cooperatively on one thread
pub struct Executor {
    config: Config,
    clock: Clock,

    /// All live tasks except the one being polled right now
    tasks: RefCell<BTreeMap<TaskId, ManagedTask>>,

    /// Tasks ready to be polled, in wake order
    ready: Arc<WakeQueue>,

    timers: RefCell<TimerQueue>,

    next_id: Cell<u64>,
    next_scope_id: Cell<u64>,

    /// Task currently being polled
    current: Cell<Option<TaskId>>,
    /// Set when the polled task is cancelled from inside its own poll
    cancel_current: Cell<bool>,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Self {
            clock: Clock::new(config.clock),
            config,
            tasks: RefCell::new(BTreeMap::new()),
            ready: Arc::new(WakeQueue::default()),
            timers: RefCell::new(TimerQueue::new()),
            next_id: Cell::new(0),
            next_scope_id: Cell::new(0),
            current: Cell::new(None),
            cancel_current: Cell::new(false),
        }
    }

    /// The executor installed on this thread
    ///
    /// # Panics
    /// Panics when called outside `run_blocking`.
    pub(crate) fn current() -> Rc<Executor> {
        match Self::try_current() {
            Some(executor) => executor,
            None => panic!("no corun runtime on this thread: call this inside run_blocking"),
        }
    }

    pub(crate) fn try_current() -> Option<Rc<Executor>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Install `executor` as this thread's current runtime until the guard drops
    pub(crate) fn enter(executor: Rc<Executor>) -> EnterGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(executor));
        EnterGuard { previous }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn clock_mode(&self) -> ClockMode {
        self.config.clock
    }

    /// Current time on this runtime's clock
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub(crate) fn next_scope_id(&self) -> u64 {
        let id = self.next_scope_id.get();
        self.next_scope_id.set(id + 1);
        id
    }

    /// Spawn a future as a new task, returns its handle
    ///
    /// The task is queued at the back of the run queue; it does not run until
    /// the run loop reaches it.
    pub(crate) fn spawn<F>(self: &Rc<Self>, future: F, scope: Option<Scope>) -> Job
    where
        F: Future<Output = ()> + 'static,
    {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let job = Rc::new(JobCell::new(id));
        let waker = futures::task::waker(Arc::new(TaskWaker {
            id,
            queue: self.ready.clone(),
        }));
        let task = ManagedTask {
            id,
            future: Box::pin(AssertUnwindSafe(future).catch_unwind()),
            scope,
            job: job.clone(),
            waker,
        };

        self.tasks.borrow_mut().insert(id, task);
        self.ready.push(id);
        log::trace!("[{}] spawned {}", self.config.name, id);

        Job::new(job, Rc::downgrade(self))
    }

    /// Run until every task has finished
    ///
    /// Fails with `Deadlock` when tasks remain but none is runnable and no
    /// timer is pending; those tasks are cancelled first.
    pub fn run(&self) -> Result<(), RuntimeError> {
        loop {
            self.fire_due_timers();

            if let Some(id) = self.ready.pop() {
                self.poll_task(id);
                continue;
            }

            if !self.has_tasks() {
                return Ok(());
            }

            let next = self.timers.borrow_mut().next_deadline();
            match next {
                Some(deadline) => {
                    log::trace!("[{}] idle, advancing clock to {:?}", self.config.name, deadline);
                    self.clock.advance_to(deadline);
                }
                None => {
                    let blocked = self.task_count();
                    log::warn!(
                        "[{}] deadlock: {} task(s) can never be woken",
                        self.config.name,
                        blocked
                    );
                    self.shutdown();
                    return Err(RuntimeError::Deadlock { blocked });
                }
            }
        }
    }

    /// Cancel every remaining task and drop all timers
    pub fn shutdown(&self) {
        let ids: Vec<TaskId> = self.tasks.borrow().keys().copied().collect();
        for id in ids {
            self.cancel_task(id);
        }
        self.timers.borrow_mut().clear();
        self.ready.clear();
    }

    /// Check if there are any live tasks
    pub fn has_tasks(&self) -> bool {
        !self.tasks.borrow().is_empty() || self.current.get().is_some()
    }

    /// Get count of live tasks
    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len() + usize::from(self.current.get().is_some())
    }

    /// Cancel a task by ID
    ///
    /// The task's future is dropped right away, which releases whatever it
    /// owns and cancels any scope it was driving. A task that cancels itself
    /// is dropped as soon as its current poll returns.
    /// Returns true if the task existed and was cancelled.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        if self.current.get() == Some(id) {
            self.cancel_current.set(true);
            return true;
        }

        let task = self.tasks.borrow_mut().remove(&id);
        match task {
            Some(task) => {
                self.finish(task, Exit::Cancelled);
                true
            }
            None => false,
        }
    }

    fn fire_due_timers(&self) {
        let now = self.clock.now();
        let wakers = self.timers.borrow_mut().fire_due(now);
        if !wakers.is_empty() {
            log::trace!("[{}] {} timer(s) fired at {:?}", self.config.name, wakers.len(), now);
        }
        for waker in wakers {
            waker.wake();
        }
    }

    fn poll_task(&self, id: TaskId) {
        // Stale wake for a task that already finished
        let Some(mut task) = self.tasks.borrow_mut().remove(&id) else {
            return;
        };

        task.job.set_state(TaskState::Runnable);
        self.current.set(Some(id));
        self.cancel_current.set(false);

        let waker = task.waker.clone();
        let mut cx = Context::from_waker(&waker);
        let poll = task.future.as_mut().poll(&mut cx);

        self.current.set(None);
        let cancelled = self.cancel_current.replace(false);

        match poll {
            Poll::Pending if cancelled => self.finish(task, Exit::Cancelled),
            Poll::Pending => {
                task.job.set_state(TaskState::Suspended);
                self.tasks.borrow_mut().insert(id, task);
            }
            Poll::Ready(Ok(())) => self.finish(task, Exit::Completed),
            Poll::Ready(Err(payload)) => {
                let failure = TaskFailure::from_panic(id, payload);
                self.finish(task, Exit::Failed(failure));
            }
        }
    }

    /// Retire a task: drop its future, settle its handle, tell its scope
    fn finish(&self, task: ManagedTask, exit: Exit) {
        let ManagedTask {
            id,
            future,
            scope,
            job,
            ..
        } = task;

        // Dropping may cascade into nested scopes; nothing is borrowed here
        drop(future);

        let failure = match exit {
            Exit::Completed => {
                log::trace!("[{}] {} completed", self.config.name, id);
                job.finish(TaskState::Completed, None);
                None
            }
            Exit::Cancelled => {
                log::debug!("[{}] {} cancelled", self.config.name, id);
                job.finish(TaskState::Cancelled, None);
                None
            }
            Exit::Failed(failure) => {
                log::warn!("[{}] {}", self.config.name, failure);
                job.finish(TaskState::Completed, Some(failure.clone()));
                Some(failure)
            }
        };

        if let Some(scope) = scope {
            scope.child_finished(id, failure);
        }
    }

    // ========================================================================
    // Timer access for `Delay`
    // ========================================================================

    pub(crate) fn schedule_timer(&self, deadline: Duration, waker: Waker) -> TimerId {
        self.timers.borrow_mut().schedule(deadline, waker)
    }

    pub(crate) fn update_timer(&self, id: TimerId, waker: &Waker) {
        self.timers.borrow_mut().update_waker(id, waker);
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    /// Number of timers waiting to fire
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().pending_count()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if !self.tasks.get_mut().is_empty() {
            log::debug!(
                "[{}] dropping executor with {} live task(s)",
                self.config.name,
                self.tasks.get_mut().len()
            );
        }
    }
}
