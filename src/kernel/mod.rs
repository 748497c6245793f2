//! The kernel - cooperative task execution with structured scopes
//!
//! - One executor per `run_blocking` call, driven on the calling thread
//! - Tasks suspend only at explicit points: `delay`, joins, flow pulls,
//!   `yield_now`, timeout boundaries
//! - Every task belongs to a scope; scopes wait for, cancel, and fail with
//!   their children

pub mod clock;
pub mod config;
pub mod delay;
pub mod error;
pub mod executor;
pub mod scope;
pub mod task;
pub mod timeout;
pub mod timer;


pub use clock::ClockMode;
pub use config::Config;
pub use delay::{Delay, YieldNow, delay, measure_time, now, yield_now};
pub use error::{RuntimeError, RuntimeResult, TaskError, TaskFailure};
pub use executor::Executor;
pub use scope::{Scope, ScopeFuture, ScopeId, ScopeState, coroutine_scope};
pub use task::{Await, Deferred, Job, Join, TaskId, TaskState};
pub use timeout::{WithTimeout, with_timeout_or_null};

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

/// Run `body` on a fresh virtual-clock runtime, blocking until every task it
/// spawned (transitively) has finished
///
/// `body` receives the root scope. Returns the body's value, or
/// `UnhandledTaskFailure` if a task panicked and the failure reached the root.
pub fn run_blocking<T, F, Fut>(body: F) -> RuntimeResult<T>
where
    T: 'static,
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = T> + 'static,
{
    run_blocking_with(Config::default(), body)
}

/// Same as [`run_blocking`] with an explicit configuration
pub fn run_blocking_with<T, F, Fut>(config: Config, body: F) -> RuntimeResult<T>
where
    T: 'static,
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = T> + 'static,
{
    let executor = Rc::new(Executor::new(config));
    let _enter = Executor::enter(executor.clone());
    log::info!("[{}] runtime started ({:?} clock)", executor.name(), executor.clock_mode());

    let scope = Scope::new(&executor);
    let root_body = ScopeFuture::new(body(scope.clone()), scope);
    let output = Rc::new(RefCell::new(None));
    let slot = output.clone();
    let root = executor.spawn(
        async move {
            let value = root_body.await;
            *slot.borrow_mut() = Some(value);
        },
        None,
    );

    let run = executor.run();
    executor.shutdown();
    log::info!("[{}] runtime stopped at {:?}", executor.name(), executor.now());
    run?;

    if let Some(failure) = root.failure() {
        return Err(RuntimeError::UnhandledTaskFailure(failure));
    }
    let value = output.borrow_mut().take();
    value.ok_or(RuntimeError::RootCancelled)
}
