//! corun - a small cooperative coroutine runtime
//!
//! Design principles:
//! - Single-threaded and deterministic: tasks interleave only at explicit
//!   suspension points, in a reproducible order
//! - Structured: every task lives in a scope, and a scope finishes only after
//!   all of its children
//! - Cancellation is dropping: a cancelled task's future is dropped at its
//!   current suspension point and never polled again
//! - Time is virtual by default so timing-sensitive code tests instantly
//!
//! ```
//! use corun::{delay, flow, run_blocking};
//! use std::time::Duration;
//!
//! let values = run_blocking(|_| async {
//!     flow(|emitter| async move {
//!         for i in 1..=3 {
//!             delay(Duration::from_millis(100)).await;
//!             emitter.emit(i).await;
//!         }
//!     })
//!     .to_vec()
//!     .await
//! })
//! .unwrap();
//! assert_eq!(values, vec![1, 2, 3]);
//! ```

pub mod flow;
pub mod kernel;

pub use flow::{Emit, Emitter, Flow, FlowStream, flow, flow_of};
pub use kernel::{
    ClockMode, Config, Deferred, Job, RuntimeError, RuntimeResult, Scope, ScopeState, TaskError,
    TaskFailure, TaskId, TaskState, coroutine_scope, delay, measure_time, now, run_blocking,
    run_blocking_with, with_timeout_or_null, yield_now,
};
