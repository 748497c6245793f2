//! Runtime error types

use super::task::TaskId;
use std::any::Any;

/// Runtime result type
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A task ended by panicking
///
/// Scope owners re-raise the first failure of their children, so the value
/// that reaches `run_blocking` still names the task that actually failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{task} failed: {message}")]
pub struct TaskFailure {
    pub task: TaskId,
    pub message: String,
}

impl TaskFailure {
    pub fn new(task: TaskId, message: impl Into<String>) -> Self {
        Self {
            task,
            message: message.into(),
        }
    }

    /// Convert a caught panic payload
    ///
    /// A payload that is already a `TaskFailure` (re-raised by a scope) is kept as is.
    pub(crate) fn from_panic(task: TaskId, payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<TaskFailure>() {
            Ok(failure) => *failure,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "task panicked".to_string()
                };
                Self { task, message }
            }
        }
    }
}

/// Why awaiting a task did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was cancelled before it finished. Not a failure.
    #[error("{0} was cancelled")]
    Cancelled(TaskId),
    /// The task panicked
    #[error(transparent)]
    Failed(#[from] TaskFailure),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }
}

/// Errors reported by `run_blocking`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// A task failed and nothing between it and the root absorbed the failure
    #[error("unhandled task failure: {0}")]
    UnhandledTaskFailure(#[from] TaskFailure),
    /// Tasks remain but none can ever be woken
    #[error("deadlock: {blocked} task(s) suspended with no pending timers")]
    Deadlock { blocked: usize },
    /// The root task was cancelled, so there is no value to return
    #[error("root task was cancelled")]
    RootCancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_from_str_payload() {
        let payload: Box<dyn Any + Send> = Box::new("bad state");
        let failure = TaskFailure::from_panic(TaskId(5), payload);
        assert_eq!(failure, TaskFailure::new(TaskId(5), "bad state"));
    }

    #[test]
    fn test_failure_from_string_payload() {
        let payload: Box<dyn Any + Send> = Box::new(format!("code {}", 404));
        let failure = TaskFailure::from_panic(TaskId(1), payload);
        assert_eq!(failure.message, "code 404");
    }

    #[test]
    fn test_reraised_failure_keeps_origin() {
        let original = TaskFailure::new(TaskId(3), "inner");
        let payload: Box<dyn Any + Send> = Box::new(original.clone());
        // Caught again further up, in a different task
        assert_eq!(TaskFailure::from_panic(TaskId(0), payload), original);
    }

    #[test]
    fn test_opaque_payload() {
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(TaskFailure::from_panic(TaskId(2), payload).message, "task panicked");
    }

    #[test]
    fn test_display() {
        let failure = TaskFailure::new(TaskId(8), "oops");
        assert_eq!(failure.to_string(), "Task(8) failed: oops");
        assert_eq!(
            RuntimeError::from(failure).to_string(),
            "unhandled task failure: Task(8) failed: oops"
        );
        assert_eq!(TaskError::Cancelled(TaskId(2)).to_string(), "Task(2) was cancelled");
        assert_eq!(
            RuntimeError::Deadlock { blocked: 2 }.to_string(),
            "deadlock: 2 task(s) suspended with no pending timers"
        );
    }
}
