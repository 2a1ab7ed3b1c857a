//! Asynchronous task tracking.
//!
//! Every long-running workflow is represented by a [`Task`] held in the
//! [`TaskRegistry`]. Callers receive the task id immediately and poll it.

mod registry;
mod worker;

pub use registry::{
    Task, TaskError, TaskLookupError, TaskRegistry, TaskRegistryConfig, TaskStatus,
};
pub use worker::{TaskCleanupWorker, TaskCleanupWorkerConfig};
