//! Error types for the runtime
//!
//! Two tiers of failure exist. Expected errors (wrong context, wrong pool,
//! exhausted queue, failed allocation) are returned as [`Error`] values.
//! Invariant violations (accounting underflow, a woken waiter without an
//! owning pool, a completed task found runnable) are bugs and abort via
//! `panic!`/`assert!` rather than surfacing here.

use std::io;

/// Error type for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Allocating a task's private stack failed
    #[error("task stack allocation failed: {0}")]
    StackAllocation(#[source] io::Error),

    /// Spawning a worker thread failed
    #[error("worker thread spawn failed: {0}")]
    Spawn(#[source] io::Error),

    /// The operation requires task context but was called from a plain thread
    #[error("not in task context")]
    NotInTask,

    /// The task has already run to completion
    #[error("task already complete")]
    Completed,

    /// The task is not a member of the pool it was handed to
    #[error("task is not a member of this pool")]
    WrongPool,

    /// The task is already a pool member
    #[error("task is already a pool member")]
    AlreadyMember,

    /// The task is parked on a condition or semaphore waiter queue
    #[error("task is parked on a waiter queue")]
    Parked,

    /// The pool's runnable queue is empty
    #[error("pool runnable queue is empty")]
    Empty,

    /// `execute` was called from inside a task
    #[error("cannot execute a task from task context")]
    NestedExecute,
}

pub type Result<T> = std::result::Result<T, Error>;
