//! Task objects and the suspend/resume protocol
//!
//! A task is a cooperatively scheduled coroutine with a private stack. A
//! worker thread enters a task with [`execute`], which switches onto the
//! task's stack; the task hands control back with [`suspend`] (directly, or
//! through [`yield_now`], a condition wait, or a semaphore down). A task
//! migrates freely between worker threads across suspensions; the executor
//! mutex guarantees at most one thread is ever on a given task's stack.
//!
//! # Design Notes
//!
//! The stack switch itself is delegated to `corosensei`: the coroutine body
//! is a trampoline that runs the user entry function, and the coroutine's
//! yielder is stashed in the task so that deeply nested code can suspend
//! without threading the yielder through every call. The current task is
//! tracked in a thread-local set only by [`execute`].

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::thread;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::pool::TaskPool;
use crate::registry;

// ============================================================================
// Scheduling state
// ============================================================================

/// Which queue, if any, currently links this task.
///
/// A task is linked into at most one queue at a time: a pool's runnable
/// queue, a condition's waiter queue, or a semaphore's waiter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Linkage {
    /// Not linked anywhere (detached, or currently executing off-queue)
    Unlinked,
    /// Linked into the owning pool's runnable queue
    RunQueue,
    /// Parked on a condition's waiter queue
    ConditionQueue,
    /// Parked on a semaphore's waiter queue
    SemaphoreQueue,
}

/// Pool membership and queue linkage, guarded by the task's sched lock.
pub(crate) struct SchedState {
    /// The pool that owns this task's membership, if any
    pub(crate) pool: Option<Arc<TaskPool>>,
    /// Where the task's queue linkage currently lives
    pub(crate) link: Linkage,
}

// ============================================================================
// Task
// ============================================================================

/// The coroutine and its stack, guarded by the executor mutex.
struct StackCell {
    coroutine: Coroutine<(), (), ()>,
}

// Safety: `Coroutine` is `!Send` because a suspended stack may pin non-Send
// locals. Resumption is serialized by the executor mutex, and the API
// contract on `Task::new` requires values held across suspension points to
// be `Send`; under that contract moving the suspended stack between worker
// threads is sound.
unsafe impl Send for StackCell {}

/// A cooperatively scheduled coroutine with a private stack
///
/// Handles are reference counted (`Arc`); a task stays alive while a user
/// handle exists, while it is linked into any queue, and while a worker
/// thread is executing it. All synchronization primitives in this crate
/// accept tasks through these shared handles.
pub struct Task {
    id: u64,
    name: Option<String>,
    /// Exclusive executor lock: held by the one thread running this task's
    /// stack for the entire span between entering and suspending.
    stack_cell: Mutex<StackCell>,
    complete: AtomicBool,
    result: AtomicI32,
    /// Saved switch-back point into the worker thread, published by the
    /// trampoline on first entry. Stable for the task's lifetime.
    yielder: AtomicPtr<Yielder<(), ()>>,
    pub(crate) sched: Mutex<SchedState>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

impl Task {
    /// Create a new task with a private stack of `stack_size` bytes
    ///
    /// The entry function runs the first time the task is executed and its
    /// return value is retained as the task result. The runtime does not
    /// guard against stack overflow; pick a stack large enough for the
    /// deepest call chain the entry will make.
    ///
    /// Values the entry function keeps alive across suspension points
    /// ([`suspend`], [`yield_now`], condition waits, semaphore downs, pool
    /// switches) must be `Send`: the task may resume on a different worker
    /// thread than the one it suspended on.
    ///
    /// # Arguments
    /// * `name` - Optional name for debugging
    /// * `stack_size` - Size of the task's private stack in bytes
    /// * `entry` - Function to run on the task's stack
    ///
    /// # Errors
    /// Returns [`Error::StackAllocation`] if the stack cannot be allocated.
    pub fn new<F>(name: Option<&str>, stack_size: usize, entry: F) -> Result<Arc<Self>>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let stack = DefaultStack::new(stack_size).map_err(Error::StackAllocation)?;

        let coroutine: Coroutine<(), (), ()> = Coroutine::with_stack(stack, move |yielder, ()| {
            // Invariant: execute() set the thread-local before switching in.
            // The handle is not kept across entry(): a reference held on the
            // task's own stack would keep the task alive forever.
            {
                let task = current().expect("task trampoline entered without a current task");
                task.yielder.store(
                    yielder as *const Yielder<(), ()> as *mut Yielder<(), ()>,
                    Ordering::Release,
                );
            }

            let result = entry();

            let task = current().expect("current task changed underneath its own entry");
            task.finish(result);
        });

        let task = Arc::new(Task {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.map(String::from),
            stack_cell: Mutex::new(StackCell { coroutine }),
            complete: AtomicBool::new(false),
            result: AtomicI32::new(0),
            yielder: AtomicPtr::new(std::ptr::null_mut()),
            sched: Mutex::new(SchedState {
                pool: None,
                link: Linkage::Unlinked,
            }),
        });

        registry::register(&task);
        log::trace!("task {} created (stack {} bytes)", task.id, stack_size);
        Ok(task)
    }

    /// Get the task's unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the task's name, if one was given
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the entry function has returned
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// The entry function's return value, once the task is complete
    pub fn result(&self) -> Option<i32> {
        if self.is_complete() {
            Some(self.result.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// The pool that currently owns this task's membership, if any
    pub fn pool(&self) -> Option<Arc<TaskPool>> {
        self.sched.lock().pool.clone()
    }

    /// Tail of the trampoline: record the result and leave the owning pool.
    fn finish(&self, result: i32) {
        self.result.store(result, Ordering::Release);
        self.complete.store(true, Ordering::Release);

        let pool = self.sched.lock().pool.clone();
        if let Some(pool) = pool {
            pool.erase(self).expect("completed task could not leave its pool");
        }

        let sched = self.sched.lock();
        assert!(sched.pool.is_none(), "completed task still owns a pool");
        assert_eq!(
            sched.link,
            Linkage::Unlinked,
            "completed task is still linked into a queue"
        );
        drop(sched);

        log::debug!("task {} complete (result {})", self.id, result);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        registry::unregister(self.id);

        // A task abandoned while still a pool member (popped and parked
        // forever, then all handles dropped) must not skew the pool's
        // accounting.
        let sched = self.sched.get_mut();
        if let Some(pool) = sched.pool.take() {
            pool.forget_member();
        }

        log::trace!("task {} dropped", self.id);
    }
}

// ============================================================================
// Context operations
// ============================================================================

/// Get the task executing on the current thread, if any
pub fn current() -> Option<Arc<Task>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Run a task on the calling thread until it suspends or completes
///
/// The calling thread must not itself be executing a task. The call holds
/// the task's executor mutex for the entire span on the task's stack, so a
/// task that was made runnable again before its previous executor returned
/// (a yield racing a wakeup) is simply resumed once the first executor has
/// fully switched out.
///
/// # Errors
/// * [`Error::NestedExecute`] if called from task context
/// * [`Error::Completed`] if the task's entry function has already returned
pub fn execute(task: &Arc<Task>) -> Result<()> {
    if current().is_some() {
        return Err(Error::NestedExecute);
    }
    if task.is_complete() {
        return Err(Error::Completed);
    }

    let mut cell = task.stack_cell.lock();
    // The task may have completed while we waited for its executor.
    if task.is_complete() {
        return Err(Error::Completed);
    }

    CURRENT.with(|c| *c.borrow_mut() = Some(task.clone()));
    log::trace!("task {} entered on {:?}", task.id(), thread::current().id());

    let outcome = cell.coroutine.resume(());

    CURRENT.with(|c| *c.borrow_mut() = None);
    match outcome {
        CoroutineResult::Yield(()) => log::trace!("task {} suspended", task.id()),
        CoroutineResult::Return(()) => log::trace!("task {} returned", task.id()),
    }
    Ok(())
}

/// Suspend the current task, returning control to its worker thread
///
/// The task stays wherever its linkage currently is: a task that parked
/// itself on a waiter queue sleeps until signaled, and a task that is
/// linked nowhere sleeps until an external agent re-enqueues it.
///
/// # Errors
/// Returns [`Error::NotInTask`] from thread context.
pub fn suspend() -> Result<()> {
    let task = current().ok_or(Error::NotInTask)?;
    let yielder = task.yielder.load(Ordering::Acquire);
    assert!(!yielder.is_null(), "running task has no saved thread context");
    drop(task);

    // Safety: the yielder points at a fixed slot on this task's own stack,
    // valid for the coroutine's lifetime, and `current()` is only set while
    // that coroutine is running on this thread.
    unsafe { (*yielder).suspend(()) };
    Ok(())
}

/// Re-enqueue a task onto its owning pool's runnable queue
///
/// A task without a pool is left untouched; making it runnable again is the
/// job of whatever agent parked it.
///
/// # Errors
/// * [`Error::Completed`] if the task has finished
/// * [`Error::WrongPool`] / [`Error::Parked`] from the pool re-enqueue
pub fn schedule(task: &Arc<Task>) -> Result<()> {
    if task.is_complete() {
        return Err(Error::Completed);
    }
    match task.pool() {
        Some(pool) => pool.push_back(task),
        None => Ok(()),
    }
}

/// Yield the processor
///
/// From task context, re-enqueues the current task at the back of its
/// pool's runnable queue (guaranteeing it will be picked up again) and
/// suspends. A task with no pool suspends without re-enqueueing. From
/// thread context this degrades to an OS thread yield and reports success.
pub fn yield_now() -> Result<()> {
    let Some(task) = current() else {
        thread::yield_now();
        return Ok(());
    };

    if task.is_complete() {
        return Err(Error::Completed);
    }
    if task.pool().is_some() {
        schedule(&task)?;
    }
    drop(task);
    suspend()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: usize = 64 * 1024;

    /// Tasks get distinct, monotonically increasing ids
    #[test]
    fn test_task_ids_unique() {
        let a = Task::new(None, STACK, || 0).unwrap();
        let b = Task::new(None, STACK, || 0).unwrap();
        assert!(b.id() > a.id());
    }

    /// A fresh task is incomplete, poolless, and has no result
    #[test]
    fn test_new_task_state() {
        let task = Task::new(Some("fresh"), STACK, || 7).unwrap();
        assert_eq!(task.name(), Some("fresh"));
        assert!(!task.is_complete());
        assert!(task.result().is_none());
        assert!(task.pool().is_none());
    }

    /// Executing a task runs its entry to completion and retains the result
    #[test]
    fn test_execute_runs_entry() {
        let task = Task::new(Some("answer"), STACK, || 41 + 1).unwrap();
        execute(&task).unwrap();
        assert!(task.is_complete());
        assert_eq!(task.result(), Some(42));
    }

    /// A completed task cannot be executed again
    #[test]
    fn test_execute_complete_is_invalid() {
        let task = Task::new(None, STACK, || 0).unwrap();
        execute(&task).unwrap();
        assert!(matches!(execute(&task), Err(Error::Completed)));
    }

    /// suspend() outside a task is a contract violation
    #[test]
    fn test_suspend_from_thread_is_invalid() {
        assert!(matches!(suspend(), Err(Error::NotInTask)));
    }

    /// yield_now() outside a task degrades to a thread yield and succeeds
    #[test]
    fn test_yield_from_thread_succeeds() {
        assert!(yield_now().is_ok());
    }

    /// A poolless task that suspends parks until executed again
    #[test]
    fn test_suspend_and_resume_without_pool() {
        let task = Task::new(None, STACK, || {
            suspend().unwrap();
            5
        })
        .unwrap();

        execute(&task).unwrap();
        assert!(!task.is_complete());

        execute(&task).unwrap();
        assert_eq!(task.result(), Some(5));
    }

    /// The current-task thread-local is visible from inside the entry
    #[test]
    fn test_current_inside_task() {
        let task = Task::new(Some("inner"), STACK, || {
            let me = current().expect("current task should be set");
            assert_eq!(me.name(), Some("inner"));
            0
        })
        .unwrap();

        assert!(current().is_none());
        execute(&task).unwrap();
        assert!(current().is_none());
        assert!(task.is_complete());
    }

    /// execute() from inside a task is rejected
    #[test]
    fn test_nested_execute_is_invalid() {
        let inner = Task::new(None, STACK, || 0).unwrap();
        let inner_clone = inner.clone();
        let task = Task::new(None, STACK, move || {
            match execute(&inner_clone) {
                Err(Error::NestedExecute) => 1,
                _ => 0,
            }
        })
        .unwrap();

        execute(&task).unwrap();
        assert_eq!(task.result(), Some(1));
        assert!(!inner.is_complete());
        execute(&inner).unwrap();
    }

    /// Dropping a suspended task unwinds its stack
    #[test]
    fn test_drop_suspended_task() {
        let task = Task::new(None, STACK, || {
            suspend().unwrap();
            0
        })
        .unwrap();

        execute(&task).unwrap();
        assert!(!task.is_complete());
        drop(task);
    }
}
