//! Task pools: shareable run queues that own task membership
//!
//! A pool is both the membership registry for a set of tasks and the FIFO
//! run queue worker threads pull from. Membership (`ntasks`) and queue
//! presence are distinct: a popped task is a member that is merely
//! off-queue while some worker runs it, so `ntasks` is always at least the
//! queue length.
//!
//! Every enqueue — insertion, re-scheduling after a yield, or re-injection
//! by a condition signal or semaphore release — notifies the pool's
//! condition so an idle worker wakes up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use portable_atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::task::{self, Linkage, Task};

/// Queue and membership state, guarded by the pool's lock.
struct PoolState {
    /// Runnable tasks, FIFO
    queue: VecDeque<Arc<Task>>,
    /// Number of member tasks, on-queue or running
    ntasks: usize,
    /// Set once workers should stop after draining the queue
    shutdown: bool,
}

/// A thread-safe FIFO of runnable tasks
///
/// Shared through `Arc` handles. Each member task holds one reference on
/// its pool, so a pool outlives its members' membership.
pub struct TaskPool {
    id: u64,
    name: Option<String>,
    state: Mutex<PoolState>,
    /// Wakes idle worker threads when the queue becomes non-empty
    available: Condvar,
    me: Weak<TaskPool>,
}

impl TaskPool {
    /// Create a new, empty pool
    pub fn new(name: Option<&str>) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Arc::new_cyclic(|me| TaskPool {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.map(String::from),
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                ntasks: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            me: me.clone(),
        })
    }

    /// Get the pool's unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the pool's name, if one was given
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Number of member tasks, including ones currently running off-queue
    pub fn ntasks(&self) -> usize {
        self.state.lock().ntasks
    }

    /// Number of tasks currently linked into the runnable queue
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn shared(&self) -> Arc<TaskPool> {
        self.me.upgrade().expect("pool accessed after its last handle dropped")
    }

    /// Make a task a member of this pool and enqueue it as runnable
    ///
    /// # Errors
    /// Returns [`Error::AlreadyMember`] if the task already belongs to a
    /// pool (it must be erased or switched out first).
    pub fn insert(&self, task: &Arc<Task>) -> Result<()> {
        let mut sched = task.sched.lock();
        if sched.pool.is_some() {
            return Err(Error::AlreadyMember);
        }
        debug_assert_eq!(sched.link, Linkage::Unlinked);

        sched.pool = Some(self.shared());
        sched.link = Linkage::RunQueue;

        let mut st = self.state.lock();
        st.ntasks += 1;
        st.queue.push_back(task.clone());
        drop(st);
        drop(sched);

        self.available.notify_one();
        log::debug!("task {} inserted into pool {}", task.id(), self.id);
        Ok(())
    }

    /// Remove a task's membership from this pool
    ///
    /// Unlinks the task from the runnable queue if it is enqueued. A task
    /// parked on a condition or semaphore cannot be erased; it must be
    /// woken first.
    ///
    /// # Errors
    /// * [`Error::WrongPool`] if the task is not a member of this pool
    /// * [`Error::Parked`] if the task is on a waiter queue
    pub fn erase(&self, task: &Task) -> Result<()> {
        let mut sched = task.sched.lock();
        match &sched.pool {
            Some(p) if p.id == self.id => {}
            _ => return Err(Error::WrongPool),
        }
        if matches!(sched.link, Linkage::ConditionQueue | Linkage::SemaphoreQueue) {
            return Err(Error::Parked);
        }

        let was_queued = sched.link == Linkage::RunQueue;
        sched.pool = None;
        sched.link = Linkage::Unlinked;

        let mut st = self.state.lock();
        assert!(st.ntasks > 0, "pool {} task accounting underflow", self.id);
        st.ntasks -= 1;
        if was_queued {
            st.queue.retain(|t| t.id() != task.id());
        }
        drop(st);
        drop(sched);

        log::debug!("task {} erased from pool {}", task.id(), self.id);
        Ok(())
    }

    /// Move an already-member task to the back of the runnable queue
    ///
    /// Used by yielding tasks to guarantee they are picked up again. A task
    /// already on the queue is moved to the back; a task parked on a
    /// condition or semaphore is refused (waking it is the signaler's job).
    ///
    /// # Errors
    /// * [`Error::WrongPool`] if the task is not a member of this pool
    /// * [`Error::Parked`] if the task is on a waiter queue
    pub fn push_back(&self, task: &Arc<Task>) -> Result<()> {
        let mut sched = task.sched.lock();
        match &sched.pool {
            Some(p) if p.id == self.id => {}
            _ => return Err(Error::WrongPool),
        }

        match sched.link {
            Linkage::ConditionQueue | Linkage::SemaphoreQueue => return Err(Error::Parked),
            Linkage::RunQueue => {
                let mut st = self.state.lock();
                st.queue.retain(|t| t.id() != task.id());
                st.queue.push_back(task.clone());
            }
            Linkage::Unlinked => {
                sched.link = Linkage::RunQueue;
                self.state.lock().queue.push_back(task.clone());
            }
        }
        drop(sched);

        self.available.notify_one();
        Ok(())
    }

    /// Pop the head of the runnable queue
    ///
    /// Membership is unchanged: the caller is expected to run the task, so
    /// it stays a member while off-queue and `ntasks` is not decremented.
    ///
    /// # Errors
    /// Returns [`Error::Empty`] if no task is enqueued.
    pub fn pop_front(&self) -> Result<Arc<Task>> {
        let task = self.state.lock().queue.pop_front().ok_or(Error::Empty)?;
        // Cleared outside the state lock; a push_back racing this window
        // re-enqueues a task that is about to run, which the executor mutex
        // serializes.
        task.sched.lock().link = Linkage::Unlinked;
        Ok(task)
    }

    /// Move the calling task into this pool, returning its previous pool
    ///
    /// The task leaves its current pool (if any), joins this one at the
    /// back of the runnable queue, and yields; when it resumes it is
    /// running on behalf of this pool's workers.
    ///
    /// # Errors
    /// * [`Error::NotInTask`] from thread context
    /// * [`Error::AlreadyMember`] if the task is already in this pool
    pub fn switch(&self) -> Result<Option<Arc<TaskPool>>> {
        let task = task::current().ok_or(Error::NotInTask)?;

        let prev = task.pool();
        if let Some(p) = &prev {
            if p.id == self.id {
                return Err(Error::AlreadyMember);
            }
            p.erase(&task)?;
        }
        self.insert(&task)?;
        log::debug!("task {} switching to pool {}", task.id(), self.id);
        drop(task);

        task::yield_now()?;
        Ok(prev)
    }

    /// Block the calling thread until a task is runnable, then pop it
    ///
    /// Returns `None` once the pool is shut down and the queue has been
    /// drained. This is the worker-thread entry point; it must not be
    /// called from task context (it can park the OS thread indefinitely).
    pub fn next_runnable(&self) -> Option<Arc<Task>> {
        let mut st = self.state.lock();
        loop {
            if let Some(task) = st.queue.pop_front() {
                drop(st);
                task.sched.lock().link = Linkage::Unlinked;
                return Some(task);
            }
            if st.shutdown {
                return None;
            }
            self.available.wait(&mut st);
        }
    }

    /// Tell workers to exit once the runnable queue is drained
    pub fn shutdown_workers(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
        log::debug!("pool {} shutting down workers", self.id);
    }

    /// Re-enqueue a woken member task. Membership is already established,
    /// so `ntasks` is untouched.
    pub(crate) fn enqueue_runnable(&self, task: Arc<Task>) {
        self.state.lock().queue.push_back(task);
        self.available.notify_one();
    }

    /// Repair accounting for a member task that was dropped while parked.
    pub(crate) fn forget_member(&self) {
        let mut st = self.state.lock();
        assert!(st.ntasks > 0, "pool {} task accounting underflow", self.id);
        st.ntasks -= 1;
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("TaskPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ntasks", &st.ntasks)
            .field("queued", &st.queue.len())
            .finish()
    }
}

/// Move a task popped off a waiter queue back onto its pool's runnable
/// queue. The caller must have unlinked the task from the waiter queue
/// already; a parked task always has an owning pool.
pub(crate) fn requeue(task: Arc<Task>) {
    let pool = {
        let mut sched = task.sched.lock();
        debug_assert!(matches!(
            sched.link,
            Linkage::ConditionQueue | Linkage::SemaphoreQueue
        ));
        sched.link = Linkage::RunQueue;
        sched
            .pool
            .clone()
            .expect("woken task has no owning pool")
    };
    log::trace!("task {} re-injected into pool {}", task.id(), pool.id());
    pool.enqueue_runnable(task);
}
