//! Hybrid condition variable
//!
//! One condition serves two waiter populations under a single caller-owned
//! predicate lock: tasks park by moving onto the condition's waiter queue
//! and suspending, while plain threads block on an internal OS condition.
//! Waking a task does not run it — it is re-enqueued onto the runnable
//! queue of whichever pool owns it, and that pool's workers take it from
//! there.
//!
//! Every operation must be called with the predicate lock held; the guard
//! parameter makes that precondition structural. [`Condition::wait`]
//! releases the predicate lock around the park and re-acquires it before
//! returning, for both waiter flavors.

use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use portable_atomic::{AtomicPtr, Ordering};

use crate::pool;
use crate::task::{self, Linkage, Task};

/// A condition variable for mixed task and thread waiters
///
/// The condition binds to the first predicate mutex it is used with and
/// panics if a later call passes a guard of a different mutex.
pub struct Condition {
    /// Task waiters, FIFO. Pushed and popped only with the predicate lock
    /// held, so ordering between waiters and signalers is settled by the
    /// predicate lock; this inner lock only guards the queue structure.
    waiters: Mutex<VecDeque<Arc<Task>>>,
    /// Pairing for thread waiters
    thread_lock: Mutex<()>,
    thread_cond: Condvar,
    /// The predicate mutex this condition is bound to
    bound: AtomicPtr<()>,
}

impl Condition {
    /// Create a new condition variable
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            thread_lock: Mutex::new(()),
            thread_cond: Condvar::new(),
            bound: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Number of task waiters currently parked
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    fn bind<T>(&self, guard: &MutexGuard<'_, T>) {
        let mutex = MutexGuard::mutex(guard) as *const Mutex<T> as *mut ();
        if let Err(prev) = self.bound.compare_exchange(
            ptr::null_mut(),
            mutex,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            assert!(
                prev == mutex,
                "condition used with two different predicate locks"
            );
        }
    }

    /// Wait for a signal, releasing the predicate lock while parked
    ///
    /// From task context the current task parks on the condition's waiter
    /// queue and suspends; its worker thread moves on to other tasks. From
    /// thread context the calling thread blocks on the internal OS
    /// condition. Either way the predicate lock is re-acquired before this
    /// returns, so the caller re-checks its predicate in the usual loop.
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.bind(guard);

        if let Some(task) = task::current() {
            {
                let mut sched = task.sched.lock();
                assert_eq!(
                    sched.link,
                    Linkage::Unlinked,
                    "waiting task is already linked into a queue"
                );
                sched.link = Linkage::ConditionQueue;
            }
            self.waiters.lock().push_back(task);

            MutexGuard::unlocked(guard, || {
                task::suspend().expect("task context vanished during wait");
            });
        } else {
            // The internal lock is taken before the predicate lock is
            // released, so a signaler that observed no task waiters cannot
            // notify before this thread is blocked.
            let slot = self.thread_lock.lock();
            MutexGuard::unlocked(guard, move || {
                let mut slot = slot;
                self.thread_cond.wait(&mut slot);
            });
        }
    }

    /// Pop and re-enqueue the first task waiter, if any.
    fn wakeup_first(queue: &mut VecDeque<Arc<Task>>) -> bool {
        match queue.pop_front() {
            Some(task) => {
                pool::requeue(task);
                true
            }
            None => false,
        }
    }

    /// Wake one waiter
    ///
    /// Task waiters are strictly preferred: the FIFO-first parked task is
    /// re-enqueued onto its pool's runnable queue, and only when no task is
    /// parked is one thread waiter notified.
    pub fn signal<T>(&self, guard: &MutexGuard<'_, T>) {
        self.bind(guard);

        if !Self::wakeup_first(&mut self.waiters.lock()) {
            let _slot = self.thread_lock.lock();
            self.thread_cond.notify_one();
        }
    }

    /// Wake every waiter
    ///
    /// The task-waiter queue is spliced out in one move, then drained;
    /// each re-enqueue takes a foreign pool's lock, and draining a detached
    /// queue keeps the live one stable meanwhile. All thread waiters are
    /// then notified.
    pub fn broadcast<T>(&self, guard: &MutexGuard<'_, T>) {
        self.bind(guard);

        let mut drained = mem::take(&mut *self.waiters.lock());
        while Self::wakeup_first(&mut drained) {}

        let _slot = self.thread_lock.lock();
        self.thread_cond.notify_all();
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        debug_assert!(
            self.waiters.get_mut().is_empty(),
            "condition dropped with parked tasks"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pool::TaskPool;
    use crate::task::execute;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::thread;
    use std::time::Duration;

    const STACK: usize = 64 * 1024;

    /// Thread waiters follow classical condvar semantics
    #[test]
    fn test_thread_wait_signal() {
        let pred = Arc::new(Mutex::new(false));
        let cond = Arc::new(Condition::new());
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let pred = Arc::clone(&pred);
            let cond = Arc::clone(&cond);
            let woke = Arc::clone(&woke);
            thread::spawn(move || {
                let mut ready = pred.lock();
                while !*ready {
                    cond.wait(&mut ready);
                }
                woke.store(true, AtomicOrdering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(AtomicOrdering::SeqCst));

        {
            let mut ready = pred.lock();
            *ready = true;
            cond.signal(&ready);
        }

        waiter.join().expect("waiter should not panic");
        assert!(woke.load(AtomicOrdering::SeqCst));
    }

    /// A task waiter parks on the condition, not in its pool's queue
    #[test]
    fn test_task_wait_parks() {
        let pool = TaskPool::new(None);
        let pred = Arc::new(Mutex::new(false));
        let cond = Arc::new(Condition::new());

        let task = {
            let pred = Arc::clone(&pred);
            let cond = Arc::clone(&cond);
            Task::new(Some("waiter"), STACK, move || {
                let mut ready = pred.lock();
                while !*ready {
                    cond.wait(&mut ready);
                }
                7
            })
            .unwrap()
        };

        pool.insert(&task).unwrap();
        let popped = pool.pop_front().unwrap();
        execute(&popped).unwrap();

        // Parked on the condition: off the runnable queue, still a member.
        assert!(!task.is_complete());
        assert_eq!(cond.waiters(), 1);
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.ntasks(), 1);

        // A parked task cannot be erased or re-queued behind the
        // condition's back.
        assert!(matches!(pool.erase(&task), Err(Error::Parked)));
        assert!(matches!(pool.push_back(&task), Err(Error::Parked)));

        {
            let mut ready = pred.lock();
            *ready = true;
            cond.signal(&ready);
        }

        // The signal re-enqueued the task; it did not run it.
        assert!(!task.is_complete());
        assert_eq!(cond.waiters(), 0);
        assert_eq!(pool.queued(), 1);

        let resumed = pool.pop_front().unwrap();
        execute(&resumed).unwrap();
        assert_eq!(task.result(), Some(7));
    }

    /// A condition bound to one predicate lock rejects another
    #[test]
    #[should_panic(expected = "different predicate locks")]
    fn test_rebinding_panics() {
        let a = Mutex::new(());
        let b = Mutex::new(());
        let cond = Condition::new();

        let guard = a.lock();
        cond.signal(&guard);
        drop(guard);

        let guard = b.lock();
        cond.signal(&guard);
    }
}
