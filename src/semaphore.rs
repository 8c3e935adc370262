//! Counting semaphore for task context
//!
//! Unlike the condition variable, the semaphore parks tasks only: `down`
//! from thread context is an error. A release with parked waiters hands
//! the permit directly to the FIFO-first waiter — the count is untouched
//! and the waiter is re-enqueued onto its owning pool's runnable queue.
//! Pool membership accounting is never adjusted by semaphore traffic.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pool;
use crate::task::{self, Linkage, Task};

struct SemState {
    /// Available permits; zero whenever waiters are parked
    count: u32,
    /// Parked task waiters, FIFO
    waiters: VecDeque<Arc<Task>>,
}

/// A counting semaphore whose waiters are tasks
pub struct Semaphore {
    name: Option<String>,
    state: Mutex<SemState>,
}

impl Semaphore {
    /// Create a new semaphore with the given initial permit count
    ///
    /// # Arguments
    /// * `count` - Initial permit count
    /// * `name` - Optional name for debugging
    pub fn new(count: u32, name: Option<&str>) -> Self {
        Self {
            name: name.map(String::from),
            state: Mutex::new(SemState {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire a permit, parking the current task if none is available
    ///
    /// # Errors
    /// Returns [`Error::NotInTask`] from thread context.
    pub fn down(&self) -> Result<()> {
        let task = task::current().ok_or(Error::NotInTask)?;

        let mut st = self.state.lock();
        if st.count > 0 {
            st.count -= 1;
            return Ok(());
        }

        {
            let mut sched = task.sched.lock();
            assert_eq!(
                sched.link,
                Linkage::Unlinked,
                "waiting task is already linked into a queue"
            );
            sched.link = Linkage::SemaphoreQueue;
        }
        st.waiters.push_back(task);
        drop(st);

        log::trace!("semaphore {:?}: task parked", self.name);
        task::suspend()
    }

    /// Try to acquire a permit without parking
    ///
    /// Usable from any context. Returns `true` if a permit was taken.
    pub fn try_down(&self) -> bool {
        let mut st = self.state.lock();
        if st.count > 0 {
            st.count -= 1;
            true
        } else {
            false
        }
    }

    /// Release a permit
    ///
    /// If a task is parked, the permit is handed to the FIFO-first waiter:
    /// it is re-enqueued onto its owning pool's runnable queue and the
    /// count stays at zero. Otherwise the count is incremented. Usable from
    /// any context.
    pub fn up(&self) {
        let woken = {
            let mut st = self.state.lock();
            match st.waiters.pop_front() {
                Some(task) => Some(task),
                None => {
                    st.count += 1;
                    None
                }
            }
        };

        if let Some(task) = woken {
            log::trace!("semaphore {:?}: handing permit to task {}", self.name, task.id());
            pool::requeue(task);
        }
    }

    /// Get the current permit count
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Number of parked task waiters
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("count", &st.count)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        debug_assert!(
            self.state.get_mut().waiters.is_empty(),
            "semaphore dropped with parked tasks"
        );
    }
}
