//! Worker threads
//!
//! A worker repeatedly pops a runnable task from its pool and executes it
//! until the task suspends or completes, parking on the pool's condition
//! while the queue is empty. Workers never call task-context-only
//! primitives; everything they need is the pop/execute pair.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::pool::TaskPool;
use crate::task;

/// A set of worker threads draining one pool
///
/// Workers run until [`Workers::shutdown`] is called; dropping the handle
/// without shutting down leaves the threads running detached.
pub struct Workers {
    pool: Arc<TaskPool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawn `count` worker threads serving `pool`
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if a thread cannot be created; workers
    /// spawned before the failure are shut down and joined first.
    pub fn spawn(pool: &Arc<TaskPool>, count: usize) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let worker_pool = Arc::clone(pool);
            let spawned = thread::Builder::new()
                .name(format!("taskpool-worker-{i}"))
                .spawn(move || worker_loop(&worker_pool));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    pool.shutdown_workers();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::Spawn(err));
                }
            }
        }

        log::debug!("spawned {} workers for pool {}", count, pool.id());
        Ok(Workers {
            pool: Arc::clone(pool),
            handles,
        })
    }

    /// The pool these workers serve
    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Drain the pool's runnable queue, stop every worker, and join it
    pub fn shutdown(mut self) {
        self.pool.shutdown_workers();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::warn!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(pool: &Arc<TaskPool>) {
    log::debug!("worker starting on pool {}", pool.id());
    while let Some(task) = pool.next_runnable() {
        if let Err(err) = task::execute(&task) {
            log::warn!("executing task {} failed: {err}", task.id());
        }
    }
    log::debug!("worker on pool {} exiting", pool.id());
}
