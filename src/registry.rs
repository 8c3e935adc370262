//! Process-wide registry of live tasks
//!
//! Maintained automatically by task creation and destruction; read only
//! for diagnostics. Entries are weak, so the registry never extends a
//! task's lifetime.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::task::Task;

static REGISTRY: Mutex<BTreeMap<u64, Weak<Task>>> = Mutex::new(BTreeMap::new());

pub(crate) fn register(task: &Arc<Task>) {
    REGISTRY.lock().insert(task.id(), Arc::downgrade(task));
}

pub(crate) fn unregister(id: u64) {
    REGISTRY.lock().remove(&id);
}

/// Snapshot of every live task, in creation order
pub fn live_tasks() -> Vec<Arc<Task>> {
    REGISTRY.lock().values().filter_map(Weak::upgrade).collect()
}

/// Log one `debug!` line per live task
pub fn dump() {
    for task in live_tasks() {
        log::debug!(
            "task {} ({}): complete={} pool={:?}",
            task.id(),
            task.name().unwrap_or("unnamed"),
            task.is_complete(),
            task.pool().map(|p| p.id()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const STACK: usize = 64 * 1024;

    /// Live tasks appear in the registry and vanish when dropped
    #[test]
    #[serial]
    fn test_registry_tracks_lifetime() {
        let task = Task::new(Some("tracked"), STACK, || 0).unwrap();
        let id = task.id();

        assert!(live_tasks().iter().any(|t| t.id() == id));

        drop(task);
        assert!(!live_tasks().iter().any(|t| t.id() == id));
    }

    /// dump() tolerates a mix of named and unnamed tasks
    #[test]
    #[serial]
    fn test_dump_runs() {
        let _named = Task::new(Some("named"), STACK, || 0).unwrap();
        let _unnamed = Task::new(None, STACK, || 0).unwrap();
        dump();
    }
}
