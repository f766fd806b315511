use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crate::registry::registry;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TASK_ID: Cell<u64> = Cell::new(0);
}

/// Returns the task id of the calling thread.
///
/// Ids are assigned lazily on first use, are nonzero, never repeat within a
/// process, and stay stable for the lifetime of the thread.
pub fn current_task_id() -> u64 {
    TASK_ID.with(|cell| {
        let mut id = cell.get();
        if id == 0 {
            id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
            cell.set(id);
        }
        id
    })
}

/// Spawns a thread and records the parent edge in the global registry.
///
/// The edge is recorded inside the child before `f` runs, mirroring a runtime
/// task-start hook, so any ancestry query issued from `f` (or anything it
/// calls) already sees the link.
pub fn spawn<F, T>(f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let parent = current_task_id();
    thread::spawn(move || {
        registry().record_spawn(current_task_id(), parent);
        f()
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn task_ids_are_stable_and_nonzero() {
        let first = current_task_id();
        let second = current_task_id();
        assert_ne!(first, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn task_ids_differ_across_threads() {
        let here = current_task_id();
        let there = thread::spawn(current_task_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn spawn_records_lineage_to_depth() {
        let root = current_task_id();
        let leaf_chain = spawn(move || {
            spawn(move || {
                spawn(move || registry().ancestors(current_task_id(), 100))
                    .join()
                    .unwrap()
            })
            .join()
            .unwrap()
        })
        .join()
        .unwrap();

        assert_eq!(leaf_chain.len(), 4);
        assert_eq!(leaf_chain[3], root, "walk reaches the spawning task");
    }
}
