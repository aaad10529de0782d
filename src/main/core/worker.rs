//! The per-thread worker context.
//!
//! A worker is a single thread of the simulator's event loop. It tracks which
//! host and process are currently executing, the virtual clock, and a few
//! bookkeeping counters. The active-process slot is how the syscall
//! interception layer finds its way back to the owning [`Process`] when a
//! guest traps into the simulator.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use once_cell::unsync::OnceCell;
use umbra_time::emulated_time::EmulatedTime;
use umbra_time::simulation_time::SimulationTime;

use crate::core::work::event::Event;
use crate::core::work::task::TaskRef;
use crate::host::host::Host;
use crate::host::process::Process;
use crate::utility::counter::Counter;

std::thread_local! {
    static WORKER: OnceCell<Worker> = OnceCell::new();
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkerThreadId(pub u32);

pub struct Worker {
    worker_id: WorkerThreadId,

    // which host and process are currently executing on this thread
    active_host: RefCell<Option<Arc<Host>>>,
    active_process: RefCell<Option<Arc<Process>>>,

    // the virtual clock; valid while an event is executing or between events
    // once the loop has started
    clock_now: Cell<Option<EmulatedTime>>,

    // paired allocation/deallocation counts per object type
    object_alloc_counts: RefCell<Counter>,
    object_dealloc_counts: RefCell<Counter>,

    // guests that exited with a nonzero code
    plugin_error_count: Cell<u64>,
}

impl Worker {
    /// Set up the worker for this thread. Idempotent; the id of the first
    /// call wins.
    pub fn new_for_this_thread(worker_id: WorkerThreadId) {
        WORKER.with(|worker| {
            worker.get_or_init(|| Worker {
                worker_id,
                active_host: RefCell::new(None),
                active_process: RefCell::new(None),
                clock_now: Cell::new(None),
                object_alloc_counts: RefCell::new(Counter::new()),
                object_dealloc_counts: RefCell::new(Counter::new()),
                plugin_error_count: Cell::new(0),
            });
        });
    }

    fn with<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Worker) -> R,
    {
        WORKER.with(|worker| worker.get().map(f))
    }

    pub fn is_alive() -> bool {
        Self::with(|_| ()).is_some()
    }

    pub fn worker_id() -> Option<WorkerThreadId> {
        Self::with(|worker| worker.worker_id)
    }

    /// Mark `host` as the host executing on this thread. Panics if another
    /// host is already active.
    pub fn set_active_host(host: &Arc<Host>) {
        Self::with(|worker| {
            let old = worker.active_host.borrow_mut().replace(Arc::clone(host));
            assert!(old.is_none());
        })
        .unwrap();
    }

    pub fn clear_active_host() {
        Self::with(|worker| {
            let old = worker.active_host.borrow_mut().take();
            assert!(old.is_some());
        })
        .unwrap();
    }

    /// Run `f` against the active host. Returns `None` if no host is active.
    pub fn with_active_host<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Arc<Host>) -> R,
    {
        // clone the Arc out of the slot so `f` can re-enter the worker
        let host = Self::with(|worker| worker.active_host.borrow().clone())??;
        Some(f(&host))
    }

    /// Bind `process` as the active process for as long as the returned token
    /// lives. The slot is cleared when the token drops, on every exit path.
    pub fn set_active_process(process: &Arc<Process>) -> ActiveProcessToken {
        ActiveProcessToken::new(process)
    }

    /// Run `f` against the process currently executing guest code, if any.
    pub fn with_active_process<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Arc<Process>) -> R,
    {
        let process = Self::with(|worker| worker.active_process.borrow().clone())??;
        Some(f(&process))
    }

    pub fn current_time() -> Option<EmulatedTime> {
        Self::with(|worker| worker.clock_now.get()).flatten()
    }

    pub fn set_current_time(now: EmulatedTime) {
        Self::with(|worker| worker.clock_now.set(Some(now))).unwrap();
    }

    /// Post `task` to run on `host` after `delay` of virtual time.
    pub fn schedule_task_with_delay(task: TaskRef, host: &Host, delay: SimulationTime) {
        let deadline = Self::current_time().unwrap() + delay;
        host.push_event(Event::new(task, deadline, host));
    }

    pub fn increment_plugin_error_count() {
        Self::with(|worker| {
            worker
                .plugin_error_count
                .set(worker.plugin_error_count.get() + 1);
        })
        .unwrap();
    }

    pub fn plugin_error_count() -> Option<u64> {
        Self::with(|worker| worker.plugin_error_count.get())
    }

    // No-ops before the worker exists so that objects created during thread
    // setup or teardown don't panic.
    pub fn increment_object_alloc_counter(name: &str) {
        Self::with(|worker| {
            worker.object_alloc_counts.borrow_mut().add_one(name);
        });
    }

    pub fn increment_object_dealloc_counter(name: &str) {
        Self::with(|worker| {
            worker.object_dealloc_counts.borrow_mut().add_one(name);
        });
    }

    pub fn object_alloc_count(name: &str) -> Option<u64> {
        Self::with(|worker| worker.object_alloc_counts.borrow().get_value(name))
    }

    pub fn object_dealloc_count(name: &str) -> Option<u64> {
        Self::with(|worker| worker.object_dealloc_counts.borrow().get_value(name))
    }
}

/// Clears the worker's active-process slot when dropped.
pub struct ActiveProcessToken(());

impl ActiveProcessToken {
    fn new(process: &Arc<Process>) -> Self {
        Worker::with(|worker| {
            let old = worker
                .active_process
                .borrow_mut()
                .replace(Arc::clone(process));
            assert!(old.is_none());
        })
        .unwrap();
        Self(())
    }
}

impl Drop for ActiveProcessToken {
    fn drop(&mut self) {
        Worker::with(|worker| {
            let old = worker.active_process.borrow_mut().take();
            debug_assert!(old.is_some());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock() {
        Worker::new_for_this_thread(WorkerThreadId(7));
        assert_eq!(Worker::worker_id(), Some(WorkerThreadId(7)));
        assert_eq!(Worker::current_time(), None);

        let now = EmulatedTime::SIMULATION_START + SimulationTime::from_secs(3);
        Worker::set_current_time(now);
        assert_eq!(Worker::current_time(), Some(now));
    }

    #[test]
    fn test_object_counters() {
        Worker::new_for_this_thread(WorkerThreadId(0));
        Worker::increment_object_alloc_counter("TestObject");
        Worker::increment_object_alloc_counter("TestObject");
        Worker::increment_object_dealloc_counter("TestObject");
        assert_eq!(Worker::object_alloc_count("TestObject"), Some(2));
        assert_eq!(Worker::object_dealloc_count("TestObject"), Some(1));
    }

    #[test]
    fn test_plugin_error_count() {
        Worker::new_for_this_thread(WorkerThreadId(0));
        assert_eq!(Worker::plugin_error_count(), Some(0));
        Worker::increment_plugin_error_count();
        assert_eq!(Worker::plugin_error_count(), Some(1));
    }
}
