use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use atomic_refcell::{AtomicRefCell, AtomicRefMut};
use log::debug;
use once_cell::sync::OnceCell;
use umbra_time::emulated_time::EmulatedTime;
use umbra_time::simulation_time::SimulationTime;

use crate::core::work::event::Event;
use crate::core::work::event_queue::EventQueue;
use crate::core::worker::Worker;
use crate::host::cpu::Cpu;
use crate::host::process::ProcessId;
use crate::host::tracker::Tracker;
use crate::utility::{IsSend, IsSync};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(pub u32);

/// Immutable information about the Host, cheap to clone into log lines.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub id: HostId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct HostParameters {
    pub id: HostId,
    pub hostname: String,
    /// Where this host writes per-process stdout/stderr files.
    pub data_dir_path: PathBuf,
    /// The simulated CPU frequency in Hz.
    pub cpu_frequency: u64,
    /// The native CPU frequency in Hz, used to normalize measured bursts.
    pub raw_cpu_frequency: u64,
    pub cpu_threshold: Option<SimulationTime>,
    pub cpu_precision: Option<SimulationTime>,
}

/// A simulated host. Executes its processes serially in virtual time; within
/// one worker thread at most one host is ever active.
///
/// The host does not hold strong references to its processes. A live process
/// is kept alive by the scheduled tasks and installed listeners that
/// reference it, so no ownership cycle forms between the two.
pub struct Host {
    // so the event loop can hand the worker an owned reference to this host
    weak_self: Weak<Host>,

    info: OnceCell<Arc<HostInfo>>,
    params: HostParameters,

    event_queue: Mutex<EventQueue>,

    cpu: AtomicRefCell<Cpu>,
    tracker: AtomicRefCell<Tracker>,

    // virtual process and event id counters
    process_id_counter: AtomicU32,
    event_id_counter: AtomicU64,
}

impl IsSend for Host {}
impl IsSync for Host {}

impl Host {
    pub fn new(params: HostParameters) -> Arc<Self> {
        std::fs::create_dir_all(&params.data_dir_path).unwrap_or_else(|e| {
            panic!(
                "creating host data directory {}: {e}",
                params.data_dir_path.display()
            )
        });

        let cpu = Cpu::new(
            params.cpu_frequency,
            params.raw_cpu_frequency,
            params.cpu_threshold,
            params.cpu_precision,
        );

        debug!(
            "setup host '{}' with data directory {}",
            params.hostname,
            params.data_dir_path.display()
        );

        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            info: OnceCell::new(),
            event_queue: Mutex::new(EventQueue::new()),
            cpu: AtomicRefCell::new(cpu),
            tracker: AtomicRefCell::new(Tracker::new()),
            // process ids start at 1000
            process_id_counter: AtomicU32::new(1000),
            event_id_counter: AtomicU64::new(0),
            params,
        })
    }

    fn arc(&self) -> Arc<Host> {
        // can't fail while a method is executing on self
        self.weak_self.upgrade().unwrap()
    }

    /// Information about the Host. Made available as an Arc for cheap cloning
    /// into contexts that outlive a borrow of the host.
    pub fn info(&self) -> &Arc<HostInfo> {
        self.info.get_or_init(|| {
            Arc::new(HostInfo {
                id: self.params.id,
                name: self.params.hostname.clone(),
            })
        })
    }

    pub fn id(&self) -> HostId {
        self.params.id
    }

    pub fn name(&self) -> &str {
        &self.params.hostname
    }

    pub fn data_dir_path(&self) -> &Path {
        &self.params.data_dir_path
    }

    pub fn cpu_borrow_mut(&self) -> AtomicRefMut<Cpu> {
        self.cpu.borrow_mut()
    }

    pub fn tracker_borrow_mut(&self) -> AtomicRefMut<Tracker> {
        self.tracker.borrow_mut()
    }

    pub fn tracker_processing_time(&self) -> SimulationTime {
        self.tracker.borrow().processing_time()
    }

    pub fn get_new_event_id(&self) -> u64 {
        self.event_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get_new_process_id(&self) -> ProcessId {
        ProcessId(self.process_id_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn push_event(&self, event: Event) {
        self.event_queue.lock().unwrap().push(event);
    }

    pub fn next_event_time(&self) -> Option<EmulatedTime> {
        self.event_queue.lock().unwrap().next_event_time()
    }

    pub fn num_queued_events(&self) -> usize {
        self.event_queue.lock().unwrap().len()
    }

    /// Pop and execute the earliest event, advancing the worker clock to the
    /// event's time. Returns false when the queue is empty.
    ///
    /// This is the single-host slice of the (external) multi-host scheduler
    /// loop: the host is marked active for the duration of the event so that
    /// callbacks can find it through the worker.
    pub fn execute_next_event(&self) -> bool {
        // take the event with the queue unlocked so the task can post more
        let Some(event) = self.event_queue.lock().unwrap().pop() else {
            return false;
        };

        Worker::set_current_time(event.time());
        self.cpu.borrow_mut().advance_to(event.time());

        Worker::set_active_host(&self.arc());
        event.execute(self);
        Worker::clear_active_host();

        true
    }

    /// Execute every event with a deadline at or before `until`, then leave
    /// the clock at `until`.
    pub fn run_events_until(&self, until: EmulatedTime) {
        while let Some(time) = self.next_event_time() {
            if time > until {
                break;
            }
            self.execute_next_event();
        }
        Worker::set_current_time(until);
        self.cpu.borrow_mut().advance_to(until);
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.params.id)
            .field("name", &self.params.hostname)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::core::work::task::TaskRef;
    use crate::core::worker::WorkerThreadId;

    fn test_host(dir: &tempfile::TempDir) -> Arc<Host> {
        Worker::new_for_this_thread(WorkerThreadId(0));
        Worker::set_current_time(EmulatedTime::SIMULATION_START);
        Host::new(HostParameters {
            id: HostId(1),
            hostname: "testnode".to_string(),
            data_dir_path: dir.path().join("testnode"),
            cpu_frequency: 1_000_000_000,
            raw_cpu_frequency: 1_000_000_000,
            cpu_threshold: None,
            cpu_precision: None,
        })
    }

    #[test]
    fn test_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&dir);
        assert!(host.data_dir_path().is_dir());
        assert_eq!(host.name(), "testnode");
    }

    #[test]
    fn test_run_events_until_advances_clock() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&dir);

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        let task = TaskRef::new(move |_host| {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });
        Worker::schedule_task_with_delay(task, &host, SimulationTime::from_millis(10));

        let deadline = EmulatedTime::SIMULATION_START + SimulationTime::from_millis(5);
        host.run_events_until(deadline);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        assert_eq!(Worker::current_time(), Some(deadline));

        let deadline = EmulatedTime::SIMULATION_START + SimulationTime::from_millis(10);
        host.run_events_until(deadline);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(!host.execute_next_event());
    }

    #[test]
    fn test_process_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&dir);
        let a = host.get_new_process_id();
        let b = host.get_new_process_id();
        assert_ne!(a, b);
    }
}
