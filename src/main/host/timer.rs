use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use log::trace;
use umbra_time::emulated_time::EmulatedTime;
use umbra_time::simulation_time::SimulationTime;

use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::host::Host;
use crate::utility::{Magic, ObjectCounter};

pub struct Timer {
    magic: Magic<2537832161>,
    _counter: ObjectCounter,
    // Internals in an Arc so that we can schedule tasks that refer back to
    // it. This is the only persistent strong reference - scheduled callbacks
    // hold a Weak, so expirations of a dropped timer become no-ops.
    internal: Arc<AtomicRefCell<TimerInternal>>,
}

struct TimerInternal {
    next_expire_time: Option<EmulatedTime>,
    expire_interval: SimulationTime,
    expiration_count: u64,
    next_expire_id: u64,
    min_valid_expire_id: u64,
    on_expire: Box<dyn Fn(&Host) + Send + Sync>,
}

impl Timer {
    /// Create a new Timer that directly executes `on_expire` on expiration.
    /// `on_expire` will panic if it calls mutable methods of the enclosing
    /// Timer; such work must be pushed to the scheduler as a new task.
    pub fn new<F: 'static + Fn(&Host) + Send + Sync>(on_expire: F) -> Self {
        Self {
            magic: Magic::new(),
            _counter: ObjectCounter::new("Timer"),
            internal: Arc::new(AtomicRefCell::new(TimerInternal {
                next_expire_time: None,
                expire_interval: SimulationTime::ZERO,
                expiration_count: 0,
                next_expire_id: 0,
                min_valid_expire_id: 0,
                on_expire: Box::new(on_expire),
            })),
        }
    }

    /// How many times the timer has expired since the count was last consumed.
    pub fn expiration_count(&self) -> u64 {
        self.magic.debug_check();
        self.internal.borrow().expiration_count
    }

    pub fn expire_interval(&self) -> SimulationTime {
        self.magic.debug_check();
        self.internal.borrow().expire_interval
    }

    /// Return the expiration count and reset it to zero.
    pub fn consume_expiration_count(&mut self) -> u64 {
        self.magic.debug_check();
        let mut internal = self.internal.borrow_mut();
        let e = internal.expiration_count;
        internal.expiration_count = 0;
        e
    }

    /// The remaining time until the next expiration if the timer is armed,
    /// or None otherwise.
    pub fn remaining_time(&self) -> Option<SimulationTime> {
        self.magic.debug_check();
        let t = self.internal.borrow().next_expire_time?;
        let now = Worker::current_time().unwrap();
        Some(t.saturating_duration_since(&now))
    }

    pub fn disarm(&mut self) {
        self.magic.debug_check();
        let mut internal = self.internal.borrow_mut();
        internal.next_expire_time = None;
        internal.expire_interval = SimulationTime::ZERO;
        internal.expiration_count = 0;
        internal.min_valid_expire_id = internal.next_expire_id;
    }

    fn timer_expire(
        internal_weak: &Weak<AtomicRefCell<TimerInternal>>,
        host: &Host,
        expire_id: u64,
    ) {
        let Some(internal) = Weak::upgrade(internal_weak) else {
            trace!("Expired Timer no longer exists.");
            return;
        };

        let mut internal_brw = internal.borrow_mut();
        trace!(
            "timer expire check; expire_id={} min_valid_expire_id={}",
            expire_id,
            internal_brw.min_valid_expire_id
        );
        if expire_id < internal_brw.min_valid_expire_id {
            // cancelled
            return;
        }

        let Some(next_expire_time) = internal_brw.next_expire_time else {
            // a one-shot expiration already fired and disarmed the timer
            return;
        };
        if next_expire_time > Worker::current_time().unwrap() {
            // hasn't expired yet; check again later
            Self::schedule_new_expire_event(&mut internal_brw, internal_weak.clone(), host);
            return;
        }

        internal_brw.expiration_count += 1;
        if internal_brw.expire_interval > SimulationTime::ZERO {
            internal_brw.next_expire_time = Some(next_expire_time + internal_brw.expire_interval);
            Self::schedule_new_expire_event(&mut internal_brw, internal_weak.clone(), host);
        } else {
            internal_brw.next_expire_time = None;
        }

        // re-borrow as an immutable reference while executing the callback
        drop(internal_brw);
        let internal_brw = internal.borrow();
        (internal_brw.on_expire)(host);
    }

    fn schedule_new_expire_event(
        internal_ref: &mut TimerInternal,
        internal_ptr: Weak<AtomicRefCell<TimerInternal>>,
        host: &Host,
    ) {
        let now = Worker::current_time().unwrap();
        let delay = std::cmp::min(
            internal_ref.next_expire_time.unwrap() - now,
            SimulationTime::SECOND,
        );
        let expire_id = internal_ref.next_expire_id;
        internal_ref.next_expire_id += 1;
        let task = TaskRef::new(move |host| Self::timer_expire(&internal_ptr, host, expire_id));
        Worker::schedule_task_with_delay(task, host, delay);
    }

    pub fn arm(&mut self, host: &Host, expire_time: EmulatedTime, expire_interval: SimulationTime) {
        self.magic.debug_check();

        let mut internal = self.internal.borrow_mut();
        debug_assert!(expire_time >= Worker::current_time().unwrap());
        internal.next_expire_time = Some(expire_time);
        internal.expire_interval = expire_interval;
        Self::schedule_new_expire_event(&mut internal, Arc::downgrade(&self.internal), host);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::core::worker::WorkerThreadId;
    use crate::host::host::{HostId, HostParameters};

    fn test_host(dir: &tempfile::TempDir) -> Arc<Host> {
        Worker::new_for_this_thread(WorkerThreadId(0));
        Worker::set_current_time(EmulatedTime::SIMULATION_START);
        Host::new(HostParameters {
            id: HostId(0),
            hostname: "testnode".to_string(),
            data_dir_path: dir.path().join("testnode"),
            cpu_frequency: 1_000_000_000,
            raw_cpu_frequency: 1_000_000_000,
            cpu_threshold: None,
            cpu_precision: None,
        })
    }

    #[test]
    fn test_one_shot_expires_once() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&dir);

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        let mut timer = Timer::new(move |_host| {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });

        let expire = EmulatedTime::SIMULATION_START + SimulationTime::from_millis(10);
        timer.arm(&host, expire, SimulationTime::ZERO);
        assert_eq!(
            timer.remaining_time(),
            Some(SimulationTime::from_millis(10))
        );

        host.run_events_until(EmulatedTime::SIMULATION_START + SimulationTime::from_secs(1));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(timer.expiration_count(), 1);
        assert_eq!(timer.consume_expiration_count(), 1);
        assert_eq!(timer.expiration_count(), 0);
        assert_eq!(timer.remaining_time(), None);
    }

    #[test]
    fn test_disarm_cancels_pending_expiration() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&dir);

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        let mut timer = Timer::new(move |_host| {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });

        let expire = EmulatedTime::SIMULATION_START + SimulationTime::from_millis(10);
        timer.arm(&host, expire, SimulationTime::ZERO);
        timer.disarm();

        host.run_events_until(EmulatedTime::SIMULATION_START + SimulationTime::from_secs(1));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_interval_reschedules() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(&dir);

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        let mut timer = Timer::new(move |_host| {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });

        let expire = EmulatedTime::SIMULATION_START + SimulationTime::from_millis(10);
        timer.arm(&host, expire, SimulationTime::from_millis(10));

        host.run_events_until(EmulatedTime::SIMULATION_START + SimulationTime::from_millis(35));
        assert_eq!(fired.load(Ordering::Relaxed), 3);
        assert_eq!(timer.expiration_count(), 3);
    }
}
