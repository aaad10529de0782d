use umbra_time::emulated_time::EmulatedTime;

use crate::host::host::{Host, HostId};
use crate::utility::{Magic, ObjectCounter};

use super::task::TaskRef;

/// A task bound to a host and a virtual deadline. Events with equal deadlines
/// are ordered by the host's insertion counter, so tasks posted at the same
/// virtual time fire in the order they were scheduled.
#[derive(Debug)]
pub struct Event {
    magic: Magic<0x3adf260f>,
    task: TaskRef,
    time: EmulatedTime,
    host_id: HostId,
    host_event_id: u64,
    _counter: ObjectCounter,
}

impl Event {
    pub fn new(task: TaskRef, time: EmulatedTime, host: &Host) -> Self {
        Self {
            magic: Magic::new(),
            task,
            time,
            host_id: host.id(),
            host_event_id: host.get_new_event_id(),
            _counter: ObjectCounter::new("Event"),
        }
    }

    pub fn execute(self, host: &Host) {
        self.magic.debug_check();

        // make sure we're executing on the correct host
        assert_eq!(self.host_id(), host.id());

        self.task.execute(host);
    }

    pub fn time(&self) -> EmulatedTime {
        self.magic.debug_check();
        self.time
    }

    pub fn host_id(&self) -> HostId {
        self.magic.debug_check();
        self.host_id
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.magic.debug_check();
        other.magic.debug_check();

        self.time == other.time
            && self.host_id == other.host_id
            && self.host_event_id == other.host_event_id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.magic.debug_check();
        other.magic.debug_check();

        // sort by event time first; the per-host insertion counter breaks
        // ties deterministically
        self.time
            .cmp(&other.time)
            .then_with(|| self.host_id.cmp(&other.host_id))
            .then_with(|| self.host_event_id.cmp(&other.host_event_id))
    }
}
