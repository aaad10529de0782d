use std::cmp::Reverse;
use std::collections::binary_heap::BinaryHeap;

use umbra_time::emulated_time::EmulatedTime;

use super::event::Event;

/// A queue of [`Event`]s ordered by their times.
#[derive(Debug)]
pub struct EventQueue {
    queue: BinaryHeap<Reverse<Event>>,
    last_popped_event_time: EmulatedTime,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            last_popped_event_time: EmulatedTime::SIMULATION_START,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Push a new [`Event`] on to the queue.
    pub fn push(&mut self, event: Event) {
        self.queue.push(Reverse(event));
    }

    /// Pop the earliest [`Event`] from the queue.
    pub fn pop(&mut self) -> Option<Event> {
        let event = self.queue.pop().map(|x| x.0);

        // make sure time never moves backward
        if let Some(ref event) = event {
            assert!(event.time() >= self.last_popped_event_time);
            self.last_popped_event_time = event.time();
        }

        event
    }

    /// The time of the earliest event in the queue.
    pub fn next_event_time(&self) -> Option<EmulatedTime> {
        self.queue.peek().map(|x| x.0.time())
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use umbra_time::simulation_time::SimulationTime;

    use super::*;
    use crate::core::work::task::TaskRef;
    use crate::core::worker::{Worker, WorkerThreadId};
    use crate::host::host::{Host, HostId, HostParameters};

    fn test_host(data_dir_path: PathBuf) -> Arc<Host> {
        Worker::new_for_this_thread(WorkerThreadId(0));
        Host::new(HostParameters {
            id: HostId(0),
            hostname: "testnode".to_string(),
            data_dir_path,
            cpu_frequency: 1_000_000_000,
            raw_cpu_frequency: 1_000_000_000,
            cpu_threshold: None,
            cpu_precision: None,
        })
    }

    #[test]
    fn test_equal_times_pop_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(dir.path().join("testnode"));

        let fired = Arc::new(AtomicU32::new(0));
        let time = EmulatedTime::SIMULATION_START + SimulationTime::from_millis(5);

        let mut queue = EventQueue::new();
        for expected in 0..3u32 {
            let fired = Arc::clone(&fired);
            let task = TaskRef::new(move |_host| {
                assert_eq!(fired.fetch_add(1, Ordering::Relaxed), expected);
            });
            queue.push(Event::new(task, time, &host));
        }

        while let Some(event) = queue.pop() {
            event.execute(&host);
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_pops_earliest_first() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(dir.path().join("testnode"));

        let mut queue = EventQueue::new();
        let late = EmulatedTime::SIMULATION_START + SimulationTime::SECOND;
        let early = EmulatedTime::SIMULATION_START + SimulationTime::NANOSECOND;
        queue.push(Event::new(TaskRef::new(|_| {}), late, &host));
        queue.push(Event::new(TaskRef::new(|_| {}), early, &host));

        assert_eq!(queue.next_event_time(), Some(early));
        assert_eq!(queue.pop().unwrap().time(), early);
        assert_eq!(queue.pop().unwrap().time(), late);
        assert!(queue.pop().is_none());
    }
}
