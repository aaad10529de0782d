use nix::errno::Errno;

use crate::host::descriptor::{
    FileState, StateEventSource, StateListenHandle, StateListenerFilter,
};
use crate::utility::callback_queue::CallbackQueue;

/// A counting descriptor modeled on eventfd(2). It is the simplest file that
/// exercises both readable and writable edges, which makes it the reference
/// implementation of the status/listener contract.
pub struct EventFd {
    counter: u64,
    is_semaphore_mode: bool,
    event_source: StateEventSource,
    state: FileState,
}

// eventfd(2): the counter saturates at the maximum value minus one
const MAX_COUNTER: u64 = u64::MAX - 1;

impl EventFd {
    pub fn new(init_value: u64, is_semaphore_mode: bool) -> Self {
        let mut state = FileState::ACTIVE | FileState::WRITABLE;
        state.set(FileState::READABLE, init_value > 0);
        Self {
            counter: init_value,
            is_semaphore_mode,
            event_source: StateEventSource::new(),
            state,
        }
    }

    /// Read the counter: returns the full count (or 1 in semaphore mode) and
    /// decrements accordingly. Fails with `EWOULDBLOCK` at zero.
    pub fn read(&mut self, cb_queue: &mut CallbackQueue) -> Result<u64, Errno> {
        if self.counter == 0 {
            log::trace!("EventFd counter is 0 and cannot be read right now");
            return Err(Errno::EWOULDBLOCK);
        }

        let value = if self.is_semaphore_mode {
            self.counter -= 1;
            1
        } else {
            std::mem::replace(&mut self.counter, 0)
        };

        self.refresh_state(cb_queue);
        Ok(value)
    }

    /// Add `value` to the counter. Fails with `EINVAL` for the reserved
    /// maximum value and `EWOULDBLOCK` when the counter can't fit the sum.
    pub fn write(&mut self, value: u64, cb_queue: &mut CallbackQueue) -> Result<(), Errno> {
        if value == u64::MAX {
            log::trace!("We do not allow writing the max counter value");
            return Err(Errno::EINVAL);
        }

        if value > MAX_COUNTER - self.counter {
            log::trace!("The write value does not currently fit into the counter");
            return Err(Errno::EWOULDBLOCK);
        }

        self.counter += value;
        self.refresh_state(cb_queue);
        Ok(())
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) {
        self.update_state(
            FileState::CLOSED | FileState::ACTIVE | FileState::READABLE | FileState::WRITABLE,
            FileState::CLOSED,
            cb_queue,
        );
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.event_source.add_listener(monitoring, filter, notify_fn)
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    fn refresh_state(&mut self, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let mut readable_writable = FileState::empty();

        // readable with a nonzero counter, writable while a value of at
        // least 1 still fits
        readable_writable.set(FileState::READABLE, self.counter > 0);
        readable_writable.set(FileState::WRITABLE, self.counter < MAX_COUNTER);

        self.update_state(
            FileState::READABLE | FileState::WRITABLE,
            readable_writable,
            cb_queue,
        );
    }

    fn update_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        // remove the masked flags, then copy the masked flags
        self.state.remove(mask);
        self.state.insert(state & mask);

        self.handle_state_change(old_state, cb_queue);
    }

    fn handle_state_change(&mut self, old_state: FileState, cb_queue: &mut CallbackQueue) {
        let states_changed = self.state ^ old_state;

        if states_changed.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.state, states_changed, cb_queue);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_read_write_edges() {
        let mut efd = EventFd::new(0, false);
        assert!(!efd.state().contains(FileState::READABLE));
        assert!(efd.state().contains(FileState::WRITABLE));

        CallbackQueue::queue_and_run(|cb_queue| {
            assert_eq!(efd.read(cb_queue), Err(Errno::EWOULDBLOCK));
            assert_eq!(efd.write(3, cb_queue), Ok(()));
        });
        assert!(efd.state().contains(FileState::READABLE));

        CallbackQueue::queue_and_run(|cb_queue| {
            assert_eq!(efd.read(cb_queue), Ok(3));
        });
        assert!(!efd.state().contains(FileState::READABLE));
    }

    #[test]
    fn test_semaphore_mode_decrements() {
        let mut efd = EventFd::new(2, true);
        CallbackQueue::queue_and_run(|cb_queue| {
            assert_eq!(efd.read(cb_queue), Ok(1));
        });
        assert!(efd.state().contains(FileState::READABLE));
        CallbackQueue::queue_and_run(|cb_queue| {
            assert_eq!(efd.read(cb_queue), Ok(1));
        });
        assert!(!efd.state().contains(FileState::READABLE));
    }

    #[test]
    fn test_rejects_invalid_writes() {
        let mut efd = EventFd::new(0, false);
        CallbackQueue::queue_and_run(|cb_queue| {
            assert_eq!(efd.write(u64::MAX, cb_queue), Err(Errno::EINVAL));
            assert_eq!(efd.write(MAX_COUNTER, cb_queue), Ok(()));
            assert_eq!(efd.write(1, cb_queue), Err(Errno::EWOULDBLOCK));
        });
        assert!(!efd.state().contains(FileState::WRITABLE));
    }

    #[test]
    fn test_listener_sees_readable_edge() {
        let mut efd = EventFd::new(0, false);
        let notified = Arc::new(AtomicU32::new(0));
        let notified_clone = Arc::clone(&notified);
        let _handle = efd.add_listener(
            FileState::READABLE,
            StateListenerFilter::OffToOn,
            move |_state, _changed, _cb_queue| {
                notified_clone.fetch_add(1, Ordering::Relaxed);
            },
        );

        CallbackQueue::queue_and_run(|cb_queue| {
            efd.write(1, cb_queue).unwrap();
        });
        assert_eq!(notified.load(Ordering::Relaxed), 1);

        // already readable; a second write is not an off-to-on edge
        CallbackQueue::queue_and_run(|cb_queue| {
            efd.write(1, cb_queue).unwrap();
        });
        assert_eq!(notified.load(Ordering::Relaxed), 1);
    }
}
