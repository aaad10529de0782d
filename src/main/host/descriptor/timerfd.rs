use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use umbra_time::emulated_time::EmulatedTime;
use umbra_time::simulation_time::SimulationTime;

use crate::host::descriptor::{
    FileState, StateEventSource, StateListenHandle, StateListenerFilter,
};
use crate::host::host::Host;
use crate::host::timer::Timer;
use crate::utility::callback_queue::CallbackQueue;

/// A timer that is also a descriptor: it becomes `READABLE` when it expires,
/// which is what a timeout listener monitors. Modeled on timerfd_create(2).
pub struct TimerFd {
    timer: Timer,
    event_source: StateEventSource,
    state: FileState,
}

impl TimerFd {
    /// Creates a new timer descriptor. It is returned shared because the
    /// underlying timer's expiration callback refers back to the descriptor
    /// to flip its readable bit.
    pub fn new() -> Arc<AtomicRefCell<Self>> {
        Arc::new_cyclic(|weak: &Weak<AtomicRefCell<Self>>| {
            let weak = weak.clone();
            AtomicRefCell::new(Self {
                timer: Timer::new(move |_host| Self::timer_expired(&weak)),
                event_source: StateEventSource::new(),
                state: FileState::ACTIVE,
            })
        })
    }

    fn timer_expired(weak: &Weak<AtomicRefCell<Self>>) {
        let Some(timerfd) = weak.upgrade() else {
            log::trace!("Expired TimerFd no longer exists.");
            return;
        };
        CallbackQueue::queue_and_run(|cb_queue| {
            timerfd.borrow_mut().update_state(cb_queue);
        });
    }

    /// Arm the timer to expire at `expire_time`, and then again after every
    /// `expire_interval` if it is nonzero. Rearming cancels any pending
    /// expiration and clears unread ones, per timerfd_settime(2).
    pub fn set_time(
        &mut self,
        host: &Host,
        cb_queue: &mut CallbackQueue,
        expire_time: EmulatedTime,
        expire_interval: SimulationTime,
    ) {
        self.timer.disarm();
        self.timer.arm(host, expire_time, expire_interval);
        self.update_state(cb_queue);
    }

    pub fn disarm(&mut self, cb_queue: &mut CallbackQueue) {
        self.timer.disarm();
        self.update_state(cb_queue);
    }

    /// The remaining time until the next expiration, or None when unarmed.
    pub fn remaining_time(&self) -> Option<SimulationTime> {
        self.timer.remaining_time()
    }

    pub fn expiration_count(&self) -> u64 {
        self.timer.expiration_count()
    }

    /// Consume and return the number of expirations since the last read, per
    /// timerfd semantics. Clears `READABLE`. Fails with `EWOULDBLOCK` when no
    /// expiration is pending.
    pub fn read(&mut self, cb_queue: &mut CallbackQueue) -> Result<u64, Errno> {
        let count = self.timer.consume_expiration_count();
        if count == 0 {
            return Err(Errno::EWOULDBLOCK);
        }
        self.update_state(cb_queue);
        Ok(count)
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) {
        self.copy_state(
            FileState::CLOSED | FileState::ACTIVE | FileState::READABLE,
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

    fn update_state(&mut self, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        // readable iff there is an unconsumed expiration
        let mut new_state = FileState::empty();
        new_state.set(FileState::READABLE, self.expiration_count() > 0);

        self.copy_state(FileState::READABLE, new_state, cb_queue);
    }

    fn copy_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
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
