//! The descriptor status/listener contract.
//!
//! A simulated file advertises its readiness through a [`FileState`] bitmask
//! and notifies subscribed listeners whenever monitored bits flip. Listeners
//! are delivered through a [`CallbackQueue`] so that a notification can
//! safely re-enter the descriptor that produced it.

use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};

pub mod eventfd;
pub mod timerfd;

bitflags::bitflags! {
    /// The readiness of a simulated file.
    #[derive(Default)]
    pub struct FileState: u32 {
        /// Initialized; it is OK to unblock a guest waiting on another state.
        const ACTIVE = 1 << 0;
        /// Can be read, i.e. there is data or an expiration waiting for the user.
        const READABLE = 1 << 1;
        /// Can be written, i.e. there is available buffer space.
        const WRITABLE = 1 << 2;
        /// The user already called close.
        const CLOSED = 1 << 3;
    }
}

/// Which status transitions cause a listener to be notified.
#[derive(Clone, Copy, Debug)]
pub enum StateListenerFilter {
    Never,
    OffToOn,
    OnToOff,
    Always,
}

/// A handle detaches its listener from the event source when dropped.
pub type StateListenHandle = Handle<(FileState, FileState)>;

/// An event source that passes the current state and the changed bits to each
/// listener, filtered by the bits the listener monitors and the edge it cares
/// about.
pub struct StateEventSource {
    inner: EventSource<(FileState, FileState)>,
}

impl StateEventSource {
    pub fn new() -> Self {
        Self {
            inner: EventSource::new(),
        }
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.inner.add_listener(move |(state, changed), cb_queue| {
            // true if any of the bits we're monitoring have changed
            let flipped = monitoring.intersects(changed);

            // true if any of the bits we're monitoring are set
            let on = monitoring.intersects(state);

            let notify = match filter {
                // at least one monitored bit is on, and at least one changed
                StateListenerFilter::OffToOn => flipped && on,
                // all monitored bits are off, and at least one changed
                StateListenerFilter::OnToOff => flipped && !on,
                // at least one monitored bit changed
                StateListenerFilter::Always => flipped,
                StateListenerFilter::Never => false,
            };

            if !notify {
                return;
            }

            (notify_fn)(state, changed, cb_queue)
        })
    }

    pub fn notify_listeners(
        &mut self,
        state: FileState,
        changed: FileState,
        cb_queue: &mut CallbackQueue,
    ) {
        self.inner.notify_listeners((state, changed), cb_queue)
    }
}

impl Default for StateEventSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared handle to any type of file object.
#[derive(Clone)]
pub enum File {
    TimerFd(Arc<AtomicRefCell<timerfd::TimerFd>>),
    EventFd(Arc<AtomicRefCell<eventfd::EventFd>>),
}

impl File {
    pub fn state(&self) -> FileState {
        match self {
            Self::TimerFd(f) => f.borrow().state(),
            Self::EventFd(f) => f.borrow().state(),
        }
    }

    pub fn add_listener(
        &self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        match self {
            Self::TimerFd(f) => f.borrow_mut().add_listener(monitoring, filter, notify_fn),
            Self::EventFd(f) => f.borrow_mut().add_listener(monitoring, filter, notify_fn),
        }
    }

    /// A stable identifier for logging; distinct live files never collide.
    pub fn canonical_handle(&self) -> usize {
        match self {
            Self::TimerFd(f) => Arc::as_ptr(f) as usize,
            Self::EventFd(f) => Arc::as_ptr(f) as usize,
        }
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimerFd(_) => write!(f, "TimerFd")?,
            Self::EventFd(_) => write!(f, "EventFd")?,
        }
        write!(f, "(state: {:?})", self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_edges() {
        let fired = Arc::new(AtomicRefCell::new(Vec::new()));

        let mut source = StateEventSource::new();
        let fired_clone = Arc::clone(&fired);
        let _handle = source.add_listener(
            FileState::READABLE,
            StateListenerFilter::OffToOn,
            move |state, changed, _cb_queue| {
                fired_clone.borrow_mut().push((state, changed));
            },
        );

        // unmonitored bit flips are ignored
        CallbackQueue::queue_and_run(|cb_queue| {
            source.notify_listeners(FileState::WRITABLE, FileState::WRITABLE, cb_queue)
        });
        assert!(fired.borrow().is_empty());

        // the monitored bit turning on fires
        CallbackQueue::queue_and_run(|cb_queue| {
            source.notify_listeners(
                FileState::READABLE | FileState::WRITABLE,
                FileState::READABLE,
                cb_queue,
            )
        });
        assert_eq!(fired.borrow().len(), 1);

        // the monitored bit turning off does not fire for OffToOn
        CallbackQueue::queue_and_run(|cb_queue| {
            source.notify_listeners(FileState::WRITABLE, FileState::READABLE, cb_queue)
        });
        assert_eq!(fired.borrow().len(), 1);
    }
}
