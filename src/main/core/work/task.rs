use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

use crate::host::host::Host;
use crate::utility::{IsSend, IsSync, Magic, ObjectCounter};

/// A cheaply clonable callback that the scheduler runs against a host at a
/// chosen virtual time. Clones share the underlying closure, so a task posted
/// to the event queue keeps whatever the closure captured (typically a
/// process reference) alive until the last clone is dropped.
pub struct TaskRef {
    magic: Magic<0xe0408897>,
    _counter: ObjectCounter,
    inner: Arc<AtomicRefCell<dyn FnMut(&Host) + Send + Sync>>,
}

impl TaskRef {
    pub fn new<T: 'static + FnMut(&Host) + Send + Sync>(f: T) -> Self {
        Self {
            magic: Magic::new(),
            _counter: ObjectCounter::new("TaskRef"),
            inner: Arc::new(AtomicRefCell::new(f)),
        }
    }

    pub fn execute(&self, host: &Host) {
        self.magic.debug_check();
        let mut inner = self.inner.borrow_mut();
        (&mut *inner)(host)
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.magic.debug_check();
        Self {
            magic: Magic::new(),
            _counter: ObjectCounter::new("TaskRef"),
            inner: self.inner.clone(),
        }
    }
}

impl PartialEq for TaskRef {
    /// Two `TaskRef`s are equal iff they reference the same underlying closure.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TaskRef {}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

impl IsSend for TaskRef {}
impl IsSync for TaskRef {}
