pub mod callback_queue;
pub mod counter;
pub mod macros;
pub mod perf_timer;

use crate::core::worker::Worker;

/// A trait we can use as a compile-time check to make sure that an object is Send.
pub trait IsSend: Send {}

/// A trait we can use as a compile-time check to make sure that an object is Sync.
pub trait IsSync: Sync {}

/// Runtime memory error checking for objects whose lifetimes are managed
/// through shared ownership and asynchronous callbacks.
///
/// Prefer to place `Magic` struct fields as the *first* field. This causes the
/// `Magic` field to be dropped first when dropping the enclosing struct, which
/// validates that the `Magic` is valid before running `Drop` implementations
/// of the other fields.
///
/// The MAGIC parameter should ideally be unique for each type. Consider e.g.
/// `python3 -c 'import random; print(random.randint(0, 2**32))'`
#[derive(Debug)]
pub struct Magic<const MAGIC: u32> {
    #[cfg(debug_assertions)]
    magic: u32,
}

impl<const MAGIC: u32> Magic<MAGIC> {
    pub fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            magic: MAGIC,
        }
    }

    pub fn debug_check(&self) {
        #[cfg(debug_assertions)]
        {
            if unsafe { std::ptr::read_volatile(&self.magic) } != MAGIC {
                // Rust's soundness requirements have likely been violated;
                // stop before Drop implementations make it worse.
                std::process::abort();
            }
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
        }
    }
}

impl<const MAGIC: u32> Default for Magic<MAGIC> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAGIC: u32> Drop for Magic<MAGIC> {
    fn drop(&mut self) {
        self.debug_check();
        #[cfg(debug_assertions)]
        unsafe {
            std::ptr::write_volatile(&mut self.magic, 0)
        };
    }
}

impl<const MAGIC: u32> Clone for Magic<MAGIC> {
    fn clone(&self) -> Self {
        self.debug_check();
        Self::new()
    }
}

/// Increments the worker's allocation counter for `name` on creation and the
/// deallocation counter on drop. Embed one of these in any object whose
/// create/free balance should be auditable at the end of a simulation.
#[derive(Debug)]
pub struct ObjectCounter {
    name: &'static str,
}

impl ObjectCounter {
    pub fn new(name: &'static str) -> Self {
        Worker::increment_object_alloc_counter(name);
        Self { name }
    }
}

impl Drop for ObjectCounter {
    fn drop(&mut self) {
        Worker::increment_object_dealloc_counter(self.name);
    }
}

impl Clone for ObjectCounter {
    fn clone(&self) -> Self {
        Self::new(self.name)
    }
}
