use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use crate::core::configuration::InterposeMethod;
use crate::host::thread_preload::PreloadThread;
use crate::host::thread_ptrace::PtraceThread;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The execution unit for a guest program: a native child process driven by
/// an interposition supervisor. Calls into the guest are synchronous from the
/// simulator's point of view; `run` and `resume` return once the guest has
/// yielded at a blocking point or exited.
///
/// A thread is the sole writer of the native child's state; the owning
/// [`Process`](crate::host::process::Process) is the sole owner of the
/// thread, though waiters hold shared references so they can name which
/// thread to resume.
pub trait Thread: Send + Sync {
    /// Spawn the child with the given argument and environment vectors and
    /// execute it to its first blocking point or exit. The child's stdout and
    /// stderr are redirected to the given file descriptors.
    fn run(&self, argv: &[CString], envv: &[CString], stdout_fd: RawFd, stderr_fd: RawFd);

    /// Continue execution after the awaited event has occurred, until the
    /// next blocking point or exit.
    fn resume(&self);

    /// Force-stop the child. No-op once the child has already exited.
    fn terminate(&self);

    /// Whether the child is still alive and not yet exited.
    fn is_running(&self) -> bool;

    /// Defined only once `is_running` is false. Negative values indicate
    /// death by that signal number.
    fn return_code(&self) -> Option<i32>;

    fn id(&self) -> ThreadId;
}

/// Build the main thread of a process using the configured interposition
/// variant.
pub fn new_main_thread(
    method: InterposeMethod,
    id: ThreadId,
    exe_path: &Path,
) -> Arc<dyn Thread> {
    match method {
        InterposeMethod::Ptrace => Arc::new(PtraceThread::new(id, exe_path)),
        InterposeMethod::Preload => Arc::new(PreloadThread::new(id, exe_path)),
    }
}
