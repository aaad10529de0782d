//! The per-guest-program controller.
//!
//! A [`Process`] owns the native execution of one guest program on a
//! simulated host: it launches the guest at its scheduled start time,
//! suspends it whenever the guest blocks, resumes it when an awaited event
//! fires, and terminates it at its scheduled stop time. Every entry into
//! guest code is wall-clock timed and charged against the host's simulated
//! CPU, which is how slow guests fall behind fast ones on the shared virtual
//! timeline.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use atomic_refcell::AtomicRefCell;
use log::{debug, info, trace, warn};
use umbra_time::simulation_time::SimulationTime;

use crate::core::configuration::{InterposeMethod, ProcessOptions};
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::descriptor::timerfd::TimerFd;
use crate::host::descriptor::{File as Descriptor, FileState, StateListenHandle, StateListenerFilter};
use crate::host::host::Host;
use crate::host::thread::{self, Thread, ThreadId};
use crate::utility::callback_queue::CallbackQueue;
use crate::utility::perf_timer::PerfTimer;
use crate::utility::{Magic, ObjectCounter};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Process {
    magic: Magic<3724796014>,
    _counter: ObjectCounter,

    // so that task and listener closures can own the process
    weak_self: Weak<Process>,

    host: Arc<Host>,
    id: ProcessId,
    name: String,

    interpose_method: InterposeMethod,
    exe_name: String,
    exe_path: PathBuf,

    start_time: SimulationTime,
    /// None means the process is never forcibly stopped.
    stop_time: Option<SimulationTime>,

    argv: Vec<CString>,
    envv: Vec<CString>,

    // the main execution unit for the guest
    main_thread: AtomicRefCell<Option<Arc<dyn Thread>>>,
    thread_id_counter: AtomicU32,

    return_code: AtomicRefCell<Option<i32>>,
    did_log_return_code: AtomicBool,

    // true strictly while control is inside guest code
    is_executing: AtomicBool,

    // wall time spent executing the guest
    total_run_time: AtomicRefCell<Duration>,

    // opened at start, then kept open for the life of the process
    stdout_file: AtomicRefCell<Option<File>>,
    stderr_file: AtomicRefCell<Option<File>>,
}

impl Process {
    /// Stores the configuration of a new process. Does not open files and
    /// does not spawn a thread; nothing happens until [`schedule`](Self::schedule).
    ///
    /// Panics when the executable name or path is empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: Arc<Host>,
        id: ProcessId,
        start_time: SimulationTime,
        stop_time: Option<SimulationTime>,
        interpose_method: InterposeMethod,
        exe_name: &str,
        exe_path: &Path,
        envv: Vec<CString>,
        argv: Vec<CString>,
    ) -> Arc<Process> {
        assert!(!exe_name.is_empty(), "a process must name its executable");
        assert!(
            !exe_path.as_os_str().is_empty(),
            "a process must have an executable path"
        );

        let name = format!("{}.{}.{}", host.name(), exe_name, id);

        Arc::new_cyclic(|weak_self| Process {
            magic: Magic::new(),
            _counter: ObjectCounter::new("Process"),
            weak_self: weak_self.clone(),
            host,
            id,
            name,
            interpose_method,
            exe_name: exe_name.to_string(),
            exe_path: exe_path.to_path_buf(),
            start_time,
            stop_time,
            argv,
            envv,
            main_thread: AtomicRefCell::new(None),
            thread_id_counter: AtomicU32::new(0),
            return_code: AtomicRefCell::new(None),
            did_log_return_code: AtomicBool::new(false),
            is_executing: AtomicBool::new(false),
            total_run_time: AtomicRefCell::new(Duration::ZERO),
            stdout_file: AtomicRefCell::new(None),
            stderr_file: AtomicRefCell::new(None),
        })
    }

    /// Build a process from its configuration entry.
    pub fn from_options(host: Arc<Host>, id: ProcessId, options: &ProcessOptions) -> Arc<Process> {
        Self::new(
            host,
            id,
            options.start_time,
            options.stop_time,
            options.interpose_method,
            &options.exe_name(),
            &options.path,
            options.envv(),
            options.argv(),
        )
    }

    fn arc(&self) -> Arc<Process> {
        // can't fail while a method is executing on self
        self.weak_self.upgrade().unwrap()
    }

    pub fn id(&self) -> ProcessId {
        self.magic.debug_check();
        self.id
    }

    /// The host this process runs on.
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn name(&self) -> &str {
        self.magic.debug_check();
        &self.name
    }

    pub fn interpose_method(&self) -> InterposeMethod {
        self.magic.debug_check();
        self.interpose_method
    }

    pub fn start_time(&self) -> SimulationTime {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<SimulationTime> {
        self.stop_time
    }

    pub fn return_code(&self) -> Option<i32> {
        *self.return_code.borrow()
    }

    /// Wall time spent executing guest code so far.
    pub fn total_run_time(&self) -> Duration {
        *self.total_run_time.borrow()
    }

    /// True strictly while control is inside guest code.
    pub fn is_executing(&self) -> bool {
        self.is_executing.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.magic.debug_check();
        self.main_thread
            .borrow()
            .as_ref()
            .map(|thread| thread.is_running())
            .unwrap_or(false)
    }

    // TODO: wire epoll descriptors through the listener layer once the epoll
    // mapping is defined.
    pub fn wants_notify(&self, _epollfd: i32) -> bool {
        false
    }

    /// Post the start task (and the stop task, when a stop time is set) to
    /// the host's event queue. Tasks that are already due are posted one tick
    /// in the future, never zero, to preserve event-loop ordering; each task
    /// owns a reference to the process.
    pub fn schedule(&self, host: &Host) {
        self.magic.debug_check();

        let now = Worker::current_time().unwrap().to_abs_simtime();

        if self.stop_time.is_none() || self.start_time < self.stop_time.unwrap() {
            let start_delay = if self.start_time <= now {
                SimulationTime::NANOSECOND
            } else {
                self.start_time - now
            };
            let process = self.arc();
            let task = TaskRef::new(move |host| process.start(host));
            Worker::schedule_task_with_delay(task, host, start_delay);
        }

        if let Some(stop_time) = self.stop_time {
            if stop_time > self.start_time {
                let stop_delay = if stop_time <= now {
                    SimulationTime::NANOSECOND
                } else {
                    stop_time - now
                };
                let process = self.arc();
                let task = TaskRef::new(move |host| process.stop(host));
                Worker::schedule_task_with_delay(task, host, stop_delay);
            }
        }
    }

    /// Launch the guest and execute it to its first blocking point or exit.
    /// Does nothing when the process is already running.
    fn start(&self, host: &Host) {
        self.magic.debug_check();

        if self.is_running() {
            return;
        }

        self.open_stdio_files(host);

        let thread_id = ThreadId(self.thread_id_counter.fetch_add(1, Ordering::Relaxed));
        let thread = thread::new_main_thread(self.interpose_method, thread_id, &self.exe_path);
        self.run_main_thread(host, thread);
    }

    /// Install `thread` as the main thread and run it to its first blocking
    /// point or exit.
    fn run_main_thread(&self, host: &Host, thread: Arc<dyn Thread>) {
        {
            let mut main_thread = self.main_thread.borrow_mut();
            assert!(main_thread.is_none());
            *main_thread = Some(Arc::clone(&thread));
        }

        info!("starting process '{}'", self.name);

        let stdout_fd = self.stdout_file.borrow().as_ref().unwrap().as_raw_fd();
        let stderr_fd = self.stderr_file.borrow().as_ref().unwrap().as_raw_fd();

        let elapsed =
            self.run_guest(host, || thread.run(&self.argv, &self.envv, stdout_fd, stderr_fd));

        info!(
            "process '{}' started in {} seconds",
            self.name,
            elapsed.as_secs_f64()
        );

        self.check(host);
    }

    /// Resume the given thread (or the main thread) after an awaited event
    /// has occurred. Does nothing when the process is not running.
    pub fn continue_execution(&self, host: &Host, thread: Option<&Arc<dyn Thread>>) {
        self.magic.debug_check();

        if !self.is_running() {
            return;
        }

        debug!(
            "switching to thread controller to continue executing process '{}'",
            self.name
        );

        let thread = thread
            .cloned()
            .unwrap_or_else(|| Arc::clone(self.main_thread.borrow().as_ref().unwrap()));

        let elapsed = self.run_guest(host, || thread.resume());

        debug!(
            "process '{}' ran for {} seconds",
            self.name,
            elapsed.as_secs_f64()
        );

        self.check(host);
    }

    /// Forcibly terminate the guest. A stop that fires after the guest has
    /// already exited is a no-op.
    pub fn stop(&self, host: &Host) {
        self.magic.debug_check();

        info!("terminating process '{}'", self.name);

        let mut terminated = false;
        let elapsed = self.run_guest(host, || {
            if let Some(thread) = self.main_thread.borrow_mut().take() {
                thread.terminate();
                *self.return_code.borrow_mut() = thread.return_code();
                terminated = true;
            }
        });

        info!(
            "process '{}' stopped in {} seconds",
            self.name,
            elapsed.as_secs_f64()
        );

        if terminated {
            info!(
                "total runtime for process '{}' was {} seconds",
                self.name,
                self.total_run_time.borrow().as_secs_f64()
            );
        }

        self.check(host);
    }

    /// Inspect the main thread after a guest burst: either the guest is
    /// blocked waiting for events, or it has exited and its return code is
    /// collected and logged exactly once.
    fn check(&self, _host: &Host) {
        self.magic.debug_check();

        let thread = match &*self.main_thread.borrow() {
            Some(thread) => Arc::clone(thread),
            None => return,
        };

        if thread.is_running() {
            debug!(
                "process '{}' is running, but threads are blocked waiting for events",
                self.name
            );
            return;
        }

        let return_code = thread
            .return_code()
            .expect("a stopped thread must report its return code");

        info!(
            "process '{}' has completed or is otherwise no longer running",
            self.name
        );
        self.log_return_code(return_code);

        thread.terminate();
        *self.main_thread.borrow_mut() = None;
        *self.return_code.borrow_mut() = Some(return_code);

        info!(
            "total runtime for process '{}' was {} seconds",
            self.name,
            self.total_run_time.borrow().as_secs_f64()
        );
    }

    /// Execute `f` as a guest burst: the process is bound to the worker's
    /// active slot, the executing latch is held strictly around the entry,
    /// and the measured wall time is charged to the host CPU and tracker.
    fn run_guest(&self, host: &Host, f: impl FnOnce()) -> Duration {
        let _active = Worker::set_active_process(&self.arc());

        let timer = PerfTimer::new();
        self.is_executing.store(true, Ordering::Relaxed);
        f();
        self.is_executing.store(false, Ordering::Relaxed);
        let elapsed = timer.elapsed();

        let delay = SimulationTime::try_from(elapsed).unwrap_or(SimulationTime::MAX);
        host.cpu_borrow_mut().add_delay(elapsed);
        host.tracker_borrow_mut().add_processing_time(delay);
        *self.total_run_time.borrow_mut() += elapsed;

        elapsed
    }

    fn log_return_code(&self, code: i32) {
        if self.did_log_return_code.swap(true, Ordering::Relaxed) {
            return;
        }

        let result = if code == 0 { "success" } else { "error" };
        let message = format!("main {result} code '{code}' for process '{}'", self.name);

        if code == 0 {
            info!("{message}");
        } else {
            warn!("{message}");
            Worker::increment_plugin_error_count();
        }
    }

    /// Create `{data}/{name}.stdout` and `.stderr` and keep them open for the
    /// life of the process; the descriptors become the guest's stdio. Failing
    /// to open either is fatal to the worker.
    fn open_stdio_files(&self, host: &Host) {
        let open = |stream: &str| -> File {
            let path = host.data_dir_path().join(format!("{}.{stream}", self.name));
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o644)
                .open(&path)
                .unwrap_or_else(|e| panic!("opening {}: {e}", path.display()))
        };

        self.stdout_file.borrow_mut().replace(open("stdout"));
        self.stderr_file.borrow_mut().replace(open("stderr"));
    }

    /// Arm a single-fire wait for whichever of `timeout` and `descriptor`
    /// fires first, resuming `thread` when it does. With both absent this is
    /// a no-op. Each installed listener owns a reference to the process and
    /// the waiter, so neither can be freed while a listener is attached.
    pub fn listen_for_status(
        &self,
        thread: &Arc<dyn Thread>,
        timeout: Option<&Arc<AtomicRefCell<TimerFd>>>,
        descriptor: Option<&Descriptor>,
        status: FileState,
    ) {
        self.magic.debug_check();

        if timeout.is_none() && descriptor.is_none() {
            return;
        }

        let waiter = Arc::new(StatusWaiter {
            _counter: ObjectCounter::new("StatusWaiter"),
            thread: Arc::clone(thread),
            timer: timeout.cloned(),
            timer_handle: AtomicRefCell::new(None),
            descriptor: descriptor.cloned(),
            descriptor_handle: AtomicRefCell::new(None),
            fired: AtomicBool::new(false),
        });

        if let Some(timerfd) = &waiter.timer {
            let process = self.arc();
            let waiter_ref = Arc::clone(&waiter);
            // the timer is readable when it expires
            let handle = timerfd.borrow_mut().add_listener(
                FileState::READABLE,
                StateListenerFilter::OffToOn,
                move |_state, _changed, cb_queue| {
                    process.notify_status_changed(&waiter_ref, cb_queue)
                },
            );
            waiter.timer_handle.borrow_mut().replace(handle);
        }

        if let Some(file) = &waiter.descriptor {
            let process = self.arc();
            let waiter_ref = Arc::clone(&waiter);
            let handle = file.add_listener(
                status,
                StateListenerFilter::OffToOn,
                move |_state, _changed, cb_queue| {
                    process.notify_status_changed(&waiter_ref, cb_queue)
                },
            );
            waiter.descriptor_handle.borrow_mut().replace(handle);
        }

        self.log_listening_state(&waiter, true);
    }

    /// One of the waiter's listeners fired: detach both listeners, then
    /// resume the guest. Detaching precedes the resumption so that a side
    /// effect of the resumed guest (closing the descriptor, rearming the
    /// timer) cannot re-enter this waiter.
    fn notify_status_changed(&self, waiter: &Arc<StatusWaiter>, _cb_queue: &mut CallbackQueue) {
        self.magic.debug_check();

        // both listeners may have been queued in the same callback batch
        // before either could detach the other; only the first one resumes
        if waiter.fired.swap(true, Ordering::Relaxed) {
            return;
        }

        self.log_listening_state(waiter, false);

        drop(waiter.timer_handle.borrow_mut().take());
        drop(waiter.descriptor_handle.borrow_mut().take());

        Worker::with_active_host(|host| self.continue_execution(host, Some(&waiter.thread)))
            .expect("status change delivered without an active host");
    }

    fn log_listening_state(&self, waiter: &StatusWaiter, started: bool) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }

        let mut message = format!(
            "process '{}' thread {} {} listening for ",
            self.name,
            waiter.thread.id(),
            if started { "started" } else { "stopped" }
        );

        if let Some(descriptor) = &waiter.descriptor {
            message.push_str(&format!(
                "status on descriptor {:#x}{}",
                descriptor.canonical_handle(),
                if waiter.timer.is_some() { " and " } else { "" }
            ));
        }
        if let Some(timerfd) = &waiter.timer {
            match timerfd.borrow().remaining_time() {
                Some(remaining) => message.push_str(&format!("a timeout of {remaining}")),
                None => message.push_str("an unarmed timeout"),
            }
        }

        trace!("{message}");
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // stop the guest if it is somehow still alive
        if let Some(thread) = self.main_thread.borrow_mut().take() {
            if thread.is_running() {
                thread.terminate();
            }
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("interpose_method", &self.interpose_method)
            .finish()
    }
}

/// A single-use composite wait: a timeout and/or a descriptor status change,
/// coupled to a one-shot resume of a guest thread. Created inside
/// [`Process::listen_for_status`] and dismantled by the first listener to
/// fire; a waiter is never reused.
struct StatusWaiter {
    _counter: ObjectCounter,
    thread: Arc<dyn Thread>,
    timer: Option<Arc<AtomicRefCell<TimerFd>>>,
    timer_handle: AtomicRefCell<Option<StateListenHandle>>,
    descriptor: Option<Descriptor>,
    descriptor_handle: AtomicRefCell<Option<StateListenHandle>>,
    fired: AtomicBool,
}
