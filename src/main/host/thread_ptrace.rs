//! The ptrace interposition variant: a supervisor that traces the guest and
//! steps it from syscall stop to syscall stop. When the guest enters a
//! syscall from the interposed-blocking set it is left parked at the entry
//! stop and control returns to the owning process; the syscall-emulation
//! layer rewrites arguments and return values while the guest is parked.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use atomic_refcell::AtomicRefCell;
use log::{debug, trace, warn};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, fork, ForkResult, Pid};

use crate::host::thread::{Thread, ThreadId};
use crate::utility::ObjectCounter;

pub struct PtraceThread {
    id: ThreadId,
    exe_path: PathBuf,
    _counter: ObjectCounter,
    state: AtomicRefCell<SupervisorState>,
}

struct SupervisorState {
    child: Option<Pid>,
    // toggled at each syscall stop; true while the child sits at an entry
    in_syscall: bool,
    // a non-trap signal observed while stepping, re-injected on continue
    pending_signal: Option<Signal>,
    running: bool,
    return_code: Option<i32>,
}

/// Syscalls that block on simulated time or I/O. The guest is parked at the
/// entry of any of these; everything else runs natively.
#[cfg(target_arch = "x86_64")]
const INTERPOSED_BLOCKING_SYSCALLS: [i64; 10] = [
    libc::SYS_nanosleep,
    libc::SYS_clock_nanosleep,
    libc::SYS_poll,
    libc::SYS_ppoll,
    libc::SYS_select,
    libc::SYS_pselect6,
    libc::SYS_epoll_wait,
    libc::SYS_epoll_pwait,
    libc::SYS_pause,
    libc::SYS_wait4,
];

#[cfg(target_arch = "x86_64")]
fn interposed_syscall_number(child: Pid) -> Option<i64> {
    // at an entry stop orig_rax holds the syscall number
    let regs = ptrace::getregs(child).ok()?;
    let sysno = regs.orig_rax as i64;
    INTERPOSED_BLOCKING_SYSCALLS.contains(&sysno).then_some(sysno)
}

/// Register access is only wired up for x86_64; elsewhere nothing is
/// interposed and guests run to completion.
#[cfg(not(target_arch = "x86_64"))]
fn interposed_syscall_number(_child: Pid) -> Option<i64> {
    None
}

impl PtraceThread {
    pub fn new(id: ThreadId, exe_path: &Path) -> Self {
        Self {
            id,
            exe_path: exe_path.to_path_buf(),
            _counter: ObjectCounter::new("PtraceThread"),
            state: AtomicRefCell::new(SupervisorState {
                child: None,
                in_syscall: false,
                pending_signal: None,
                running: false,
                return_code: None,
            }),
        }
    }

    /// Step the child until it exits or parks at an interposed syscall entry.
    fn advance(&self) {
        let mut state = self.state.borrow_mut();
        let Some(child) = state.child else { return };

        loop {
            let sig = state.pending_signal.take();
            if let Err(e) = ptrace::syscall(child, sig) {
                warn!("continuing guest pid {child}: {e}");
                state.running = false;
                state.return_code.get_or_insert(-(Signal::SIGKILL as i32));
                state.child = None;
                break;
            }

            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    trace!("guest pid {child} exited with code {code}");
                    state.running = false;
                    state.return_code = Some(code);
                    state.child = None;
                    break;
                }
                Ok(WaitStatus::Signaled(_, signal, _core_dumped)) => {
                    trace!("guest pid {child} killed by signal {signal}");
                    state.running = false;
                    state.return_code = Some(-(signal as i32));
                    state.child = None;
                    break;
                }
                Ok(WaitStatus::PtraceSyscall(_)) => {
                    state.in_syscall = !state.in_syscall;
                    if state.in_syscall {
                        if let Some(sysno) = interposed_syscall_number(child) {
                            trace!("thread {} parked at entry of syscall {sysno}", self.id);
                            break;
                        }
                    }
                }
                Ok(WaitStatus::Stopped(_, signal)) => {
                    state.pending_signal = Some(signal);
                }
                Ok(status) => {
                    trace!("unexpected wait status for guest pid {child}: {status:?}");
                }
                Err(e) => {
                    warn!("waiting for guest pid {child}: {e}");
                    state.running = false;
                    state.return_code.get_or_insert(-(Signal::SIGKILL as i32));
                    state.child = None;
                    break;
                }
            }
        }
    }
}

impl Thread for PtraceThread {
    fn run(&self, argv: &[CString], envv: &[CString], stdout_fd: RawFd, stderr_fd: RawFd) {
        let path = CString::new(self.exe_path.as_os_str().as_bytes()).unwrap();

        debug!(
            "forking guest '{}' under ptrace with arguments {argv:?}",
            self.exe_path.display()
        );

        match unsafe { fork() }.unwrap_or_else(|e| panic!("forking guest process: {e}")) {
            ForkResult::Child => {
                // only async-signal-safe calls are allowed before exec
                let _ = ptrace::traceme();
                let _ = dup2(stdout_fd, libc::STDOUT_FILENO);
                let _ = dup2(stderr_fd, libc::STDERR_FILENO);
                let _ = nix::unistd::execve(&path, argv, envv);
                unsafe { libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                {
                    let mut state = self.state.borrow_mut();
                    match waitpid(child, None) {
                        Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
                        Ok(WaitStatus::Exited(_, code)) => {
                            warn!("guest pid {child} exited with code {code} before exec");
                            state.running = false;
                            state.return_code = Some(code);
                            return;
                        }
                        other => panic!("guest pid {child} did not stop at exec: {other:?}"),
                    }

                    ptrace::setoptions(
                        child,
                        Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_EXITKILL,
                    )
                    .unwrap_or_else(|e| panic!("configuring ptrace for pid {child}: {e}"));

                    state.child = Some(child);
                    state.running = true;
                }
                self.advance();
            }
        }
    }

    fn resume(&self) {
        if !self.is_running() {
            return;
        }
        self.advance();
    }

    fn terminate(&self) {
        let mut state = self.state.borrow_mut();
        if !state.running {
            return;
        }
        let Some(child) = state.child.take() else {
            state.running = false;
            return;
        };

        debug!("killing guest pid {child}");
        if let Err(e) = signal::kill(child, Signal::SIGKILL) {
            warn!("killing guest pid {child}: {e}");
        }

        loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    state.return_code = Some(code);
                    break;
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    state.return_code = Some(-(signal as i32));
                    break;
                }
                Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::PtraceSyscall(_)) => {
                    // let the stopped child run into the pending SIGKILL
                    let _ = ptrace::cont(child, None);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("reaping guest pid {child}: {e}");
                    state.return_code.get_or_insert(-(Signal::SIGKILL as i32));
                    break;
                }
            }
        }
        state.running = false;
    }

    fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    fn return_code(&self) -> Option<i32> {
        self.state.borrow().return_code
    }

    fn id(&self) -> ThreadId {
        self.id
    }
}
