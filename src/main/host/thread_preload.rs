//! The preload interposition variant: the guest is launched with an injected
//! shared library that redirects libc entry points back into the simulator.
//! The supervisor and the shim share a pair of pipes and speak a one-byte
//! protocol: the supervisor writes [`CONTROL_CONTINUE`] to let the guest run,
//! and the shim answers [`EVENT_YIELD`] when the guest reaches a blocking
//! call, or [`EVENT_EXIT`] followed by a little-endian i32 exit code.

use std::ffi::{CString, OsString};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use atomic_refcell::AtomicRefCell;
use log::{debug, trace, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, fork, ForkResult, Pid};

use crate::host::thread::{Thread, ThreadId};
use crate::utility::ObjectCounter;

/// Environment variable naming the shim library to inject.
pub const SHIM_PATH_ENV: &str = "UMBRA_SHIM";
const DEFAULT_SHIM_SONAME: &str = "libumbra_shim.so";

const CONTROL_FD_ENV: &str = "UMBRA_SHIM_CONTROL_FD";
const EVENT_FD_ENV: &str = "UMBRA_SHIM_EVENT_FD";

const CONTROL_CONTINUE: u8 = b'C';
const EVENT_YIELD: u8 = b'Y';
const EVENT_EXIT: u8 = b'X';

pub struct PreloadThread {
    id: ThreadId,
    exe_path: PathBuf,
    _counter: ObjectCounter,
    state: AtomicRefCell<ShimChannelState>,
}

struct ShimChannelState {
    child: Option<Pid>,
    /// Writing end of the control pipe; the shim blocks reading it.
    control: Option<File>,
    /// Reading end of the event pipe; the shim reports yields and exits.
    events: Option<File>,
    running: bool,
    return_code: Option<i32>,
}

impl ShimChannelState {
    fn send_continue(&mut self) -> std::io::Result<()> {
        self.control
            .as_mut()
            .expect("control channel must exist while the guest runs")
            .write_all(&[CONTROL_CONTINUE])
    }

    /// Block until the shim reports the next yield or exit.
    fn wait_for_guest_event(&mut self) {
        let mut buf = [0u8; 1];
        let events = self
            .events
            .as_mut()
            .expect("event channel must exist while the guest runs");

        match events.read_exact(&mut buf) {
            Ok(()) if buf[0] == EVENT_YIELD => {
                trace!("guest yielded at a blocking call");
            }
            Ok(()) if buf[0] == EVENT_EXIT => {
                let mut code = [0u8; 4];
                let code = match events.read_exact(&mut code) {
                    Ok(()) => i32::from_le_bytes(code),
                    Err(e) => {
                        warn!("truncated exit message from shim: {e}");
                        libc::EXIT_FAILURE
                    }
                };
                trace!("guest reported exit with code {code}");
                self.running = false;
                self.return_code = Some(code);
                self.reap();
                self.close_channels();
            }
            Ok(()) => {
                panic!("unexpected shim event byte {:#x}", buf[0]);
            }
            Err(e) => {
                // the shim side closed without an exit message; the child
                // died and waitpid has the real status
                trace!("shim channel closed: {e}");
                self.running = false;
                self.harvest_exit_status();
                self.close_channels();
            }
        }
    }

    fn harvest_exit_status(&mut self) {
        let Some(child) = self.child.take() else {
            self.return_code.get_or_insert(-(Signal::SIGKILL as i32));
            return;
        };
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.return_code = Some(code);
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                self.return_code = Some(-(signal as i32));
            }
            other => {
                warn!("reaping guest pid {child}: {other:?}");
                self.return_code.get_or_insert(-(Signal::SIGKILL as i32));
            }
        }
    }

    /// Reap a child that already announced its exit through the protocol.
    fn reap(&mut self) {
        if let Some(child) = self.child.take() {
            if let Err(e) = waitpid(child, None) {
                warn!("reaping guest pid {child}: {e}");
            }
        }
    }

    fn close_channels(&mut self) {
        self.control = None;
        self.events = None;
    }
}

impl PreloadThread {
    pub fn new(id: ThreadId, exe_path: &Path) -> Self {
        Self {
            id,
            exe_path: exe_path.to_path_buf(),
            _counter: ObjectCounter::new("PreloadThread"),
            state: AtomicRefCell::new(ShimChannelState {
                child: None,
                control: None,
                events: None,
                running: false,
                return_code: None,
            }),
        }
    }

    fn shim_path() -> OsString {
        std::env::var_os(SHIM_PATH_ENV).unwrap_or_else(|| DEFAULT_SHIM_SONAME.into())
    }

    /// The variables the shim needs, appended after the configured guest
    /// environment so they cannot be overridden by it.
    fn shim_environment(control_fd: RawFd, event_fd: RawFd) -> Vec<CString> {
        let shim = Self::shim_path();
        vec![
            CString::new([&b"LD_PRELOAD="[..], shim.as_bytes()].concat()).unwrap(),
            CString::new(format!("{CONTROL_FD_ENV}={control_fd}")).unwrap(),
            CString::new(format!("{EVENT_FD_ENV}={event_fd}")).unwrap(),
        ]
    }
}

impl Thread for PreloadThread {
    fn run(&self, argv: &[CString], envv: &[CString], stdout_fd: RawFd, stderr_fd: RawFd) {
        let path = CString::new(self.exe_path.as_os_str().as_bytes()).unwrap();

        // control flows supervisor -> shim, events flow shim -> supervisor
        let (control_rx, control_tx) =
            nix::unistd::pipe().unwrap_or_else(|e| panic!("creating control pipe: {e}"));
        let (event_rx, event_tx) =
            nix::unistd::pipe().unwrap_or_else(|e| panic!("creating event pipe: {e}"));

        let mut envv = envv.to_vec();
        envv.extend(Self::shim_environment(control_rx, event_tx));

        debug!(
            "forking guest '{}' with preload shim '{}'",
            self.exe_path.display(),
            Self::shim_path().to_string_lossy()
        );

        match unsafe { fork() }.unwrap_or_else(|e| panic!("forking guest process: {e}")) {
            ForkResult::Child => {
                // only async-signal-safe calls are allowed before exec
                let _ = nix::unistd::close(control_tx);
                let _ = nix::unistd::close(event_rx);
                let _ = dup2(stdout_fd, libc::STDOUT_FILENO);
                let _ = dup2(stderr_fd, libc::STDERR_FILENO);
                let _ = nix::unistd::execve(&path, argv, &envv);
                unsafe { libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                let _ = nix::unistd::close(control_rx);
                let _ = nix::unistd::close(event_tx);

                let mut state = self.state.borrow_mut();
                state.child = Some(child);
                state.control = Some(unsafe { File::from_raw_fd(control_tx) });
                state.events = Some(unsafe { File::from_raw_fd(event_rx) });
                state.running = true;

                trace!("thread {} started guest pid {child}", self.id);

                // run the guest to its first blocking point or exit
                if let Err(e) = state.send_continue() {
                    warn!("starting guest pid {child}: {e}");
                    state.running = false;
                    state.harvest_exit_status();
                    state.close_channels();
                    return;
                }
                state.wait_for_guest_event();
            }
        }
    }

    fn resume(&self) {
        let mut state = self.state.borrow_mut();
        if !state.running {
            return;
        }
        if let Err(e) = state.send_continue() {
            trace!("guest is gone: {e}");
            state.running = false;
            state.harvest_exit_status();
            state.close_channels();
            return;
        }
        state.wait_for_guest_event();
    }

    fn terminate(&self) {
        let mut state = self.state.borrow_mut();
        if !state.running {
            return;
        }
        if let Some(child) = state.child {
            debug!("killing guest pid {child}");
            if let Err(e) = signal::kill(child, Signal::SIGKILL) {
                warn!("killing guest pid {child}: {e}");
            }
        }
        state.running = false;
        state.harvest_exit_status();
        state.close_channels();
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

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_channels() -> (ShimChannelState, File, File) {
        let (control_rx, control_tx) = nix::unistd::pipe().unwrap();
        let (event_rx, event_tx) = nix::unistd::pipe().unwrap();
        let state = ShimChannelState {
            child: None,
            control: Some(unsafe { File::from_raw_fd(control_tx) }),
            events: Some(unsafe { File::from_raw_fd(event_rx) }),
            running: true,
            return_code: None,
        };
        let shim_control = unsafe { File::from_raw_fd(control_rx) };
        let shim_events = unsafe { File::from_raw_fd(event_tx) };
        (state, shim_control, shim_events)
    }

    #[test]
    fn test_yield_keeps_running() {
        let (mut state, mut shim_control, mut shim_events) = fake_channels();

        shim_events.write_all(&[EVENT_YIELD]).unwrap();
        state.send_continue().unwrap();
        state.wait_for_guest_event();

        assert!(state.running);
        assert_eq!(state.return_code, None);

        // the shim side observes our continue byte
        let mut buf = [0u8; 1];
        shim_control.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], CONTROL_CONTINUE);
    }

    #[test]
    fn test_exit_message_carries_code() {
        let (mut state, _shim_control, mut shim_events) = fake_channels();

        shim_events.write_all(&[EVENT_EXIT]).unwrap();
        shim_events.write_all(&7i32.to_le_bytes()).unwrap();
        state.wait_for_guest_event();

        assert!(!state.running);
        assert_eq!(state.return_code, Some(7));
        assert!(state.control.is_none() && state.events.is_none());
    }

    #[test]
    fn test_closed_channel_means_death() {
        let (mut state, _shim_control, shim_events) = fake_channels();
        drop(shim_events);

        state.wait_for_guest_event();
        assert!(!state.running);
        // no child to reap in this harness, so the sentinel code is used
        assert_eq!(state.return_code, Some(-(Signal::SIGKILL as i32)));
    }

    #[test]
    fn test_shim_environment_shape() {
        let envv = PreloadThread::shim_environment(3, 4);
        let rendered: Vec<_> = envv
            .iter()
            .map(|s| s.to_str().unwrap().to_string())
            .collect();
        assert!(rendered[0].starts_with("LD_PRELOAD="));
        assert!(rendered.contains(&format!("{CONTROL_FD_ENV}=3")));
        assert!(rendered.contains(&format!("{EVENT_FD_ENV}=4")));
    }

    // A guest that never loads the shim runs to completion and is harvested
    // through the channel-EOF path. Ignored for builders that forbid fork.
    #[test]
    #[ignore]
    fn test_runs_true_to_completion() {
        use std::os::unix::io::AsRawFd;

        let stdout = tempfile::tempfile().unwrap();
        let stderr = tempfile::tempfile().unwrap();

        let thread = PreloadThread::new(ThreadId(0), Path::new("/bin/true"));
        thread.run(
            &[CString::new("/bin/true").unwrap()],
            &[],
            stdout.as_raw_fd(),
            stderr.as_raw_fd(),
        );

        assert!(!thread.is_running());
        assert_eq!(thread.return_code(), Some(0));
    }
}
