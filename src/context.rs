use crate::error::ShellError;
use crate::utils::syscall;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::{getpgrp, getpid, isatty, pipe2, setpgid, tcsetpgrp, write, Pid};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// A request from the signal listener for the read loop to shut the shell
/// down. Writing to the wake pipe unblocks a read waiting on stdin.
#[derive(Debug)]
struct Teardown {
    requested: AtomicBool,
    accepted: AtomicBool,
    wake_read: RawFd,
    wake_write: RawFd,
}

impl Teardown {
    fn new() -> nix::Result<Self> {
        let (wake_read, wake_write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Teardown {
            requested: AtomicBool::new(false),
            accepted: AtomicBool::new(false),
            wake_read,
            wake_write,
        })
    }
}

/// Process-wide identity of the shell.
///
/// Created once at startup and handed to everything that needs to know who
/// the shell is: the job controller, the reaper and the signal listener.
#[derive(Debug, Clone)]
pub struct ShellContext {
    /// The shell's pid, which is also its process group id.
    pub pid: Pid,
    /// The controlling terminal, when stdin is one.
    pub terminal: Option<RawFd>,
    /// Terminal modes as the shell found them.
    modes: Option<Termios>,
    foreground: Arc<AtomicI32>,
    teardown: Arc<Teardown>,
}

impl ShellContext {
    /// Makes the shell leader of its own process group and notes whether
    /// stdin is a terminal.
    pub fn init() -> Result<Self, ShellError> {
        let pid = getpid();
        if getpgrp() != pid {
            syscall(|| setpgid(pid, pid)).map_err(ShellError::ProcessGroup)?;
        }

        let terminal = match isatty(libc::STDIN_FILENO) {
            Ok(true) => Some(libc::STDIN_FILENO),
            _ => None,
        };

        let modes = terminal.and_then(|fd| tcgetattr(fd).ok());
        let teardown = Teardown::new().map_err(ShellError::Pipe)?;

        Ok(ShellContext {
            pid,
            terminal,
            modes,
            foreground: Arc::new(AtomicI32::new(0)),
            teardown: Arc::new(teardown),
        })
    }

    /// Makes the shell's group the terminal's foreground group. Needs
    /// SIGTTOU ignored when the shell starts out in the background.
    pub fn claim_terminal(&self) {
        if let Some(fd) = self.terminal {
            if let Err(e) = syscall(|| tcsetpgrp(fd, self.pid)) {
                tracing::warn!("could not take the terminal: {}", e);
            }
        }
    }

    /// Puts the terminal back the way the shell found it, for exits that
    /// bypass the line editor's own cleanup.
    pub fn restore_terminal(&self) {
        if let (Some(fd), Some(modes)) = (self.terminal, &self.modes) {
            if let Err(e) = tcsetattr(fd, SetArg::TCSANOW, modes) {
                tracing::debug!("could not restore terminal modes: {}", e);
            }
        }
    }

    /// A context for a shell without a terminal, used by tests.
    #[cfg(test)]
    pub fn detached() -> Self {
        ShellContext {
            pid: getpid(),
            terminal: None,
            modes: None,
            foreground: Arc::new(AtomicI32::new(0)),
            teardown: Arc::new(Teardown::new().unwrap()),
        }
    }

    /// Process group of the job the shell is currently blocked on.
    pub fn foreground(&self) -> Option<Pid> {
        match self.foreground.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub fn set_foreground(&self, pgid: Option<Pid>) {
        let raw = pgid.map_or(0, Pid::as_raw);
        self.foreground.store(raw, Ordering::SeqCst);
    }

    /// Asks the read loop to shut the shell down and wakes it if it is
    /// blocked on stdin.
    pub fn request_teardown(&self) {
        self.teardown.requested.store(true, Ordering::SeqCst);
        if let Err(e) = write(self.teardown.wake_write, b"!") {
            tracing::debug!("wake pipe write failed: {}", e);
        }
    }

    pub fn teardown_requested(&self) -> bool {
        self.teardown.requested.load(Ordering::SeqCst)
    }

    /// Called by the read loop once it has committed to shutting down.
    pub fn accept_teardown(&self) {
        self.teardown.accepted.store(true, Ordering::SeqCst);
    }

    pub fn teardown_accepted(&self) -> bool {
        self.teardown.accepted.load(Ordering::SeqCst)
    }

    /// Becomes readable once a teardown has been requested.
    pub fn wake_fd(&self) -> RawFd {
        self.teardown.wake_read
    }
}
