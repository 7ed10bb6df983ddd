//! The shell on a pseudo-terminal: who owns the terminal as jobs start,
//! stop and resume, and what shows up at an idle prompt.

mod common;

use common::{myspin, mystop, pid_of};
use nix::libc;
use nix::pty::openpty;
use nix::unistd::{close, dup, setsid, tcgetpgrp, write, Pid};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

/// psh as the session leader of a fresh pty, the way a terminal emulator
/// starts a login shell.
struct Tty {
    child: Child,
    master: RawFd,
    lines: Receiver<String>,
    seen: Vec<String>,
}

fn slave_stdio(slave: RawFd) -> Stdio {
    let fd = dup(slave).expect("dup slave");
    unsafe { Stdio::from_raw_fd(fd) }
}

impl Tty {
    fn start() -> Tty {
        let pty = openpty(None, None).expect("openpty");
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_psh"));
        cmd.arg("-p")
            .env_remove("RUST_LOG")
            .env("PSH_HISTFILE", "")
            // Plain line reads; no cursor queries from the editor.
            .env("TERM", "dumb")
            .stdin(slave_stdio(pty.slave))
            .stdout(slave_stdio(pty.slave))
            .stderr(slave_stdio(pty.slave));
        unsafe {
            cmd.pre_exec(|| {
                setsid()?;
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn().expect("spawn psh");
        close(pty.slave).expect("close slave");

        let reader = unsafe { File::from_raw_fd(dup(pty.master).expect("dup master")) };
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(reader).lines() {
                // EIO once the last slave descriptor is gone.
                let Ok(line) = line else { break };
                if tx.send(line.trim_end_matches('\r').to_string()).is_err() {
                    break;
                }
            }
        });

        Tty {
            child,
            master: pty.master,
            lines,
            seen: Vec::new(),
        }
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    fn send(&self, line: &str) {
        let data = format!("{}\n", line);
        let mut written = 0;
        while written < data.len() {
            written += write(self.master, &data.as_bytes()[written..]).expect("write pty");
        }
    }

    /// Waits for a line matching `wanted`. The terminal echoes input, so
    /// callers match whole output lines rather than substrings.
    fn expect(&mut self, wanted: impl Fn(&str) -> bool, within: Duration) -> String {
        let deadline = Instant::now() + within;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(left) {
                Ok(line) => {
                    self.seen.push(line.clone());
                    if wanted(&line) {
                        return line;
                    }
                }
                Err(_) => panic!("no matching line; saw {:#?}", self.seen),
            }
        }
    }

    fn expect_line(&mut self, exact: &str) {
        self.expect(|l| l.trim() == exact, WAIT);
    }

    fn expect_prefix(&mut self, prefix: &str) -> String {
        self.expect(|l| l.starts_with(prefix), WAIT)
    }

    fn owner(&self) -> Pid {
        tcgetpgrp(self.master).expect("tcgetpgrp")
    }

    /// Waits until `pgid` is the terminal's foreground group.
    fn assert_owner(&self, pgid: Pid) {
        let deadline = Instant::now() + WAIT;
        while self.owner() != pgid && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(self.owner(), pgid, "saw {:#?}", self.seen);
    }

    fn exit(mut self) {
        self.send("exit");
        let status = self.child.wait().expect("wait psh");
        assert!(status.success(), "saw {:#?}", self.seen);
        let _ = close(self.master);
    }
}

#[test]
fn terminal_follows_the_foreground_job() {
    let mut tty = Tty::start();
    tty.send("echo ready");
    tty.expect_line("ready");
    assert_eq!(tty.owner(), tty.pid());

    tty.send(&format!("{} 1", myspin()));
    let spawned = tty.expect(|l| l.ends_with("Spawned in foreground"), WAIT);
    tty.assert_owner(Pid::from_raw(pid_of(&spawned)));
    tty.expect_prefix("Run time was");
    assert_eq!(tty.owner(), tty.pid());

    tty.exit();
}

#[test]
fn terminal_returns_to_the_shell_after_stop_and_fg() {
    let mut tty = Tty::start();
    tty.send(&format!("{} 0", mystop()));
    let spawned = tty.expect(|l| l.ends_with("Spawned in foreground"), WAIT);
    let pid = pid_of(&spawned);
    tty.expect_line(&format!("[{}] Stopped", pid));
    assert_eq!(tty.owner(), tty.pid());

    tty.send(&format!("fg {}", pid));
    tty.expect_line(&format!("[{}] Terminated normally", pid));
    assert_eq!(tty.owner(), tty.pid());

    tty.send("echo still-here");
    tty.expect_line("still-here");
    tty.exit();
}

#[test]
fn background_exit_is_reported_at_an_idle_prompt() {
    let mut tty = Tty::start();
    tty.send(&format!("{} 0.2 &", myspin()));
    let spawned = tty.expect(|l| l.ends_with("Spawned in background"), WAIT);
    let pid = pid_of(&spawned);
    tty.expect_line(&format!("[{}] Terminated normally", pid));
    assert_eq!(tty.owner(), tty.pid());
    tty.exit();
}
