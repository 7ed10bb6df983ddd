#![allow(dead_code)]

use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Output, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

pub fn myspin() -> &'static str {
    env!("CARGO_BIN_EXE_myspin")
}

pub fn mystop() -> &'static str {
    env!("CARGO_BIN_EXE_mystop")
}

pub fn myint() -> &'static str {
    env!("CARGO_BIN_EXE_myint")
}

/// The shell without a prompt, history or log noise.
pub fn shell(args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_psh"));
    cmd.arg("-p")
        .args(args)
        .env_remove("RUST_LOG")
        .env("PSH_HISTFILE", "")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Feeds `input` verbatim, closes stdin and collects everything.
pub fn run_raw(mut cmd: Command, input: &str) -> Output {
    let mut child = cmd.spawn().expect("spawn psh");
    {
        let mut stdin = child.stdin.take().expect("stdin");
        stdin.write_all(input.as_bytes()).expect("write input");
    }
    child.wait_with_output().expect("wait output")
}

/// Runs each line in turn; end of input shuts the shell down.
pub fn run_lines(args: &[&str], lines: &[&str]) -> Output {
    let mut input = String::new();
    for line in lines {
        input.push_str(line);
        input.push('\n');
    }
    run_raw(shell(args), &input)
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Pulls the pid out of a `[<pid>] ...` status line.
pub fn pid_of(line: &str) -> i32 {
    let start = line.find('[').expect("status line") + 1;
    let end = line[start..].find(']').expect("status line") + start;
    line[start..end].parse().expect("pid")
}

/// An interactive shell driven line by line.
pub struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    seen: Vec<String>,
}

impl Session {
    pub fn start(args: &[&str]) -> Session {
        let mut child = shell(args).spawn().expect("spawn psh");
        let stdout = child.stdout.take().expect("stdout");
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        let stdin = child.stdin.take();
        Session {
            child,
            stdin,
            lines,
            seen: Vec::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn send(&mut self, line: &str) {
        let stdin = self.stdin.as_mut().expect("stdin open");
        writeln!(stdin, "{}", line).expect("write line");
        stdin.flush().expect("flush");
    }

    /// Waits for a stdout line containing `needle` and returns it.
    pub fn expect(&mut self, needle: &str, within: Duration) -> String {
        let deadline = Instant::now() + within;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(left) {
                Ok(line) => {
                    self.seen.push(line.clone());
                    if line.contains(needle) {
                        return line;
                    }
                }
                Err(_) => panic!("no line containing {:?}; saw {:#?}", needle, self.seen),
            }
        }
    }

    /// Closes stdin and waits for the shell to exit.
    pub fn finish(mut self) -> ExitStatus {
        drop(self.stdin.take());
        self.child.wait().expect("wait psh")
    }
}
