//! Collection of finished and stopped children.
//!
//! Two strategies share one operation, [`Reaper::drain`], which the main loop
//! runs between prompts and which never blocks. With SIGCHLD notification the
//! signal listener thread also reaps background children the moment they
//! change state, so their reports show up while the shell sits at the
//! prompt; the main loop only collects what the listener could not attribute
//! to a background job. With polling there is no handler at all and the main
//! loop checks on every pass.

use crate::config::{Config, ReapMode};
use crate::jobs::{lock_table, ProcessTable, SharedTable};
use crate::utils::syscall;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use rustyline::ExternalPrinter;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A state transition of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapEvent {
    Exited(i32),
    Signaled(Signal),
    Stopped(Signal),
}

/// One line of child status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub pid: Pid,
    pub event: ReapEvent,
}

impl Report {
    /// Translates a wait status; `None` for statuses that are not reported.
    pub fn from_status(status: WaitStatus) -> Option<Self> {
        let (pid, event) = match status {
            WaitStatus::Exited(pid, code) => (pid, ReapEvent::Exited(code)),
            WaitStatus::Signaled(pid, sig, _) => (pid, ReapEvent::Signaled(sig)),
            WaitStatus::Stopped(pid, sig) => (pid, ReapEvent::Stopped(sig)),
            _ => return None,
        };
        Some(Report { pid, event })
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.event {
            ReapEvent::Exited(0) => write!(f, "[{}] Terminated normally", self.pid),
            ReapEvent::Exited(code) => {
                write!(f, "[{}] Terminated normally (status {})", self.pid, code)
            }
            ReapEvent::Signaled(sig) => {
                write!(f, "[{}] Terminated by a signal ({})", self.pid, sig)
            }
            ReapEvent::Stopped(_) => write!(f, "[{}] Stopped", self.pid),
        }
    }
}

/// Collects pending child state changes without blocking.
pub trait Reaper {
    fn mode(&self) -> ReapMode;

    /// How long the main loop should pause before draining, if at all.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// The part of the reaper that runs on the signal listener thread.
    fn listener(&self) -> Option<SignalReaper> {
        None
    }

    /// Reaps every child with a pending state change and updates `table`.
    fn drain(&mut self, table: &mut ProcessTable) -> Vec<Report>;
}

fn reap_flags() -> WaitPidFlag {
    WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED
}

fn record(table: &mut ProcessTable, report: &Report) {
    match table.apply(report) {
        Some(record) => tracing::debug!(
            "{:?} for {} (group {}, {}, up {:?})",
            report.event,
            record.pid,
            record.pgid,
            record.mode,
            record.started.map(|s| s.elapsed())
        ),
        None => tracing::debug!("{:?} for untracked {}", report.event, report.pid),
    }
}

/// Waits on any child with `WNOHANG` until nothing is pending.
fn drain_pending(table: &mut ProcessTable) -> Vec<Report> {
    let mut reports = Vec::new();
    loop {
        match syscall(|| waitpid(Pid::from_raw(-1), Some(reap_flags()))) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(report) = Report::from_status(status) {
                    record(table, &report);
                    reports.push(report);
                }
            }
            Err(Errno::ECHILD) => break,
            Err(e) => {
                tracing::warn!("waitpid failed: {}", e);
                break;
            }
        }
    }
    reports
}

/// Waits, without blocking, on each child the table records as running in
/// the background. Foreground children are left alone: their status
/// belongs to the main loop's foreground wait.
pub fn reap_background(table: &mut ProcessTable) -> Vec<Report> {
    let mut reports = Vec::new();
    for pid in table.background_pids() {
        match syscall(|| waitpid(pid, Some(reap_flags()))) {
            Ok(status) => {
                if let Some(report) = Report::from_status(status) {
                    record(table, &report);
                    reports.push(report);
                }
            }
            Err(Errno::ECHILD) => {
                table.remove(pid);
            }
            Err(e) => tracing::warn!("waitpid({}) failed: {}", pid, e),
        }
    }
    reports
}

type EditorPrinter = Option<Box<dyn ExternalPrinter + Send>>;

/// Prints status lines from outside the main loop. Once the line editor
/// is running, lines go through it so the prompt is redrawn below them.
#[derive(Clone, Default)]
pub struct StatusPrinter {
    editor: Arc<Mutex<EditorPrinter>>,
}

impl StatusPrinter {
    pub fn attach(&self, printer: Box<dyn ExternalPrinter + Send>) {
        *self.lock().0 = Some(printer);
    }

    /// Exclusive access to the output. Locking and dropping it waits for
    /// lines another thread is printing.
    pub fn lock(&self) -> StatusLines<'_> {
        StatusLines(self.editor.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

pub struct StatusLines<'a>(MutexGuard<'a, EditorPrinter>);

impl StatusLines<'_> {
    pub fn print(&mut self, report: &Report) {
        let line = format!("{}\n", report);
        if let Some(printer) = self.0.as_mut() {
            match printer.print(line.clone()) {
                Ok(()) => return,
                Err(e) => tracing::warn!("line editor refused a status line: {}", e),
            }
        }
        let mut out = io::stdout().lock();
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

/// Reaps on SIGCHLD. The listener thread calls [`SignalReaper::on_sigchld`];
/// the main loop's drain only runs after a SIGCHLD has been seen.
#[derive(Clone)]
pub struct SignalReaper {
    pending: Arc<AtomicBool>,
    table: SharedTable,
    printer: StatusPrinter,
}

impl SignalReaper {
    pub fn new(table: SharedTable, printer: StatusPrinter) -> Self {
        SignalReaper {
            pending: Arc::new(AtomicBool::new(false)),
            table,
            printer,
        }
    }

    /// Reaps and reports background children right away, and leaves a
    /// note for the main loop about anything else.
    pub fn on_sigchld(&self) {
        self.pending.store(true, Ordering::SeqCst);
        let mut table = lock_table(&self.table);
        let reports = reap_background(&mut table);
        if reports.is_empty() {
            return;
        }
        // The output is taken before the table is let go, so whoever sees
        // the table without these children also waits for their lines.
        let mut out = self.printer.lock();
        drop(table);
        for report in &reports {
            out.print(report);
        }
    }
}

impl Reaper for SignalReaper {
    fn mode(&self) -> ReapMode {
        ReapMode::Signal
    }

    fn listener(&self) -> Option<SignalReaper> {
        Some(self.clone())
    }

    fn drain(&mut self, table: &mut ProcessTable) -> Vec<Report> {
        if self.pending.swap(false, Ordering::SeqCst) {
            drain_pending(table)
        } else {
            Vec::new()
        }
    }
}

/// Reaps on every call.
pub struct PollingReaper {
    interval: Duration,
}

impl PollingReaper {
    pub fn new(interval: Duration) -> Self {
        PollingReaper { interval }
    }
}

impl Reaper for PollingReaper {
    fn mode(&self) -> ReapMode {
        ReapMode::Poll
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn drain(&mut self, table: &mut ProcessTable) -> Vec<Report> {
        drain_pending(table)
    }
}

/// Builds the strategy chosen at startup.
pub fn from_config(
    config: &Config,
    table: &SharedTable,
    printer: &StatusPrinter,
) -> Box<dyn Reaper> {
    match config.reap_mode {
        ReapMode::Signal => Box::new(SignalReaper::new(Arc::clone(table), printer.clone())),
        ReapMode::Poll => Box::new(PollingReaper::new(config.poll_interval)),
    }
}
