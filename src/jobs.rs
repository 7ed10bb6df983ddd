use crate::context::ShellContext;
use crate::error::ShellError;
use crate::reaper::{ReapEvent, Report};
use crate::utils::syscall;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{getpgid, tcsetpgrp, Pid};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Whether the shell waits for a job or returns to the prompt at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Foreground,
    Background,
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchMode::Foreground => write!(f, "foreground"),
            LaunchMode::Background => write!(f, "background"),
        }
    }
}

/// Represents the state of a live child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
}

/// A spawned process the shell has not reaped yet.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub pgid: Pid,
    pub mode: LaunchMode,
    /// Set for foreground processes, used for run time reports.
    pub started: Option<Instant>,
    pub state: JobState,
}

/// One spawned pipeline: every stage shares the first stage's process group.
#[derive(Debug, Clone)]
pub struct Job {
    pub pgid: Pid,
    /// Stage pids in pipeline order.
    pub pids: Vec<Pid>,
    pub mode: LaunchMode,
    pub started: Instant,
    /// Reconstructed text of each stage.
    pub commands: Vec<String>,
}

impl Job {
    pub fn last_pid(&self) -> Pid {
        self.pids[self.pids.len() - 1]
    }
}

/// Live children keyed by process ID.
#[derive(Debug, Default)]
pub struct ProcessTable {
    records: HashMap<Pid, ProcessRecord>,
}

/// The process table as shared between the main loop and the signal
/// listener.
pub type SharedTable = Arc<Mutex<ProcessTable>>;

/// Locks the table, carrying on past a holder that panicked.
pub fn lock_table(table: &SharedTable) -> MutexGuard<'_, ProcessTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable::default()
    }

    pub fn shared() -> SharedTable {
        Arc::new(Mutex::new(ProcessTable::new()))
    }

    /// Adds every stage of a freshly spawned job.
    pub fn insert_job(&mut self, job: &Job) {
        let started = match job.mode {
            LaunchMode::Foreground => Some(job.started),
            LaunchMode::Background => None,
        };
        for &pid in &job.pids {
            self.records.insert(
                pid,
                ProcessRecord {
                    pid,
                    pgid: job.pgid,
                    mode: job.mode,
                    started,
                    state: JobState::Running,
                },
            );
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.records.get(&pid)
    }

    /// Pids launched in the background and not brought to the foreground
    /// since.
    pub fn background_pids(&self) -> Vec<Pid> {
        self.records
            .values()
            .filter(|r| r.mode == LaunchMode::Background)
            .map(|r| r.pid)
            .collect()
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ProcessRecord> {
        self.records.remove(&pid)
    }

    pub fn mark_stopped(&mut self, pid: Pid) {
        if let Some(record) = self.records.get_mut(&pid) {
            record.state = JobState::Stopped;
        }
    }

    /// Marks a resumed process as a running foreground process.
    pub fn mark_running(&mut self, pid: Pid) {
        if let Some(record) = self.records.get_mut(&pid) {
            record.state = JobState::Running;
            record.mode = LaunchMode::Foreground;
        }
    }

    /// Updates the table for one observed state change and returns the
    /// record as it was before.
    pub fn apply(&mut self, report: &Report) -> Option<ProcessRecord> {
        match report.event {
            ReapEvent::Exited(_) | ReapEvent::Signaled(_) => self.remove(report.pid),
            ReapEvent::Stopped(_) => {
                let before = self.get(report.pid).cloned();
                self.mark_stopped(report.pid);
                before
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Gives the terminal to a process group for as long as it lives.
///
/// Dropping the guard hands the terminal back to the shell, so the shell
/// reclaims it however the wait ended: exit, signal or stop.
pub struct TerminalHandoff<'a> {
    ctx: &'a ShellContext,
}

impl<'a> TerminalHandoff<'a> {
    pub fn acquire(ctx: &'a ShellContext, pgid: Pid) -> Self {
        if let Some(fd) = ctx.terminal {
            if let Err(e) = syscall(|| tcsetpgrp(fd, pgid)) {
                tracing::warn!("tcsetpgrp({}) failed: {}", pgid, e);
            }
        }
        ctx.set_foreground(Some(pgid));
        TerminalHandoff { ctx }
    }
}

impl Drop for TerminalHandoff<'_> {
    fn drop(&mut self) {
        self.ctx.set_foreground(None);
        if let Some(fd) = self.ctx.terminal {
            if let Err(e) = syscall(|| tcsetpgrp(fd, self.ctx.pid)) {
                tracing::warn!("could not reclaim the terminal: {}", e);
            }
        }
    }
}

/// Result of blocking on a foreground job.
#[derive(Debug)]
pub struct Foreground {
    /// Every transition observed during the wait, in order.
    pub reports: Vec<Report>,
    /// How the job ended: the last stage's exit or signal, or the stop.
    pub outcome: Option<ReapEvent>,
    pub elapsed: Option<Duration>,
}

impl Foreground {
    pub fn failed(&self) -> bool {
        matches!(self.outcome, Some(ReapEvent::Exited(code)) if code != 0)
    }
}

/// Owns the terminal discipline and the table of live children.
pub struct JobController {
    ctx: ShellContext,
    table: SharedTable,
}

impl JobController {
    pub fn new(ctx: ShellContext, table: SharedTable) -> Self {
        JobController { ctx, table }
    }

    pub fn ctx(&self) -> &ShellContext {
        &self.ctx
    }

    pub fn table(&self) -> MutexGuard<'_, ProcessTable> {
        lock_table(&self.table)
    }

    pub fn register(&mut self, job: &Job) {
        self.table().insert_job(job);
    }

    /// Blocks until every stage of `job` has finished or one of them stops.
    pub fn wait_foreground(&mut self, job: &Job) -> Foreground {
        let group = Pid::from_raw(-job.pgid.as_raw());
        let mut remaining = job.pids.clone();
        let mut reports = Vec::new();
        let mut outcome = None;

        {
            let _handoff = TerminalHandoff::acquire(&self.ctx, job.pgid);
            while !remaining.is_empty() {
                let report = match syscall(|| waitpid(group, Some(WaitPidFlag::WUNTRACED))) {
                    Ok(status) => match Report::from_status(status) {
                        Some(report) => report,
                        None => continue,
                    },
                    Err(Errno::ECHILD) => break,
                    Err(e) => {
                        tracing::warn!("waiting for job {} failed: {}", job.pgid, e);
                        break;
                    }
                };
                self.table().apply(&report);
                remaining.retain(|&pid| pid != report.pid);
                reports.push(report);

                if let ReapEvent::Stopped(_) = report.event {
                    outcome = Some(report.event);
                    break;
                }
                if report.pid == job.last_pid() {
                    outcome = Some(report.event);
                }
            }
        }

        Foreground {
            reports,
            outcome,
            elapsed: Some(job.started.elapsed()),
        }
    }

    /// Continues a stopped or background child and waits for it in the
    /// foreground.
    pub fn resume(&mut self, pid: Pid) -> Result<Foreground, ShellError> {
        if !is_child(self.ctx.pid, pid) {
            return Err(ShellError::NotAChild(pid));
        }
        // Marking the process as foreground keeps the signal listener
        // from reaping it underneath the wait below.
        let pgid = {
            let mut table = self.table();
            let pgid = match table.get(pid) {
                Some(record) => {
                    tracing::debug!(
                        "resuming {} ({:?}, {})",
                        record.pid,
                        record.state,
                        record.mode
                    );
                    record.pgid
                }
                None => getpgid(Some(pid)).unwrap_or(pid),
            };
            table.mark_running(pid);
            pgid
        };
        let mut reports = Vec::new();
        let mut outcome = None;

        {
            let _handoff = TerminalHandoff::acquire(&self.ctx, pgid);
            if let Err(e) = killpg(pgid, Signal::SIGCONT) {
                tracing::warn!("SIGCONT to group {} failed: {}", pgid, e);
                if let Err(e) = kill(pid, Signal::SIGCONT) {
                    tracing::warn!("SIGCONT to {} failed: {}", pid, e);
                }
            }
            loop {
                match syscall(|| waitpid(pid, Some(WaitPidFlag::WUNTRACED))) {
                    Ok(status) => {
                        if let Some(report) = Report::from_status(status) {
                            self.table().apply(&report);
                            reports.push(report);
                            outcome = Some(report.event);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("waiting for {} failed: {}", pid, e);
                        break;
                    }
                }
            }
        }

        Ok(Foreground {
            reports,
            outcome,
            elapsed: None,
        })
    }
}

/// Extracts the parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_ppid(stat: &str) -> Option<Pid> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok().map(Pid::from_raw)
}

fn parent_of(pid: Pid) -> Option<Pid> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_ppid(&stat)
}

/// True if `pid` is a live (or unreaped) child of the shell.
pub fn is_child(shell: Pid, pid: Pid) -> bool {
    pid.as_raw() > 0 && parent_of(pid) == Some(shell)
}

/// All processes whose parent is the shell.
pub fn children_of(shell: Pid) -> Vec<Pid> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("cannot read /proc: {}", e);
            return Vec::new();
        }
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .filter(|&pid| parent_of(pid) == Some(shell))
        .collect()
}

/// Kills every child of the shell and gives the kills time to land.
/// Returns how many children were signalled.
pub fn terminate_all(ctx: &ShellContext) -> usize {
    let children = children_of(ctx.pid);
    for &pid in &children {
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            tracing::warn!("kill({}) failed: {}", pid, e);
        }
    }
    thread::sleep(Duration::from_millis(100));
    children.len()
}
