use crate::context::ShellContext;
use crate::error::ShellError;
use crate::exec::spawn_stage;
use crate::jobs::{Job, LaunchMode};
use crate::parser::reconstruct;
use nix::fcntl::OFlag;
use nix::unistd::{close, pipe2, Pid};
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Where a stage sits in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePosition {
    /// The only stage: no pipes at all.
    Only,
    First,
    Middle,
    Last,
}

impl StagePosition {
    /// Position of the stage at 0-based `index` out of `count`.
    pub fn of(index: usize, count: usize) -> Self {
        match (index, count) {
            (_, 1) => StagePosition::Only,
            (0, _) => StagePosition::First,
            (i, n) if i + 1 == n => StagePosition::Last,
            _ => StagePosition::Middle,
        }
    }
}

/// One command of a pipeline.
#[derive(Debug, Clone)]
pub struct Stage {
    /// 0-based position in the pipeline.
    pub index: usize,
    pub count: usize,
    pub argv: Vec<String>,
}

impl Stage {
    /// 1-based number used in reports.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    pub fn position(&self) -> StagePosition {
        StagePosition::of(self.index, self.count)
    }

    /// Index of the pipe this stage reads from.
    pub fn input_pipe(&self) -> Option<usize> {
        match self.position() {
            StagePosition::Middle | StagePosition::Last => Some(self.index - 1),
            StagePosition::Only | StagePosition::First => None,
        }
    }

    /// Index of the pipe this stage writes to.
    pub fn output_pipe(&self) -> Option<usize> {
        match self.position() {
            StagePosition::First | StagePosition::Middle => Some(self.index),
            StagePosition::Only | StagePosition::Last => None,
        }
    }
}

#[derive(Debug)]
struct Pipe {
    read: Option<RawFd>,
    write: Option<RawFd>,
}

/// The N-1 pipes joining an N-stage pipeline, owned by the parent while
/// the stages are spawned. Ends still open on drop are closed.
#[derive(Debug)]
pub struct PipeTable {
    pipes: Vec<Pipe>,
}

impl PipeTable {
    pub fn new(stages: usize) -> Result<Self, ShellError> {
        let mut table = PipeTable {
            pipes: Vec::with_capacity(stages.saturating_sub(1)),
        };
        for _ in 1..stages {
            let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(ShellError::Pipe)?;
            table.pipes.push(Pipe {
                read: Some(read),
                write: Some(write),
            });
        }
        Ok(table)
    }

    pub fn read_end(&self, i: usize) -> Option<RawFd> {
        self.pipes.get(i).and_then(|p| p.read)
    }

    pub fn write_end(&self, i: usize) -> Option<RawFd> {
        self.pipes.get(i).and_then(|p| p.write)
    }

    /// Every descriptor still open in the parent.
    pub fn open_fds(&self) -> Vec<RawFd> {
        self.pipes
            .iter()
            .flat_map(|p| p.read.into_iter().chain(p.write))
            .collect()
    }

    /// Closes the write end once its writer has been spawned, so the reader
    /// sees end-of-stream when the writer exits.
    pub fn close_write(&mut self, i: usize) {
        if let Some(fd) = self.pipes.get_mut(i).and_then(|p| p.write.take()) {
            close_quietly(fd);
        }
    }

    pub fn close_read(&mut self, i: usize) {
        if let Some(fd) = self.pipes.get_mut(i).and_then(|p| p.read.take()) {
            close_quietly(fd);
        }
    }
}

impl Drop for PipeTable {
    fn drop(&mut self) {
        for fd in self.open_fds() {
            close_quietly(fd);
        }
    }
}

fn close_quietly(fd: RawFd) {
    if let Err(e) = close(fd) {
        tracing::warn!("close({}) failed: {}", fd, e);
    }
}

/// Spawns every stage left to right, wiring stdout of each stage into stdin
/// of the next. All stages join the first stage's process group.
///
/// Nothing is waited for here; the caller decides whether to block.
pub fn spawn_pipeline(
    ctx: &ShellContext,
    stages: Vec<Vec<String>>,
    mode: LaunchMode,
) -> Result<Job, ShellError> {
    if let Some(i) = stages
        .iter()
        .position(|argv| argv.iter().any(|a| a.contains('\0')))
    {
        return Err(ShellError::NulArgument { stage: i + 1 });
    }

    let count = stages.len();
    let mut pipes = PipeTable::new(count)?;
    let started = Instant::now();
    let mut pgid: Option<Pid> = None;
    let mut pids = Vec::with_capacity(count);
    let mut commands = Vec::with_capacity(count);

    for (index, argv) in stages.into_iter().enumerate() {
        let stage = Stage { index, count, argv };
        let pid = spawn_stage(ctx, &stage, &pipes, pgid, mode)?;
        let group = *pgid.get_or_insert(pid);
        tracing::debug!(
            "stage {}/{} pid {} pgid {} in {:?} out {:?}",
            stage.number(),
            count,
            pid,
            group,
            stage.input_pipe(),
            stage.output_pipe()
        );
        println!("[{}] Spawned in {}", pid, mode);

        if let Some(i) = stage.output_pipe() {
            pipes.close_write(i);
        }
        if let Some(i) = stage.input_pipe() {
            pipes.close_read(i);
        }
        pids.push(pid);
        commands.push(reconstruct(&stage.argv));
    }
    debug_assert!(pipes.open_fds().is_empty());

    let pgid = pgid.ok_or(ShellError::EmptyCommand { stage: 1 })?;
    Ok(Job {
        pgid,
        pids,
        mode,
        started,
        commands,
    })
}
