use crate::context::ShellContext;
use crate::error::ShellError;
use crate::jobs::LaunchMode;
use crate::pipeline::{PipeTable, Stage};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{close, dup2, execvp, fork, getpgrp, setpgid, tcsetpgrp, write, ForkResult, Pid};
use std::ffi::CString;
use std::os::unix::io::RawFd;

/// Signals the shell customizes; children get the defaults back. SIGPIPE is
/// ignored by the Rust runtime and an ignored disposition survives exec.
const RESET_SIGNALS: [Signal; 7] = [
    Signal::SIGINT,
    Signal::SIGPIPE,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGCHLD,
];

/// Everything the child needs, prepared before the fork so the child only
/// makes system calls.
struct ChildPlan<'a> {
    program: CString,
    args: Vec<CString>,
    /// `None` for the first stage, which leads its own group.
    pgid: Option<Pid>,
    take_terminal: Option<RawFd>,
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    inherited: Vec<RawFd>,
    error_prefix: &'a [u8],
}

/// Forks one pipeline stage and returns the child's pid.
///
/// Group membership is set from both sides of the fork so that neither the
/// parent nor the child can act on the group before it exists.
pub fn spawn_stage(
    ctx: &ShellContext,
    stage: &Stage,
    pipes: &PipeTable,
    pgid: Option<Pid>,
    mode: LaunchMode,
) -> Result<Pid, ShellError> {
    let args = stage
        .argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ShellError::NulArgument {
            stage: stage.number(),
        })?;
    let error_prefix = format!("psh: {}: ", stage.argv[0]).into_bytes();
    let plan = ChildPlan {
        program: args[0].clone(),
        args,
        pgid,
        take_terminal: match (mode, pgid) {
            (LaunchMode::Foreground, None) => ctx.terminal,
            _ => None,
        },
        stdin: stage.input_pipe().and_then(|i| pipes.read_end(i)),
        stdout: stage.output_pipe().and_then(|i| pipes.write_end(i)),
        inherited: pipes.open_fds(),
        error_prefix: &error_prefix,
    };

    match unsafe { fork() }.map_err(ShellError::Fork)? {
        ForkResult::Parent { child } => {
            join_group(child, pgid.unwrap_or(child));
            Ok(child)
        }
        ForkResult::Child => exec_child(plan),
    }
}

/// Parent side of the group setup. The child may already have exec'd or
/// exited, which is fine: it set its own group first.
fn join_group(pid: Pid, pgid: Pid) {
    match setpgid(pid, pgid) {
        Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("setpgid({}, {}) failed: {}", pid, pgid, e),
    }
}

fn exec_child(plan: ChildPlan<'_>) -> ! {
    let _ = setpgid(Pid::from_raw(0), plan.pgid.unwrap_or(Pid::from_raw(0)));
    if let Some(fd) = plan.take_terminal {
        let _ = tcsetpgrp(fd, getpgrp());
    }

    for sig in RESET_SIGNALS {
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }

    if let Some(fd) = plan.stdin {
        if let Err(e) = dup2(fd, libc::STDIN_FILENO) {
            die(plan.error_prefix, e);
        }
    }
    if let Some(fd) = plan.stdout {
        if let Err(e) = dup2(fd, libc::STDOUT_FILENO) {
            die(plan.error_prefix, e);
        }
    }
    for &fd in &plan.inherited {
        let _ = close(fd);
    }

    let err = match execvp(&plan.program, &plan.args) {
        Err(e) => e,
        Ok(never) => match never {},
    };
    die(plan.error_prefix, err)
}

/// Reports a child-side failure with raw writes and leaves without running
/// any of the shell's code.
fn die(prefix: &[u8], err: Errno) -> ! {
    let _ = write(libc::STDERR_FILENO, prefix);
    let _ = write(libc::STDERR_FILENO, err.desc().as_bytes());
    let _ = write(libc::STDERR_FILENO, b"\n");
    unsafe { libc::_exit(127) }
}
