use crate::context::ShellContext;
use crate::jobs::terminate_all;
use crate::reaper::SignalReaper;
use crate::shell::CLOSING_BANNER;
use nix::sys::signal::{killpg, raise, signal, SigHandler, Signal};
use signal_hook::{consts::signal::*, iterator::Signals};
use std::io;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

/// How long the read loop gets to pick up a Ctrl-C shutdown before the
/// listener tears the shell down itself.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Installs the shell's signal dispositions:
/// - SIGTTOU, SIGTTIN: ignored, so the shell can hand the terminal around.
/// - SIGQUIT: default.
/// - SIGINT (Ctrl-C): forwarded to the foreground job, or asks the read
///   loop to shut the shell down when there is none.
/// - SIGTSTP (Ctrl-Z): forwarded to the foreground job, or stops the shell.
/// - SIGCHLD: handed to `children` when the shell reaps on signals.
pub fn install_signal_handlers(
    ctx: &ShellContext,
    children: Option<SignalReaper>,
) -> io::Result<()> {
    unsafe {
        signal(Signal::SIGTTOU, SigHandler::SigIgn)?;
        signal(Signal::SIGTTIN, SigHandler::SigIgn)?;
        signal(Signal::SIGQUIT, SigHandler::SigDfl)?;
    }

    let mut wanted = vec![SIGINT, SIGTSTP];
    if children.is_some() {
        wanted.push(SIGCHLD);
    }
    let mut signals = Signals::new(&wanted)?;
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                match (sig, &children) {
                    (SIGINT, _) => on_interrupt(&ctx),
                    (SIGTSTP, _) => on_stop(&ctx),
                    (SIGCHLD, Some(reaper)) => reaper.on_sigchld(),
                    _ => unreachable!(),
                }
            }
        })?;
    Ok(())
}

fn on_interrupt(ctx: &ShellContext) {
    if let Some(pgid) = ctx.foreground() {
        if let Err(e) = killpg(pgid, Signal::SIGINT) {
            tracing::warn!("forwarding SIGINT to {} failed: {}", pgid, e);
        }
        return;
    }

    ctx.request_teardown();
    let deadline = Instant::now() + TEARDOWN_GRACE;
    while Instant::now() < deadline {
        if ctx.teardown_accepted() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }

    // The line editor retries reads interrupted by signals, so a blocked
    // readline never sees the request.
    tracing::debug!("read loop did not pick up the interrupt");
    ctx.restore_terminal();
    println!("\n[Ctrl+C]");
    println!("{}", CLOSING_BANNER);
    terminate_all(ctx);
    process::exit(0);
}

fn on_stop(ctx: &ShellContext) {
    if let Some(pgid) = ctx.foreground() {
        if let Err(e) = killpg(pgid, Signal::SIGTSTP) {
            tracing::warn!("forwarding SIGTSTP to {} failed: {}", pgid, e);
        }
        return;
    }
    println!("\n[Ctrl+Z]");
    if let Err(e) = raise(Signal::SIGSTOP) {
        tracing::warn!("could not stop the shell: {}", e);
    }
}
