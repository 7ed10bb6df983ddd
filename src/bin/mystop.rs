/*
 * mystop.rs - stops itself, then finishes once continued
 *
 * usage: mystop <secs>
 * Sleeps for <secs>, sends SIGSTOP to itself, and exits 0 after SIGCONT.
 */

use nix::sys::signal::{raise, Signal};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

/// The single argument, as a non-negative number of seconds.
fn delay() -> Result<Duration, String> {
    let mut args = std::env::args().skip(1);
    match (args.next(), args.next()) {
        (Some(secs), None) => secs
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| format!("bad delay '{}'", secs)),
        _ => Err("expected exactly one argument".to_string()),
    }
}

fn main() -> ExitCode {
    let delay = match delay() {
        Ok(delay) => delay,
        Err(msg) => {
            eprintln!("mystop: {}; usage: mystop <secs>", msg);
            return ExitCode::from(2);
        }
    };
    thread::sleep(delay);

    match raise(Signal::SIGSTOP) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mystop: raise: {}", e);
            ExitCode::FAILURE
        }
    }
}
