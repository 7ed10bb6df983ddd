/*
 * myint.rs - interrupts itself
 *
 * usage: myint <secs>
 * Sleeps for <secs> and sends SIGINT to itself.
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
            eprintln!("myint: {}; usage: myint <secs>", msg);
            return ExitCode::from(2);
        }
    };
    thread::sleep(delay);

    if let Err(e) = raise(Signal::SIGINT) {
        eprintln!("myint: raise: {}", e);
    }
    ExitCode::FAILURE
}
