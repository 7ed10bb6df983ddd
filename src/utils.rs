use std::process;
use std::time::Duration;

pub fn print_usage() -> ! {
    println!("Usage: psh [-hvpPs]");
    println!("   -h   Print this help message");
    println!("   -v   Enable verbose mode");
    println!("   -p   Do not print a command prompt");
    println!("   -P   Detect finished children by polling between prompts");
    println!("   -s   Detect finished children through SIGCHLD (default)");
    process::exit(1);
}

/// Reports an unrecoverable error and terminates the shell.
pub fn fatal(msg: &str) -> ! {
    eprintln!("psh: fatal: {}", msg);
    process::exit(1);
}

/// Calls `f` until it stops failing with `EINTR`.
pub fn syscall<F, T>(mut f: F) -> nix::Result<T>
where
    F: FnMut() -> nix::Result<T>,
{
    loop {
        match f() {
            Err(nix::Error::EINTR) => continue,
            result => return result,
        }
    }
}

/// Whole milliseconds, rounded, for run time reports.
pub fn millis(elapsed: Duration) -> u128 {
    (elapsed.as_micros() + 500) / 1000
}
