mod common;

use common::{myint, myspin, mystop, pid_of, run_lines, stderr_of, stdout_of, Session};
use nix::sys::signal::{kill, Signal};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);
const CLOSING: &str = "psh closing...";

#[test]
fn background_job_is_reported_without_further_input() {
    let mut sh = Session::start(&["-s"]);
    sh.send(&format!("{} 0.3 &", myspin()));
    let pid = pid_of(&sh.expect("Spawned in background", WAIT));
    sh.expect(&format!("[{}] Terminated normally", pid), WAIT);
    assert!(sh.finish().success());
}

#[test]
fn background_job_is_reaped_by_polling() {
    let mut sh = Session::start(&["-P"]);
    sh.send(&format!("{} 0.5 &", myspin()));
    let pid = pid_of(&sh.expect("Spawned in background", WAIT));

    sh.send("echo prompt-is-back");
    sh.expect("prompt-is-back", Duration::from_millis(400));

    // Polling only looks after a line has run.
    thread::sleep(Duration::from_millis(800));
    sh.send("echo tick");
    sh.expect(&format!("[{}] Terminated normally", pid), WAIT);
    assert!(sh.finish().success());
}

#[test]
fn sigint_at_the_prompt_shuts_down_through_the_read_loop() {
    let mut sh = Session::start(&["-s"]);
    sh.send(&format!("{} 30 &", myspin()));
    let pid = pid_of(&sh.expect("Spawned in background", WAIT));
    sh.send("echo settled");
    sh.expect("settled", WAIT);

    kill(sh.pid(), Signal::SIGINT).unwrap();
    sh.expect("[Ctrl+C]", WAIT);
    sh.expect(CLOSING, WAIT);
    // Only an orderly shutdown reaps and reports the killed job.
    sh.expect(&format!("[{}] Terminated by a signal (SIGKILL)", pid), WAIT);
    assert!(sh.finish().success());
}

#[test]
fn stopped_job_can_be_resumed_with_fg() {
    let mut sh = Session::start(&[]);
    sh.send(&format!("{} 0", mystop()));
    let pid = pid_of(&sh.expect("Spawned in foreground", WAIT));
    sh.expect(&format!("[{}] Stopped", pid), WAIT);

    sh.send("echo shell-is-free");
    sh.expect("shell-is-free", WAIT);

    sh.send(&format!("fg {}", pid));
    sh.expect(&format!("[{}] Terminated normally", pid), WAIT);
    assert!(sh.finish().success());
}

#[test]
fn fg_refuses_processes_that_are_not_children() {
    let output = run_lines(&[], &["fg 1", "fg", "fg abc"]);
    let stderr = stderr_of(&output);
    assert!(stderr.contains("psh: 1: no such child"), "stderr was: {stderr}");
    assert_eq!(stderr.matches("usage: fg <pid>").count(), 2);
}

#[test]
fn signaled_child_is_reported() {
    let output = run_lines(&[], &[&format!("{} 0", myint())]);
    let stdout = stdout_of(&output);
    assert!(
        stdout.contains("Terminated by a signal (SIGINT)"),
        "stdout was: {stdout}"
    );
}

#[test]
fn nonzero_exit_is_reported_with_status() {
    let output = run_lines(&[], &[&format!("{} x", myspin())]);
    assert!(stdout_of(&output).contains("Terminated normally (status 2)"));
    assert!(stderr_of(&output).contains("failed"));
}

#[test]
fn exit_kills_background_jobs() {
    let started = Instant::now();
    let output = run_lines(&[], &[&format!("{} 30 &", myspin()), "exit"]);
    assert!(started.elapsed() < WAIT);
    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.contains("psh closing..."), "stdout was: {stdout}");
    assert!(stdout.contains("Terminated by a signal (SIGKILL)"), "stdout was: {stdout}");
}

#[test]
fn end_of_input_behaves_like_exit() {
    let started = Instant::now();
    let output = run_lines(&["-P"], &[&format!("{} 30 &", myspin())]);
    assert!(started.elapsed() < WAIT);
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("psh closing..."));
}

#[test]
fn exit_takes_no_arguments() {
    let output = run_lines(&[], &["exit now", "echo after"]);
    assert!(stderr_of(&output).contains("usage: exit"));
    assert!(stdout_of(&output).lines().any(|l| l == "after"));
}
