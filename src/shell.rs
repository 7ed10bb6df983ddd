use crate::builtins::{change_dir, check_env, fg_target, Builtin};
use crate::config::Config;
use crate::context::ShellContext;
use crate::error::ShellError;
use crate::jobs::{terminate_all, Foreground, JobController, LaunchMode, SharedTable};
use crate::parser::parse_command_line;
use crate::pipeline::spawn_pipeline;
use crate::reaper::{Reaper, StatusPrinter};
use crate::utils::{fatal, millis, syscall};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::read;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::env;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process;
use std::thread;

/// Printed when the shell shuts down.
pub const CLOSING_BANNER: &str = "psh closing...";

/// Accepts a command line for execution. Built-ins that synthesize command
/// lines go through this rather than calling back into the shell directly.
pub trait LineSubmitter {
    fn submit(&mut self, line: &str) -> Result<(), ShellError>;
}

/// What to do with one parsed line.
#[derive(Debug, PartialEq, Eq)]
pub enum Plan {
    Builtin(Builtin, Vec<String>),
    Pipeline {
        stages: Vec<Vec<String>>,
        mode: LaunchMode,
    },
}

/// Decides how a parsed, non-empty line runs.
///
/// Built-ins and the trailing `&` are only recognized for a single command.
/// A piped line ending in `&` is refused: background jobs are single
/// commands.
pub fn plan(mut stages: Vec<Vec<String>>) -> Result<Plan, ShellError> {
    if stages.len() == 1 {
        let mut argv = stages.remove(0);
        if let Some(builtin) = Builtin::lookup(&argv[0]) {
            return Ok(Plan::Builtin(builtin, argv));
        }
        let mut mode = LaunchMode::Foreground;
        if argv.last().map(String::as_str) == Some("&") {
            if argv.len() < 2 {
                return Err(ShellError::BadBackground);
            }
            argv.pop();
            mode = LaunchMode::Background;
        }
        return Ok(Plan::Pipeline {
            stages: vec![argv],
            mode,
        });
    }

    let trailing = stages.last().and_then(|s| s.last()).map(String::as_str);
    if trailing == Some("&") {
        return Err(ShellError::PipedBackground);
    }
    Ok(Plan::Pipeline {
        stages,
        mode: LaunchMode::Foreground,
    })
}

/// The shell: dispatcher, job controller and reaper together.
pub struct Shell {
    config: Config,
    jobs: JobController,
    reaper: Box<dyn Reaper>,
    printer: StatusPrinter,
}

impl LineSubmitter for Shell {
    fn submit(&mut self, line: &str) -> Result<(), ShellError> {
        let stages = parse_command_line(line)?;
        if stages.is_empty() {
            return Ok(());
        }
        match plan(stages)? {
            Plan::Builtin(builtin, args) => self.run_builtin(builtin, &args),
            Plan::Pipeline { stages, mode } => self.run_pipeline(stages, mode),
        }
    }
}

impl Shell {
    pub fn new(
        config: Config,
        ctx: ShellContext,
        table: SharedTable,
        reaper: Box<dyn Reaper>,
        printer: StatusPrinter,
    ) -> Self {
        Shell {
            config,
            jobs: JobController::new(ctx, table),
            reaper,
            printer,
        }
    }

    fn run_builtin(&mut self, builtin: Builtin, args: &[String]) -> Result<(), ShellError> {
        match builtin {
            Builtin::Cd => change_dir(args),
            Builtin::CheckEnv => check_env(self, args, env::var("PAGER").ok()),
            Builtin::Exit => {
                if args.len() != 1 {
                    return Err(ShellError::Usage("exit"));
                }
                self.shutdown()
            }
            Builtin::Fg => {
                let pid = fg_target(args)?;
                let fg = self.jobs.resume(pid)?;
                print_foreground(&fg);
                Ok(())
            }
        }
    }

    fn run_pipeline(
        &mut self,
        stages: Vec<Vec<String>>,
        mode: LaunchMode,
    ) -> Result<(), ShellError> {
        let job = spawn_pipeline(self.jobs.ctx(), stages, mode)?;
        self.jobs.register(&job);
        if mode == LaunchMode::Background {
            return Ok(());
        }

        let fg = self.jobs.wait_foreground(&job);
        print_foreground(&fg);
        if fg.failed() {
            return Err(ShellError::CommandFailed {
                stage: job.pids.len(),
                command: job.commands[job.commands.len() - 1].clone(),
            });
        }
        Ok(())
    }

    /// Prints a line for every child that changed state since the last call.
    pub fn reap(&mut self) {
        let reports = self.reaper.drain(&mut self.jobs.table());
        for report in reports {
            println!("{}", report);
        }
    }

    /// Kills every child, reports them and exits successfully.
    pub fn shutdown(&mut self) -> ! {
        self.jobs.ctx().accept_teardown();
        println!("{}", CLOSING_BANNER);
        let killed = terminate_all(self.jobs.ctx());
        self.reap();
        let left = self.jobs.table().len();
        // Lines the listener is still printing for children it reaped.
        drop(self.printer.lock());
        if left > 0 {
            tracing::warn!("{} of {} killed children not reaped", left, killed);
        }
        process::exit(0);
    }

    /// Reads and executes lines until `exit`, end of input or Ctrl-C.
    pub fn run(&mut self) -> ! {
        let ctx = self.jobs.ctx().clone();
        let mut input = LineReader::new(&self.config, &ctx, &self.printer);
        loop {
            if ctx.teardown_requested() {
                println!("[Ctrl+C]");
                break;
            }
            let prompt = if self.config.emit_prompt {
                prompt()
            } else {
                String::new()
            };
            match input.read_line(&prompt) {
                Ok(Input::Line(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        if self.config.verbose {
                            println!("Received command: {}", line);
                        }
                        input.add_history(line);
                        self.execute(line);
                    }
                }
                Ok(Input::Interrupted) => {
                    println!("[Ctrl+C]");
                    break;
                }
                Ok(Input::Eof) => break,
                Err(e) => {
                    eprintln!("psh: error reading input: {}", e);
                    break;
                }
            }

            if let Some(interval) = self.reaper.poll_interval() {
                thread::sleep(interval);
            }
            self.reap();
        }
        ctx.accept_teardown();
        input.save_history();
        self.shutdown()
    }

    /// Runs one line and reports what went wrong. Fatal errors end the shell.
    fn execute(&mut self, line: &str) {
        if let Err(e) = self.submit(line) {
            if e.is_fatal() {
                fatal(&e.to_string());
            }
            eprintln!("psh: {}", e);
        }
    }
}

fn print_foreground(fg: &Foreground) {
    for report in &fg.reports {
        println!("{}", report);
    }
    if let Some(elapsed) = fg.elapsed {
        println!("Run time was {} ms", millis(elapsed));
    }
}

fn prompt() -> String {
    match env::current_dir() {
        Ok(cwd) => format!("{}> ", cwd.display()),
        Err(_) => "psh> ".to_string(),
    }
}

enum Input {
    Line(String),
    Interrupted,
    Eof,
}

/// Line editing with history on a terminal, plain reads otherwise.
enum LineReader {
    Editor {
        editor: DefaultEditor,
        history: Option<PathBuf>,
    },
    Plain {
        wake: RawFd,
    },
}

impl LineReader {
    fn new(config: &Config, ctx: &ShellContext, printer: &StatusPrinter) -> Self {
        if ctx.terminal.is_some() {
            match DefaultEditor::new() {
                Ok(mut editor) => {
                    if let Some(path) = &config.history_file {
                        if let Err(e) = editor.load_history(path) {
                            tracing::debug!("no history loaded from {}: {}", path.display(), e);
                        }
                    }
                    match editor.create_external_printer() {
                        Ok(p) => printer.attach(Box::new(p)),
                        Err(e) => tracing::debug!("status lines bypass the editor: {}", e),
                    }
                    return LineReader::Editor {
                        editor,
                        history: config.history_file.clone(),
                    };
                }
                Err(e) => tracing::warn!("line editing unavailable: {}", e),
            }
        }
        LineReader::Plain {
            wake: ctx.wake_fd(),
        }
    }

    fn read_line(&mut self, prompt: &str) -> io::Result<Input> {
        match self {
            LineReader::Editor { editor, .. } => match editor.readline(prompt) {
                Ok(line) => Ok(Input::Line(line)),
                Err(ReadlineError::Interrupted) => Ok(Input::Interrupted),
                Err(ReadlineError::Eof) => Ok(Input::Eof),
                Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
            },
            LineReader::Plain { wake } => {
                if !prompt.is_empty() {
                    print!("{}", prompt);
                    io::stdout().flush()?;
                }
                read_raw_line(*wake)
            }
        }
    }

    fn add_history(&mut self, line: &str) {
        if let LineReader::Editor { editor, .. } = self {
            let _ = editor.add_history_entry(line);
        }
    }

    fn save_history(&mut self) {
        if let LineReader::Editor {
            editor,
            history: Some(path),
        } = self
        {
            if let Err(e) = editor.save_history(path.as_path()) {
                tracing::warn!("could not save history to {}: {}", path.display(), e);
            }
        }
    }
}

/// Reads one line from stdin a byte at a time, so nothing past the newline
/// is consumed and a foreground child reading stdin gets the rest. A last
/// line without a newline is still a line. A readable `wake` fd abandons
/// the line.
fn read_raw_line(wake: RawFd) -> io::Result<Input> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if !stdin_ready(wake)? {
            return Ok(Input::Interrupted);
        }
        match syscall(|| read(libc::STDIN_FILENO, &mut byte)) {
            Ok(0) if line.is_empty() => return Ok(Input::Eof),
            Ok(0) => break,
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => line.push(byte[0]),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Input::Line(String::from_utf8_lossy(&line).into_owned()))
}

/// Blocks until stdin can be read or `wake` fires; false on a wake.
fn stdin_ready(wake: RawFd) -> io::Result<bool> {
    let mut fds = [
        PollFd::new(libc::STDIN_FILENO, PollFlags::POLLIN),
        PollFd::new(wake, PollFlags::POLLIN),
    ];
    syscall(|| poll(&mut fds, -1))?;
    let woken = fds[1]
        .revents()
        .map_or(false, |r| r.contains(PollFlags::POLLIN));
    Ok(!woken)
}

/// Entry point of the read loop.
pub fn run_shell(
    config: Config,
    ctx: ShellContext,
    table: SharedTable,
    reaper: Box<dyn Reaper>,
    printer: StatusPrinter,
) -> ! {
    if config.emit_prompt {
        println!("\nWelcome to psh! ({:?} reaping)\n", reaper.mode());
    }
    Shell::new(config, ctx, table, reaper, printer).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(line: &str) -> Vec<Vec<String>> {
        parse_command_line(line).unwrap()
    }

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn single_command_runs_in_foreground() {
        assert_eq!(
            plan(stages("ls -l")).unwrap(),
            Plan::Pipeline {
                stages: vec![argv(&["ls", "-l"])],
                mode: LaunchMode::Foreground
            }
        );
    }

    #[test]
    fn trailing_ampersand_is_stripped() {
        assert_eq!(
            plan(stages("sleep 5 &")).unwrap(),
            Plan::Pipeline {
                stages: vec![argv(&["sleep", "5"])],
                mode: LaunchMode::Background
            }
        );
    }

    #[test]
    fn lone_ampersand_is_rejected() {
        assert!(matches!(plan(stages("&")), Err(ShellError::BadBackground)));
    }

    #[test]
    fn piped_background_is_rejected() {
        assert!(matches!(
            plan(stages("yes | head &")),
            Err(ShellError::PipedBackground)
        ));
    }

    #[test]
    fn builtins_only_for_single_commands() {
        assert_eq!(
            plan(stages("cd /tmp")).unwrap(),
            Plan::Builtin(Builtin::Cd, argv(&["cd", "/tmp"]))
        );
        assert_eq!(
            plan(stages("fg 12")).unwrap(),
            Plan::Builtin(Builtin::Fg, argv(&["fg", "12"]))
        );
        match plan(stages("echo x | cd")).unwrap() {
            Plan::Pipeline { stages, mode } => {
                assert_eq!(stages.len(), 2);
                assert_eq!(mode, LaunchMode::Foreground);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn ampersand_inside_a_pipeline_is_an_argument() {
        match plan(stages("echo & | cat")).unwrap() {
            Plan::Pipeline { stages, mode } => {
                assert_eq!(stages[0], argv(&["echo", "&"]));
                assert_eq!(mode, LaunchMode::Foreground);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }
}
