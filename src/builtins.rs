use crate::error::ShellError;
use crate::shell::LineSubmitter;
use std::env;
use std::path::{Path, PathBuf};

/// Commands the shell handles itself. They are only recognized when a
/// line holds a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Cd,
    CheckEnv,
    Exit,
    Fg,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "cd" => Some(Builtin::Cd),
            "checkEnv" => Some(Builtin::CheckEnv),
            "exit" => Some(Builtin::Exit),
            "fg" => Some(Builtin::Fg),
            _ => None,
        }
    }
}

/// The home directory: `$HOME`, else whatever the platform reports.
pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .or_else(dirs_next::home_dir)
}

/// Expands a leading `~` (alone or followed by `/`) to `home`.
/// `~user` forms are left untouched.
pub fn expand_tilde(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home.to_path_buf(),
        (Some(rest), Some(home)) if rest.starts_with('/') => {
            home.join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}

/// `cd [path]`. Without an argument, goes home.
pub fn change_dir(args: &[String]) -> Result<(), ShellError> {
    let target = match args {
        [_] => "~",
        [_, path] => path.as_str(),
        _ => return Err(ShellError::Usage("cd [path]")),
    };
    let path = expand_tilde(target, home_dir().as_deref());
    env::set_current_dir(&path)
        .map_err(|e| ShellError::Builtin(format!("cd: {}: {}", path.display(), e)))
}

/// Pager used when `$PAGER` is not set, and its fallback.
const DEFAULT_PAGER: &str = "less";
const FALLBACK_PAGER: &str = "more";

/// The pipeline behind `checkEnv`.
pub fn env_command_line(pattern: Option<&str>, pager: &str) -> String {
    match pattern {
        None => format!("printenv | sort | {}", pager),
        Some(pattern) => format!("printenv | sort | grep {} | {}", pattern, pager),
    }
}

/// `checkEnv [pattern]`: lists the environment, sorted and optionally
/// filtered, through a pager. The synthesized line goes through `shell`
/// like any typed line. If the default pager cannot run, the line is
/// submitted again with the fallback pager.
pub fn check_env<S>(shell: &mut S, args: &[String], pager: Option<String>) -> Result<(), ShellError>
where
    S: LineSubmitter + ?Sized,
{
    let pattern = match args {
        [_] => None,
        [_, pattern] => Some(pattern.as_str()),
        _ => return Err(ShellError::Usage("checkEnv [pattern]")),
    };
    let pager = pager
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PAGER.to_string());

    let line = env_command_line(pattern, &pager);
    let stages = line.split('|').count();
    println!("Actual command line: {}", line);
    match shell.submit(&line) {
        Err(e) if pager == DEFAULT_PAGER && e.failed_stage() == Some(stages) => {
            eprintln!("psh: {}", e);
            let line = env_command_line(pattern, FALLBACK_PAGER);
            println!("Actual command line: {}", line);
            shell.submit(&line)
        }
        result => result,
    }
}

/// Parses the argument of `fg <pid>`.
pub fn fg_target(args: &[String]) -> Result<nix::unistd::Pid, ShellError> {
    match args {
        [_, pid] => match pid.parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(nix::unistd::Pid::from_raw(pid)),
            _ => Err(ShellError::Usage("fg <pid>")),
        },
        _ => Err(ShellError::Usage("fg <pid>")),
    }
}
