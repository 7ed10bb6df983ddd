use std::path::PathBuf;
use std::time::Duration;

/// Default pause before each polling pass.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How finished or stopped children are noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapMode {
    /// A SIGCHLD handler flags pending children; the main loop collects them.
    Signal,
    /// No handler; the main loop checks for children between prompts.
    Poll,
}

impl ReapMode {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "signal" | "sigchld" => Some(ReapMode::Signal),
            "poll" | "polling" => Some(ReapMode::Poll),
            _ => None,
        }
    }
}

/// Startup options of the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub emit_prompt: bool,
    pub verbose: bool,
    pub reap_mode: ReapMode,
    pub poll_interval: Duration,
    pub history_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            emit_prompt: true,
            verbose: false,
            reap_mode: ReapMode::Signal,
            poll_interval: DEFAULT_POLL_INTERVAL,
            history_file: None,
        }
    }
}

/// Outcome of reading the command line.
#[derive(Debug, PartialEq, Eq)]
pub enum ParsedArgs {
    Run(Config),
    Help,
    Invalid(String),
}

impl Config {
    /// Builds the configuration from the process environment and arguments.
    /// `PSH_REAP`, `PSH_POLL_MS` and `PSH_HISTFILE` supply defaults that
    /// flags override.
    pub fn from_args<F>(args: &[String], var: F) -> ParsedArgs
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config {
            history_file: dirs_next::home_dir().map(|home| home.join(".psh_history")),
            ..Config::default()
        };

        if let Some(mode) = var("PSH_REAP") {
            match ReapMode::from_name(mode.trim()) {
                Some(mode) => config.reap_mode = mode,
                None => tracing::warn!("ignoring unknown PSH_REAP value '{}'", mode),
            }
        }
        if let Some(ms) = var("PSH_POLL_MS") {
            match ms.trim().parse::<u64>() {
                Ok(ms) => config.poll_interval = Duration::from_millis(ms),
                Err(_) => tracing::warn!("ignoring malformed PSH_POLL_MS value '{}'", ms),
            }
        }
        if let Some(path) = var("PSH_HISTFILE") {
            config.history_file = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        for arg in args.iter().skip(1) {
            match arg.as_str() {
                "-h" => return ParsedArgs::Help,
                "-v" => config.verbose = true,
                "-p" => config.emit_prompt = false,
                "-P" => config.reap_mode = ReapMode::Poll,
                "-s" => config.reap_mode = ReapMode::Signal,
                other => return ParsedArgs::Invalid(other.to_string()),
            }
        }
        ParsedArgs::Run(config)
    }
}
