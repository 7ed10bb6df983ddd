use nix::unistd::Pid;
use thiserror::Error;

/// Everything that can go wrong while executing a command line.
///
/// Fatal variants mean the shell cannot continue (resource exhaustion or a
/// broken process environment); the rest are reported and the prompt comes
/// back.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("could not create pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("could not fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("could not make the shell a process group leader: {0}")]
    ProcessGroup(#[source] nix::Error),

    #[error("stage {stage}: empty command")]
    EmptyCommand { stage: usize },

    #[error("stage {stage}: too many arguments (limit {limit})")]
    TooManyArgs { stage: usize, limit: usize },

    #[error("stage {stage}: argument contains a NUL byte")]
    NulArgument { stage: usize },

    #[error("too many commands in pipeline (limit {limit})")]
    TooManyStages { limit: usize },

    #[error("background marker '&' needs a command before it")]
    BadBackground,

    #[error("piping in background is not supported")]
    PipedBackground,

    #[error("stage {stage}: command '{command}' failed")]
    CommandFailed { stage: usize, command: String },

    #[error("{0}: no such child")]
    NotAChild(Pid),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    Builtin(String),
}

impl ShellError {
    /// True when the shell must terminate with a failure status.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShellError::Pipe(_) | ShellError::Fork(_) | ShellError::ProcessGroup(_)
        )
    }

    /// The 1-based pipeline stage this error is attributed to, if any.
    pub fn failed_stage(&self) -> Option<usize> {
        match self {
            ShellError::EmptyCommand { stage }
            | ShellError::TooManyArgs { stage, .. }
            | ShellError::NulArgument { stage }
            | ShellError::CommandFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn only_resource_failures_are_fatal() {
        assert!(ShellError::Pipe(Errno::EMFILE).is_fatal());
        assert!(ShellError::Fork(Errno::EAGAIN).is_fatal());
        assert!(ShellError::ProcessGroup(Errno::EPERM).is_fatal());
        assert!(!ShellError::BadBackground.is_fatal());
        assert!(!ShellError::NotAChild(Pid::from_raw(1)).is_fatal());
    }

    #[test]
    fn stage_is_reported_for_pipeline_errors() {
        let err = ShellError::CommandFailed {
            stage: 3,
            command: "grep x".into(),
        };
        assert_eq!(err.failed_stage(), Some(3));
        assert_eq!(err.to_string(), "stage 3: command 'grep x' failed");
        assert_eq!(ShellError::EmptyCommand { stage: 2 }.failed_stage(), Some(2));
        assert_eq!(ShellError::PipedBackground.failed_stage(), None);
    }
}
