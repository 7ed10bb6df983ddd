use crate::error::ShellError;

/// Maximum number of arguments (program name included) in one stage.
pub const MAXARGS: usize = 128;
/// Maximum number of stages in one pipeline.
pub const MAXSTAGES: usize = 64;

/// Splits a command line into per-stage argument vectors.
///
/// The line is split on `|` first, keeping empty segments so that `a || b`
/// is reported as an empty second stage, then every segment is split on
/// whitespace. A line holding nothing but whitespace yields no stages.
///
/// Returns `Err` naming the 1-based stage when a stage is empty or too long.
pub fn parse_command_line(cmdline: &str) -> Result<Vec<Vec<String>>, ShellError> {
    if cmdline.trim().is_empty() {
        return Ok(Vec::new());
    }

    let segments = tokenize(cmdline, '|');
    if segments.len() > MAXSTAGES {
        return Err(ShellError::TooManyStages { limit: MAXSTAGES });
    }

    let mut stages = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        let argv: Vec<String> = segment.split_whitespace().map(str::to_owned).collect();
        if argv.is_empty() {
            return Err(ShellError::EmptyCommand { stage: i + 1 });
        }
        if argv.len() > MAXARGS {
            return Err(ShellError::TooManyArgs {
                stage: i + 1,
                limit: MAXARGS,
            });
        }
        stages.push(argv);
    }
    Ok(stages)
}

/// Splits `input` on `delim` into owned strings, keeping empty pieces.
fn tokenize(input: &str, delim: char) -> Vec<String> {
    input.split(delim).map(str::to_owned).collect()
}

/// Rebuilds the text of a stage for error messages.
pub fn reconstruct(argv: &[String]) -> String {
    argv.join(" ")
}
