mod builtins;
mod config;
mod context;
mod error;
mod exec;
mod jobs;
mod parser;
mod pipeline;
mod reaper;
mod shell;
mod signals;
mod utils;

use config::{Config, ParsedArgs};
use context::ShellContext;
use jobs::ProcessTable;
use reaper::StatusPrinter;
use std::env;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    // Diagnostics go to stderr; RUST_LOG overrides the default level.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    // Parse command-line arguments.
    let args: Vec<String> = env::args().collect();
    let config = match Config::from_args(&args, |key| env::var(key).ok()) {
        ParsedArgs::Run(config) => config,
        ParsedArgs::Help => utils::print_usage(),
        ParsedArgs::Invalid(flag) => {
            eprintln!("psh: unknown option '{}'", flag);
            utils::print_usage()
        }
    };

    let ctx = ShellContext::init().unwrap_or_else(|e| utils::fatal(&e.to_string()));

    let table = ProcessTable::shared();
    let printer = StatusPrinter::default();
    let reaper = reaper::from_config(&config, &table, &printer);
    tracing::info!("pid {} reaping by {:?}", ctx.pid, reaper.mode());

    // Install signal handlers before touching the terminal.
    if let Err(e) = signals::install_signal_handlers(&ctx, reaper.listener()) {
        utils::fatal(&format!("cannot install signal handlers: {}", e));
    }
    ctx.claim_terminal();

    // Run the main shell loop with the options.
    shell::run_shell(config, ctx, table, reaper, printer);
}
