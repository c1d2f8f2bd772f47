use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

mod commands;
mod observability;
mod reaper;

#[derive(Parser, Debug)]
#[command(version, about = "scale-to-zero container shim")]
pub struct Opts {
    /// change log level to debug
    #[arg(long, global = true)]
    pub debug: bool,
    /// set the log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    /// log to this file instead of stderr
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,
    /// log format: text or json
    #[arg(long, global = true)]
    pub log_format: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Run a bundle under scale-down management until it exits
    Run(commands::run::Run),
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    observability::init(&opts)?;

    match opts.command {
        Command::Run(run) => commands::run::run(run),
    }
}
