mod cli;
mod report;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dataset", version, about = "Inspect a verifier output directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One line per accepted candidate.
    List { dir: PathBuf },
    /// Counts by strategy and change type, plus the run summary.
    Report { dir: PathBuf },
}

fn main() -> Result<()> {
    verifier::logging::init("warn");
    let cli = Cli::parse();
    match cli.command {
        Command::List { dir } => cli::list(&dir),
        Command::Report { dir } => cli::report(&dir),
    }
}
