//! Differential bug-verification CLI.
//!
//! `verifier run` mines the given repositories, re-runs their CI at three
//! checkpoints per candidate and writes accepted candidates to the output
//! directory. `verifier init-config` writes a default configuration.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use verifier::core::strategy::Strategy;
use verifier::exit_codes;
use verifier::io::ci_runner::CommandCiRunner;
use verifier::io::config::{VerifierConfig, load_config, write_config};
use verifier::io::credentials::{CredentialPool, QuotaClass, load_tokens};
use verifier::io::github::{DEFAULT_API_URL, GithubClient, MetadataService};
use verifier::io::reaper::ContainerReaper;
use verifier::logging;
use verifier::pipeline::{Pipeline, exit_code};

#[derive(Parser)]
#[command(name = "verifier", version, about = "Differential bug-verification engine")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "verifier.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mine and verify repositories.
    Run(RunArgs),
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Repositories as `owner/name`.
    repositories: Vec<String>,
    /// File with one `owner/name` per line.
    #[arg(long)]
    repos_file: Option<PathBuf>,
    /// Output directory for records and `summary.json`.
    #[arg(long, default_value = "out")]
    output: PathBuf,
    /// Scratch space for clones, cache slots and working copies.
    #[arg(long, default_value = ".verifier-work")]
    work_dir: PathBuf,
    /// Credentials file (one token per line); defaults to `GITHUB_TOKENS`.
    #[arg(long)]
    tokens_file: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_API_URL)]
    api_url: String,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    memory_limit: Option<String>,
    #[arg(long)]
    no_message_filter: bool,
    /// Only commits at or after this RFC 3339 timestamp.
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    #[arg(long)]
    until: Option<DateTime<Utc>>,
    /// Enabled strategies in evaluation order (repeatable).
    #[arg(long = "strategy")]
    strategies: Vec<Strategy>,
    /// Include commits reachable from pull-request heads.
    #[arg(long)]
    pull_requests: bool,
    #[arg(long)]
    no_normalize_non_code: bool,
    #[arg(long)]
    offline: bool,
}

fn main() {
    logging::init("info");
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => cmd_run(&cli.config, &args),
        Command::InitConfig { force } => match cmd_init_config(&cli.config, force) {
            Ok(()) => exit_codes::OK,
            Err(err) => {
                eprintln!("{err:#}");
                exit_codes::INVALID
            }
        },
    };
    std::process::exit(code);
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force)", path.display());
    }
    write_config(path, &VerifierConfig::default())?;
    info!(path = %path.display(), "config written");
    Ok(())
}

fn cmd_run(config_path: &Path, args: &RunArgs) -> i32 {
    let (pipeline, repositories) = match prepare(config_path, args) {
        Ok(prepared) => prepared,
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::INVALID;
        }
    };
    match pipeline.run(&repositories) {
        Ok(summary) => exit_code(&summary),
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::PARTIAL
        }
    }
}

/// Everything that can fail before any repository is touched.
fn prepare(config_path: &Path, args: &RunArgs) -> Result<(Pipeline, Vec<String>)> {
    let mut config = load_config(config_path)?;
    apply_overrides(&mut config, args);
    config.validate().context("validate configuration overrides")?;

    let repositories = repositories(args)?;
    if repositories.is_empty() {
        bail!("no repositories given");
    }

    let secrets = load_tokens(args.tokens_file.as_deref())?;
    let pool = Arc::new(CredentialPool::new(secrets, &config.credentials)?);
    let client = Arc::new(GithubClient::new(&args.api_url).context("build metadata client")?);
    pool.refresh(client.as_ref());
    for class in [QuotaClass::Core, QuotaClass::Search] {
        pool.ensure_headroom(class).context("check credential quotas")?;
    }
    let metadata = MetadataService::new(pool, client);

    let runner = Arc::new(CommandCiRunner::new(
        config.runner.command.clone(),
        config.runner.image.clone(),
    )?);
    let reaper = ContainerReaper::docker(Duration::from_secs(
        config.runner.reap_interval_secs.max(1),
    ));
    let pipeline = Pipeline::new(config, metadata, runner, reaper, &args.work_dir, &args.output)?;
    Ok((pipeline, repositories))
}

fn apply_overrides(config: &mut VerifierConfig, args: &RunArgs) {
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(limit) = &args.memory_limit {
        config.memory_limit.clone_from(limit);
    }
    if args.no_message_filter {
        config.mining.message_filter = false;
    }
    if args.since.is_some() {
        config.mining.since = args.since;
    }
    if args.until.is_some() {
        config.mining.until = args.until;
    }
    if !args.strategies.is_empty() {
        config.strategies.clone_from(&args.strategies);
    }
    if args.pull_requests {
        config.mining.include_pull_requests = true;
    }
    if args.no_normalize_non_code {
        config.mining.normalize_non_code = false;
    }
    if args.offline {
        config.offline = true;
    }
}

fn repositories(args: &RunArgs) -> Result<Vec<String>> {
    let mut names = args.repositories.clone();
    if let Some(path) = &args.repos_file {
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        names.extend(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    for name in &names {
        if name.split('/').count() != 2 {
            bail!("repository '{name}' is not of the form owner/name");
        }
    }
    let mut seen = HashSet::new();
    names.retain(|name| seen.insert(name.clone()));
    Ok(names)
}
