//! `solver` command line: run one chain in-process, extract answers from
//! program output, or check configuration.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use solver::core::extract::extract_answer;
use solver::core::links::is_http_url;
use solver::core::run::RunId;
use solver::exit_codes;
use solver::io::config::{Credentials, DEFAULT_CONFIG_PATH, load_config, render_config};
use solver::io::prompt::PromptBuilder;
use solver::io::run_store::{InMemoryRunStore, RunStore};
use solver::logging;
use solver::looping::{LoopConfig, LoopStop, RunRequest, TaskLoop};
use solver::solve::{Collaborators, Solver};

#[derive(Parser)]
#[command(name = "solver", version, about = "Solve chained quiz tasks")]
struct Cli {
    /// Path to the TOML config (missing file means defaults).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Walk a task chain from URL and print the final run record as JSON.
    Run {
        #[arg(long)]
        email: String,
        /// First task URL.
        #[arg(long)]
        url: String,
        #[arg(long, env = "USER_SECRET", hide_env_values = true)]
        secret: String,
    },
    /// Print the `{answer, submit_url}` object recovered from FILE (or stdin).
    Extract { file: Option<PathBuf> },
    /// Validate the config and print the effective values as TOML.
    Config,
}

#[tokio::main]
async fn main() {
    logging::init("warn");
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run { email, url, secret } => cmd_run(&cli.config, email, url, secret).await,
        Command::Extract { file } => cmd_extract(file.as_deref()),
        Command::Config => cmd_config(&cli.config),
    }
}

async fn cmd_run(config_path: &Path, email: String, url: String, secret: String) -> Result<i32> {
    if !is_http_url(&url) {
        bail!("url must be an absolute http(s) url: {url}");
    }
    let config = load_config(config_path)?;
    let collaborators = Collaborators::from_config(&config, &Credentials::from_env())?;
    let solver = Solver::new(
        collaborators,
        PromptBuilder::new(config.reasoner.prompt_budget_bytes),
    );
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let task_loop = TaskLoop::new(LoopConfig::from_config(&config)?, solver, store.clone());

    let run_id = RunId::generate();
    let request = RunRequest { email, secret, url };
    let outcome = task_loop
        .run(&run_id, &request, CancellationToken::new())
        .await?;

    let record = store
        .get(&run_id)?
        .context("run record disappeared from store")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("serialize run record")?
    );
    Ok(match outcome.stop {
        LoopStop::Completed => exit_codes::OK,
        LoopStop::Timeout => exit_codes::TIMEOUT,
        LoopStop::Failed { .. } | LoopStop::Cancelled | LoopStop::MaxStepsReached => {
            exit_codes::FAILED
        }
    })
}

fn cmd_extract(file: Option<&Path>) -> Result<i32> {
    let output = match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            buf
        }
    };
    match extract_answer(&output) {
        Some(answer) => {
            println!(
                "{}",
                serde_json::to_string(&answer).context("serialize answer")?
            );
            Ok(exit_codes::OK)
        }
        None => {
            eprintln!("no answer object found");
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_config(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    print!("{}", render_config(&config)?);
    Ok(exit_codes::OK)
}
