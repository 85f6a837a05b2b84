//! Refinement-tree program search CLI.
//!
//! Reads a task (`{"train": [...], "test": [...]}`), a search plan
//! (`plan.json`), and an optional `refiner.toml`, then runs the search and
//! prints the result as JSON on stdout.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use refiner::core::scoring::{ExactMatchScorer, Scorer};
use refiner::core::types::{CandidateProgram, ExecutionOutcome, Score};
use refiner::exit_codes;
use refiner::io::config::{CONFIG_FILE, SearchConfig, load_config, write_config};
use refiner::io::generator::CommandGenerator;
use refiner::io::plan_store::{PLAN_FILE, load_plan, write_plan};
use refiner::io::sandbox::{Evaluator, SandboxExecutor};
use refiner::logging;
use refiner::plan::example_plan;
use refiner::search::Search;
use refiner::task::load_task;

#[derive(Parser)]
#[command(
    name = "refiner",
    version,
    about = "Refinement-tree program search with a sandboxed evaluator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `refiner.toml` and an example `plan.json` if missing.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check a plan against the schema and semantic invariants.
    Validate {
        #[arg(long, default_value = PLAN_FILE)]
        plan: PathBuf,
    },
    /// Evaluate one program on every task input and print outcome and score.
    Eval {
        #[arg(long)]
        task: PathBuf,
        /// Python source defining `transform(grid)`.
        #[arg(long)]
        program: PathBuf,
        #[arg(long, default_value = CONFIG_FILE)]
        config: PathBuf,
    },
    /// Run the full search and print every node.
    Run {
        #[arg(long)]
        task: PathBuf,
        #[arg(long, default_value = PLAN_FILE)]
        plan: PathBuf,
        #[arg(long, default_value = CONFIG_FILE)]
        config: PathBuf,
    },
}

#[derive(Serialize)]
struct EvalReport {
    outcome: ExecutionOutcome,
    score: Score,
    solved: bool,
}

#[tokio::main]
async fn main() {
    logging::init();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Validate { plan } => cmd_validate(&plan),
        Command::Eval {
            task,
            program,
            config,
        } => cmd_eval(&task, &program, &config).await,
        Command::Run { task, plan, config } => cmd_run(&task, &plan, &config).await,
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let config_path = Path::new(CONFIG_FILE);
    if force || !config_path.exists() {
        write_config(config_path, &SearchConfig::default())
            .with_context(|| format!("write {CONFIG_FILE}"))?;
    }
    let plan_path = Path::new(PLAN_FILE);
    if force || !plan_path.exists() {
        write_plan(plan_path, &example_plan()).with_context(|| format!("write {PLAN_FILE}"))?;
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(plan: &Path) -> Result<i32> {
    load_plan(plan)?;
    Ok(exit_codes::OK)
}

async fn cmd_eval(task: &Path, program: &Path, config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let task = load_task(task)?;
    let source = fs::read_to_string(program)
        .with_context(|| format!("read program {}", program.display()))?;
    let sandbox = SandboxExecutor::new(cfg.sandbox_config())?;

    let outcome = sandbox
        .evaluate(
            &CandidateProgram::from(source),
            &task.inputs(),
            cfg.search_options().eval_deadline,
        )
        .await;
    let scorer = ExactMatchScorer;
    let score = scorer.score(&outcome, &task.expected_outputs());
    let solved = scorer.is_solved(&score);
    print_json(&EvalReport {
        outcome,
        score,
        solved,
    })?;
    Ok(if solved {
        exit_codes::OK
    } else {
        exit_codes::UNSOLVED
    })
}

async fn cmd_run(task: &Path, plan: &Path, config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let task = load_task(task)?;
    let plan = load_plan(plan)?;
    let generator = CommandGenerator::new(cfg.generator.clone())?;
    let sandbox = SandboxExecutor::new(cfg.sandbox_config())?;
    let scorer = ExactMatchScorer;

    let search = Search::new(&task, &generator, &sandbox, &scorer, cfg.search_options());
    let outcome = search.run(&plan).await?;
    info!(termination = ?outcome.termination, nodes = outcome.nodes.len(), "run complete");
    print_json(&outcome)?;
    Ok(if outcome.solved.is_some() {
        exit_codes::OK
    } else {
        exit_codes::UNSOLVED
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
