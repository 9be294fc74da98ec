//! Autonomous multi-feature project driver.
//!
//! Keeps a feature manifest (`.autopilot/manifest.json`) and drives an external
//! coding agent through it one feature at a time (`run`) or with bounded
//! parallelism (`supervise`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use autopilot::core::selector::{BlockedFeature, NoWorkReport};
use autopilot::core::types::{FeatureStatus, ModelTier};
use autopilot::exit_codes;
use autopilot::io::config::{AutopilotConfig, load_config};
use autopilot::io::executor::CommandExecutor;
use autopilot::io::generate::PlanOptions;
use autopilot::io::init::{InitOptions, ProjectPaths, init_project};
use autopilot::logging;
use autopilot::manage::{set_tier, spawn_child};
use autopilot::plan::plan_project;
use autopilot::select::{NextOutcome, load_project_manifest, next_feature, run_order, status_report};
use autopilot::step::{StepOutcome, run_step};
use autopilot::supervise::run_supervise;
use autopilot::validate::validate_project;

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Autonomous multi-feature project driver"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autopilot/` with a default config.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Generate the manifest from a feature-drafts document.
    Plan {
        source: PathBuf,
        /// Replace an existing manifest.
        #[arg(short, long)]
        force: bool,
    },
    /// Check config, manifest and dependencies.
    Validate,
    /// Print the dependency order of all features.
    Order,
    /// Print the next runnable feature, or why there is none.
    Next,
    /// Print a summary of feature states.
    Status {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Add a child feature under an existing feature.
    Spawn {
        parent: String,
        title: String,
        /// Explicit context budget; defaults to half the parent's.
        #[arg(long)]
        context_budget: Option<u64>,
    },
    /// Pin a feature to a model tier.
    Tier {
        id: String,
        #[arg(value_parser = parse_tier)]
        tier: ModelTier,
    },
    /// Run one attempt on the next runnable feature.
    Run,
    /// Run attempts with up to `max_parallel` workers until nothing is runnable.
    Supervise,
}

fn parse_tier(raw: &str) -> Result<ModelTier, String> {
    ModelTier::from_name(raw).ok_or_else(|| format!("unknown tier '{raw}'"))
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("read current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Plan { source, force } => cmd_plan(&root, &source, force),
        Command::Validate => cmd_validate(&root),
        Command::Order => cmd_order(&root),
        Command::Next => cmd_next(&root),
        Command::Status { json } => cmd_status(&root, json),
        Command::Spawn {
            parent,
            title,
            context_budget,
        } => cmd_spawn(&root, &parent, &title, context_budget),
        Command::Tier { id, tier } => cmd_tier(&root, &id, tier),
        Command::Run => cmd_run(&root),
        Command::Supervise => cmd_supervise(&root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_plan(root: &Path, source: &Path, force: bool) -> Result<i32> {
    let outcome = plan_project(root, source, &PlanOptions { force })?;
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    for feature in &outcome.manifest.features {
        println!("{}  {}", feature.id, feature.title);
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let outcome = validate_project(root)?;
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!("ok: {} features", outcome.features);
    Ok(exit_codes::OK)
}

fn cmd_order(root: &Path) -> Result<i32> {
    let manifest = load_project_manifest(&ProjectPaths::new(root))?;
    for id in run_order(&manifest)? {
        println!("{id}");
    }
    Ok(exit_codes::OK)
}

fn cmd_next(root: &Path) -> Result<i32> {
    let manifest = load_project_manifest(&ProjectPaths::new(root))?;
    match next_feature(&manifest) {
        NextOutcome::Runnable(line) => println!("{}  {}", line.id, line.title),
        NextOutcome::NoWork(report) => print_no_work(&report),
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, json: bool) -> Result<i32> {
    let manifest = load_project_manifest(&ProjectPaths::new(root))?;
    let report = status_report(&manifest);
    if json {
        let payload = serde_json::to_string_pretty(&report).context("serialize status")?;
        println!("{payload}");
        return Ok(exit_codes::OK);
    }
    let summary = report.summary;
    println!("{}", report.title);
    println!(
        "total {}  completed {}  running {}  failed {}  pending {}  blocked {}",
        summary.total,
        summary.completed,
        summary.running,
        summary.failed,
        summary.pending,
        summary.blocked
    );
    for line in &report.features {
        let indent = "  ".repeat(line.depth as usize);
        println!(
            "{indent}{:<10} {:<9} {:<6} {}",
            line.id,
            line.status.as_str(),
            line.model.as_str(),
            line.title
        );
    }
    print_blocked(&report.blocked);
    Ok(exit_codes::OK)
}

fn cmd_spawn(root: &Path, parent: &str, title: &str, context_budget: Option<u64>) -> Result<i32> {
    let id = spawn_child(&ProjectPaths::new(root), parent, title, context_budget)?;
    println!("{id}");
    Ok(exit_codes::OK)
}

fn cmd_tier(root: &Path, id: &str, tier: ModelTier) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    let config = load_config(&paths.config_path).with_context(|| "load config.toml")?;
    match set_tier(&paths, &config, id, tier)? {
        Some(switch) => println!("{id}: {} -> {}", switch.from, switch.to),
        None => println!("{id}: already {tier}"),
    }
    Ok(exit_codes::OK)
}

fn command_executor(paths: &ProjectPaths) -> Result<(AutopilotConfig, CommandExecutor)> {
    let config = load_config(&paths.config_path).with_context(|| "load config.toml")?;
    let executor = CommandExecutor::new(config.agent.command.clone(), config.attempt_timeout());
    Ok((config, executor))
}

fn cmd_run(root: &Path) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    let (config, executor) = command_executor(&paths)?;
    let outcome = run_step(&paths, &config, &executor)?;
    match &outcome {
        StepOutcome::NoWork(report) => print_no_work(report),
        StepOutcome::Completed {
            feature_id,
            archived,
        } => {
            println!("{feature_id}: completed");
            if let Some(archived) = archived {
                println!("all features completed; source archived to {}", archived.display());
            }
        }
        StepOutcome::Failed {
            feature_id,
            decision,
        } => {
            if decision.should_retry {
                println!(
                    "{feature_id}: failed, will retry ({}, {} retries left)",
                    decision.reason, decision.remaining_retries
                );
            } else {
                println!("{feature_id}: failed ({})", decision.reason);
            }
        }
    }
    Ok(outcome.exit_code())
}

fn cmd_supervise(root: &Path) -> Result<i32> {
    let paths = ProjectPaths::new(root);
    let (config, executor) = command_executor(&paths)?;
    let report = run_supervise(&paths, &config, &executor)?;
    println!("{} attempts", report.attempts);
    print_no_work(&report.finished);
    if !report.failed.is_empty() {
        println!("failed: {}", report.failed.join(", "));
    }
    if let Some(archived) = &report.archived {
        println!("source archived to {}", archived.display());
    }
    Ok(report.exit_code())
}

fn print_no_work(report: &NoWorkReport) {
    let summary = report.summary;
    println!(
        "no runnable feature: {} ({} of {} completed)",
        report.status, summary.completed, summary.total
    );
    print_blocked(&report.blocked);
}

fn print_blocked(blocked: &[BlockedFeature]) {
    for feature in blocked {
        if feature.status == FeatureStatus::Unknown {
            println!("  {} has an unrecognized status", feature.id);
            if feature.unmet.is_empty() {
                continue;
            }
        }
        let unmet: Vec<String> = feature
            .unmet
            .iter()
            .map(|dep| match dep.status {
                Some(status) => format!("{} ({status})", dep.id),
                None => format!("{} (missing)", dep.id),
            })
            .collect();
        println!("  {} waits on {}", feature.id, unmet.join(", "));
    }
}
