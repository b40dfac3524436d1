//! CLI command definitions for mlp-forge.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::{load_config, ForgeConfig, WorkflowConfig};
use crate::metrics::{export_metrics, init_metrics};
use crate::resource::ResourceManager;
use crate::stage::{CommandExplorer, CommandLabeler, CommandTrainer, ThresholdSelector};
use crate::workflow::{IterationEngine, Stages};

/// File the run summary is written to, under the run's workspace.
const SUMMARY_FILE: &str = "summary.json";

type DefaultEngine = IterationEngine<CommandLabeler, CommandTrainer, CommandExplorer, ThresholdSelector>;

/// Active-learning loop orchestrator for machine-learning potentials.
#[derive(Parser)]
#[command(name = "mlp-forge")]
#[command(about = "Run label/train/explore/select iterations across parallel branches")]
#[command(version)]
#[command(
    long_about = "mlp-forge drives an active-learning loop: every iteration labels the structures selected in the previous one, trains a model ensemble per branch, explores with the models of all branches, and selects new candidates by model deviation.\n\nExample usage:\n  mlp-forge run base.yml h2o.yml --executor hpc --path-prefix runs/h2o"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the workflow until max_iters is reached.
    Run(RunArgs),

    /// Load and check configuration without submitting any job.
    #[command(alias = "check")]
    Validate(ValidateArgs),
}

/// Arguments for `mlp-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Configuration files, merged in order.
    #[arg(required = true)]
    pub config: Vec<PathBuf>,

    /// Executor to run on.
    #[arg(short = 'e', long, env = "MLP_FORGE_EXECUTOR")]
    pub executor: String,

    /// Workspace subpath of this run, relative to the executor work dir.
    #[arg(short = 'p', long)]
    pub path_prefix: String,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

/// Arguments for `mlp-forge validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Configuration files, merged in order.
    #[arg(required = true)]
    pub config: Vec<PathBuf>,

    /// Executor to check against.
    #[arg(short = 'e', long, env = "MLP_FORGE_EXECUTOR")]
    pub executor: String,

    /// Output the result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_workflow_command(args).await,
        Commands::Validate(args) => run_validate_command(args),
    }
}

fn build_engine(config: &ForgeConfig, executor: &str, path_prefix: &str) -> anyhow::Result<DefaultEngine> {
    config.check_entry(executor, path_prefix)?;
    let resource_manager = Arc::new(ResourceManager::from_config(config, executor)?);
    let context = &config.executor(executor)?.context;
    let stages = Stages {
        labeler: CommandLabeler,
        trainer: CommandTrainer,
        explorer: CommandExplorer,
        selector: ThresholdSelector,
    };
    Ok(IterationEngine::new(
        stages,
        resource_manager,
        context,
        &config.workflow,
        path_prefix,
    )?)
}

async fn run_workflow_command(args: RunArgs) -> anyhow::Result<()> {
    if args.metrics_out.is_some() {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    }

    let config = load_config(&args.config)?;
    let engine = build_engine(&config, &args.executor, &args.path_prefix)?;
    let work_dir = config.executor(&args.executor)?.work_dir.clone();

    info!(
        executor = %args.executor,
        path_prefix = %args.path_prefix,
        configs = args.config.len(),
        "Starting workflow"
    );
    let result = engine.run().await;

    if let Some(path) = &args.metrics_out {
        std::fs::write(path, export_metrics())
            .map_err(|e| anyhow::anyhow!("Failed to write metrics to {}: {}", path.display(), e))?;
    }

    let summary = result?;
    let summary_path = work_dir.join(&args.path_prefix).join(SUMMARY_FILE);
    summary.write_json(&summary_path)?;
    info!(
        iterations = summary.iterations_completed(),
        summary = %summary_path.display(),
        "Workflow finished"
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct ValidateOutput {
    status: String,
    executor: String,
    branches: Vec<String>,
    max_iters: usize,
    update_table: usize,
    artifacts: Vec<String>,
}

fn run_validate_command(args: ValidateArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    // Any non-empty prefix passes the entry check; nothing is written.
    build_engine(&config, &args.executor, "validate")?;

    let workflow = WorkflowConfig::from_value(&config.workflow)?;
    let output = ValidateOutput {
        status: "valid".to_string(),
        executor: args.executor.clone(),
        branches: workflow.branch_names().into_iter().map(str::to_string).collect(),
        max_iters: workflow.general.max_iters,
        update_table: workflow.update.walkthrough.table.len(),
        artifacts: config.catalog().names().into_iter().map(str::to_string).collect(),
    };

    if args.json {
        let json_output = serde_json::to_string_pretty(&output)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
        return Ok(());
    }

    println!("Configuration is valid");
    println!("  Files:     {}", display_paths(&args.config));
    println!("  Executor:  {}", output.executor);
    println!("  Branches:  {}", output.branches.join(", "));
    println!("  Max iters: {}", output.max_iters);
    println!("  Updates:   {}", output.update_table);
    println!("  Artifacts: {}", output.artifacts.len());
    Ok(())
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_args() {
        let cli = Cli::try_parse_from([
            "mlp-forge",
            "run",
            "base.yml",
            "h2o.yml",
            "--executor",
            "hpc",
            "--path-prefix",
            "runs/h2o",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, vec![PathBuf::from("base.yml"), PathBuf::from("h2o.yml")]);
                assert_eq!(args.executor, "hpc");
                assert_eq!(args.path_prefix, "runs/h2o");
                assert!(args.metrics_out.is_none());
            }
            Commands::Validate(_) => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_requires_config_files() {
        assert!(Cli::try_parse_from(["mlp-forge", "run", "--executor", "hpc", "--path-prefix", "x"]).is_err());
    }

    #[test]
    fn test_build_engine_rejects_bad_entry() {
        let value = serde_yaml::from_str(
            "executors: {hpc: {work_dir: /tmp}}\n\
             workflow:\n  general: {type_map: [H], mass_map: [1.0]}\n  branches: {a: {}}\n",
        )
        .unwrap();
        let config = ForgeConfig::from_value(value).unwrap();

        assert!(build_engine(&config, "cloud", "runs/x").is_err());
        assert!(build_engine(&config, "hpc", "").is_err());
    }
}
