//! support-qa CLI
//!
//! Run with: cargo run -- run
//! Or one stage at a time: generate, analyze, verify, evaluate

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use support_qa::{
    config::{ensure_distinct, PRIMARY_ENV_PREFIX, VERIFIER_ENV_PREFIX},
    eval::{print_comparison, print_evaluation_report},
    generate::Distribution,
    logging,
    pipeline::available_prediction_files,
    records::{load_json, DatasetRecord},
    ChatModel, HttpChatModel, ModelConfig, PipelineConfig, Shutdown, StageSummary,
};

/// Support chat quality assessment pipeline
#[derive(Parser, Debug)]
#[command(name = "support-qa")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding dataset, analysis and evaluation files
    #[arg(long, global = true, env = "SUPPORT_QA_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Concurrent model calls
    #[arg(long, global = true, default_value_t = 5)]
    workers: usize,

    /// Attempts per model call, including the first
    #[arg(long, global = true, default_value_t = 3)]
    max_attempts: u32,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize the labelled dataset
    Generate,
    /// Three-round consensus analysis of every dialog
    Analyze {
        /// Store the raw rounds next to each consensus (default)
        #[arg(long, overrides_with = "no_raw")]
        keep_raw: bool,
        /// Do not store the raw rounds
        #[arg(long, overrides_with = "keep_raw")]
        no_raw: bool,
    },
    /// Checklist verification of the consensus with a second model
    Verify,
    /// Score predictions against ground truth
    Evaluate {
        /// Prediction file to score (default: every available one)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// generate, analyze, verify and evaluate in sequence
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = logging::init_tracing(cli.verbose, cli.log_json) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let mut config = PipelineConfig {
        data_dir: cli.data_dir.clone(),
        workers: cli.workers,
        ..PipelineConfig::default()
    };
    config.retry.max_attempts = cli.max_attempts.max(1);

    let shutdown = Shutdown::new();
    shutdown.listen_for_ctrl_c();

    match cli.command {
        Commands::Generate => run_generate(&config, &shutdown).await,
        Commands::Analyze { no_raw, .. } => {
            config.keep_raw_rounds = !no_raw;
            run_analyze(&config, &shutdown).await
        }
        Commands::Verify => run_verify(&config, &shutdown).await,
        Commands::Evaluate { file } => run_evaluate(&config, file),
        Commands::Run => run_all(&config, &shutdown).await,
    }
}

fn primary_config() -> Result<ModelConfig> {
    ModelConfig::from_env(PRIMARY_ENV_PREFIX, ModelConfig::default())
        .context("reading primary model configuration")
}

fn verifier_config() -> Result<ModelConfig> {
    ModelConfig::from_env(VERIFIER_ENV_PREFIX, ModelConfig::verifier_default())
        .context("reading verifier model configuration")
}

fn connect(config: ModelConfig) -> Result<Arc<dyn ChatModel>> {
    let model: Arc<dyn ChatModel> =
        Arc::new(HttpChatModel::new(config).context("configuring model client")?);
    Ok(model)
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}

/// Run one stage under a banner and report how long it took
async fn timed<T, F>(label: &str, stage: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    println!("\n{}", "=".repeat(65));
    println!("  {}", label.to_uppercase());
    println!("{}", "=".repeat(65));

    let start = Instant::now();
    let result = stage.await;
    println!("\n[{}] completed in {}", label, format_elapsed(start.elapsed()));
    result
}

async fn run_generate(config: &PipelineConfig, shutdown: &Shutdown) -> Result<()> {
    let model = connect(primary_config()?)?;
    let summary = timed("generate", async {
        Ok(support_qa::generate_stage(config, model, shutdown).await?)
    })
    .await?;
    summary.print("generate");
    check_interrupted(shutdown, &summary)?;

    let dataset: Vec<DatasetRecord> =
        load_json(&summary.output).context("reading generated dataset")?;
    Distribution::of(&dataset).print();
    Ok(())
}

async fn run_analyze(config: &PipelineConfig, shutdown: &Shutdown) -> Result<()> {
    let model = connect(primary_config()?)?;
    let summary = timed("analyze", async {
        Ok(support_qa::analyze_stage(config, model, shutdown).await?)
    })
    .await?;
    summary.print("analyze");
    check_interrupted(shutdown, &summary)
}

async fn run_verify(config: &PipelineConfig, shutdown: &Shutdown) -> Result<()> {
    let primary = primary_config()?;
    let verifier = verifier_config()?;
    ensure_distinct(&primary, &verifier)?;

    let model = connect(verifier)?;
    let summary = timed("verify", async {
        Ok(support_qa::verify_stage(config, model, shutdown).await?)
    })
    .await?;
    summary.print("verify");
    check_interrupted(shutdown, &summary)
}

fn run_evaluate(config: &PipelineConfig, file: Option<PathBuf>) -> Result<()> {
    let files = match file {
        Some(path) => vec![path],
        None => available_prediction_files(config),
    };
    if files.is_empty() {
        println!("No analysis files found. Run analyze first.");
        return Ok(());
    }

    let start = Instant::now();
    let mut outputs = Vec::with_capacity(files.len());
    for path in &files {
        let output = support_qa::evaluate_stage(config, path)
            .with_context(|| format!("evaluating {}", path.display()))?;
        print_evaluation_report(&output);
        outputs.push(output);
    }
    print_comparison(&outputs);
    println!("[evaluate] completed in {}", format_elapsed(start.elapsed()));
    Ok(())
}

async fn run_all(config: &PipelineConfig, shutdown: &Shutdown) -> Result<()> {
    let start = Instant::now();

    // Fail on a misconfigured verifier before spending calls on the rest
    let primary = primary_config()?;
    ensure_distinct(&primary, &verifier_config()?)?;

    run_generate(config, shutdown).await?;
    run_analyze(config, shutdown).await?;
    run_verify(config, shutdown).await?;
    run_evaluate(config, None)?;

    println!("\n{}", "=".repeat(65));
    println!("  PIPELINE COMPLETE | Total time: {}", format_elapsed(start.elapsed()));
    println!("{}", "=".repeat(65));
    Ok(())
}

/// An interrupted stage leaves partial output; later stages must not run on it
fn check_interrupted(shutdown: &Shutdown, summary: &StageSummary) -> Result<()> {
    if shutdown.is_triggered() {
        anyhow::bail!(
            "interrupted: {} of {} records written to {}",
            summary.succeeded + summary.failed,
            summary.total,
            summary.output.display()
        );
    }
    Ok(())
}
