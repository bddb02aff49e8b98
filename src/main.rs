//! chunkwise CLI - Resumable, rate-limited chunk-processing for long documents.

use anyhow::{Context, Result, bail};
use chunkwise::{
    Config, Document, FileCheckpointStore, FileResultStore, LLMClient, Pipeline, ReportFormat,
    ReportWriter, ResultStore, RunReport,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "chunkwise")]
#[command(version)]
#[command(about = "Resumable, rate-limited chunk-processing pipeline for long-document analysis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "chunkwise.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a document through the stage graph (resumes automatically)
    Run {
        /// Path to the extracted document text
        #[arg(short, long)]
        input: PathBuf,

        /// Run identity (overrides run.id and the input file stem)
        #[arg(long)]
        run_id: Option<String>,

        /// Also write the assembled report here when the run completes
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Report format for --output
        #[arg(long, default_value = "markdown")]
        format: ReportFormat,
    },

    /// Show checkpoint progress for a document
    Status {
        /// Path to the extracted document text
        #[arg(short, long)]
        input: PathBuf,

        /// Run identity (overrides run.id and the input file stem)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Assemble persisted stage outputs into one file
    Report {
        /// Path to the extracted document text (names the run)
        #[arg(short, long)]
        input: PathBuf,

        /// Run identity (overrides run.id and the input file stem)
        #[arg(long)]
        run_id: Option<String>,

        /// Path to the output file
        #[arg(short, long)]
        output: PathBuf,

        /// Output format (markdown or jsonl)
        #[arg(long, default_value = "markdown")]
        format: ReportFormat,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# chunkwise configuration file

[run]
# id = "acme-10k-2023"        # defaults to the input file stem
store_dir = "runs"

[chunking]
max_chunk_size = 12000        # characters

[rate_limit]
token_ceiling = 30000
request_ceiling = 30
window_secs = 60
chars_per_token = 4

[retry]
max_retries = 3               # retries after the first attempt
backoff_secs = 60

[concurrency]
chunk_concurrency = 1         # 1 = strictly sequential chunks
stage_workers = 4

[endpoint]
base_url = "https://api.openai.com/v1"
# api_key = "${OPENAI_API_KEY}"
api_key_env = "OPENAI_API_KEY"
model = "gpt-4o"
timeout_secs = 180
max_tokens = 4096
temperature = 0.2

[[phases]]
stages = [{ name = "Planner", prompt = "Outline what this excerpt of the filing covers." }]

[[phases]]
stages = [
    { name = "FinancialStatementsExpert", prompt_file = "prompts/financials.md" },
    { name = "RiskFactorsExpert", prompt_file = "prompts/risk.md" },
]
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load config from {path:?}"))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Directory holding prompt files referenced by the config.
fn config_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn build_pipeline(
    config: &Config,
    config_path: &Path,
    run_id: &str,
    show_progress: bool,
) -> Result<(Pipeline, Arc<LLMClient>)> {
    let graph = config
        .build_graph(&config_dir(config_path))
        .context("Failed to build stage graph")?;

    let api_key = config.resolve_api_key();
    if api_key.is_none() {
        warn!(
            env_var = %config.endpoint.api_key_env,
            "No API key configured; requests are sent unauthenticated"
        );
    }
    let client = Arc::new(LLMClient::from_config(&config.endpoint, api_key)?);

    let run_dir = config.run.store_dir.join(run_id);
    let checkpoints = Arc::new(FileCheckpointStore::new(&run_dir)?);
    let results = Arc::new(FileResultStore::new(&run_dir.join("results"))?);

    let pipeline = Pipeline::builder(graph, client.clone())
        .config(config)
        .run_id(run_id)
        .checkpoint_store(checkpoints)
        .result_store(results)
        .show_progress(show_progress)
        .build()?;
    Ok((pipeline, client))
}

fn resolve_run_id(config: &Config, cli_run_id: Option<String>, input: &Path) -> String {
    cli_run_id.unwrap_or_else(|| config.run_id_for(input))
}

fn print_report(title: &str, report: &RunReport) {
    println!("\n=== {title} ===");
    println!("Run:         {}", report.run_id);
    println!(
        "Chunks:      {} / {} complete",
        report.chunks_completed, report.chunks_total
    );
    println!("Checkpoint:  {}", report.last_completed_chunk_index);
    println!(
        "Pairs:       {} / {} succeeded ({:.1}%)",
        report.succeeded,
        report.pairs_total,
        report.progress_percent()
    );
    println!("Executed:    {}", report.executed);
    println!("Failed:      {}", report.failed.len());
    for failure in &report.failed {
        println!("  - {failure}");
    }
    if report.runtime_secs > 0.0 {
        println!("Runtime:     {:.1}s", report.runtime_secs);
    }
}

async fn write_report(
    pipeline_results: &dyn ResultStore,
    graph: &chunkwise::StageGraph,
    output: &Path,
    format: ReportFormat,
    run_id: &str,
) -> Result<usize> {
    let results = pipeline_results.list().await?;
    ReportWriter::new(graph)
        .write(output, format, run_id, &results)
        .with_context(|| format!("Failed to write report to {output:?}"))?;
    Ok(results.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let graph = config
                .build_graph(&config_dir(&cli.config))
                .context("Failed to build stage graph")?;

            info!("Configuration is valid");
            info!(
                "  Stage graph: {} phases, {} stages",
                graph.phases().len(),
                graph.stage_count()
            );
            info!(
                "  Rate limit: {} tokens / {} requests per {}s",
                config.rate_limit.token_ceiling,
                config.rate_limit.request_ceiling,
                config.rate_limit.window_secs
            );
            info!(
                "  Concurrency: {} chunks, {} stage workers",
                config.concurrency.chunk_concurrency, config.concurrency.stage_workers
            );
            if config.resolve_api_key().is_none() {
                warn!(
                    env_var = %config.endpoint.api_key_env,
                    "No API key found; fine for local endpoints"
                );
            }
            return Ok(());
        }

        Commands::Run {
            input,
            run_id,
            output,
            format,
        } => {
            let config = load_config(&cli.config)?;
            let run_id = resolve_run_id(&config, run_id, &input);
            let document = Document::from_file(&input)?;
            let (pipeline, client) = build_pipeline(&config, &cli.config, &run_id, true)?;

            let cancel = pipeline.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after in-flight work");
                    cancel.cancel();
                }
            });

            let report = pipeline.run(&document).await?;
            print_report("Run Summary", &report);
            let (input_tokens, output_tokens) = client.total_tokens();
            println!("Tokens:      {input_tokens} in / {output_tokens} out");

            if report.interrupted {
                bail!("Run interrupted; rerun the same command to resume");
            }
            if !report.failed.is_empty() {
                bail!(
                    "{} pair(s) failed; rerun the same command to retry them",
                    report.failed.len()
                );
            }

            if let Some(output) = output {
                let count = write_report(
                    pipeline.results().as_ref(),
                    pipeline.graph(),
                    &output,
                    format,
                    &run_id,
                )
                .await?;
                println!("Output:      {output:?} ({count} results)");
            }
        }

        Commands::Status { input, run_id } => {
            let config = load_config(&cli.config)?;
            let run_id = resolve_run_id(&config, run_id, &input);
            let document = Document::from_file(&input)?;
            let (pipeline, _) = build_pipeline(&config, &cli.config, &run_id, false)?;

            let report = pipeline.status(&document).await?;
            print_report("Checkpoint Status", &report);
        }

        Commands::Report {
            input,
            run_id,
            output,
            format,
        } => {
            let config = load_config(&cli.config)?;
            let run_id = resolve_run_id(&config, run_id, &input);
            let graph = config
                .build_graph(&config_dir(&cli.config))
                .context("Failed to build stage graph")?;
            let results =
                FileResultStore::new(&config.run.store_dir.join(&run_id).join("results"))?;

            let count = write_report(&results, &graph, &output, format, &run_id).await?;
            println!("Wrote {count} results to {output:?}");
        }
    }

    Ok(())
}
