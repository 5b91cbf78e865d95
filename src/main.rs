use anyhow::{anyhow, Context, Result};
use chunkwise::artifacts::ArtifactStore;
use chunkwise::config::{RunConfig, SizingPolicy};
use chunkwise::error::RunError;
use chunkwise::extract::extract_with_strategy;
use chunkwise::git_ops;
use chunkwise::logging::init_logging;
use chunkwise::oracle::ProcessTransport;
use chunkwise::orchestrator::{verify, Orchestrator, RunReport, RunStatus, Verification};
use chunkwise::record::Record;
use chunkwise::source::{fetch_records, load_records, prepare};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

const EXIT_INCOMPLETE: i32 = 1;
const EXIT_FATAL: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "chunkwise",
    about = "Push a record set through an external transformation process in adaptive batches",
    version
)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transform every input record, resuming from an existing output
    Run(RunArgs),
    /// Compare an output file against the input without calling the oracle
    Verify(VerifyArgs),
    /// Run the reply extractor on a saved oracle response
    Extract(ExtractArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Fetch the input set from this URL
    #[arg(long, conflicts_with = "input")]
    source_url: Option<String>,
    /// Read the input set from this JSON file
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    artifact_dir: Option<PathBuf>,
    #[arg(long)]
    seed_size: Option<usize>,
    /// Step down by one on every failure instead of bisecting
    #[arg(long)]
    linear: bool,
    /// Skip committing and pushing the output even if enabled in the config
    #[arg(long)]
    no_publish: bool,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    artifact_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let code = match cli.command {
        Commands::Run(args) => run_command(args).await?,
        Commands::Verify(args) => verify_command(args)?,
        Commands::Extract(args) => extract_command(args)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_command(args: RunArgs) -> Result<i32> {
    let mut config = RunConfig::load(args.config.as_deref())?;
    if let Some(url) = args.source_url {
        config.source.url = Some(url);
    }
    if let Some(output) = args.output {
        config.output.path = output;
    }
    if let Some(dir) = args.artifact_dir {
        config.output.artifact_dir = dir;
    }
    if let Some(seed) = args.seed_size {
        config.sizing.seed_size = seed;
    }
    if args.linear {
        config.sizing.policy = SizingPolicy::LinearDecrement;
    }
    if args.no_publish {
        config.publish.enabled = false;
    }
    config.validate()?;

    let records = match (&args.input, &config.source.url) {
        (Some(path), _) => load_records(path)?,
        (None, Some(url)) => fetch_records(url).await?,
        (None, None) => {
            return Err(anyhow!(
                "No input: pass --input or --source-url, or set source.url in the config"
            ))
        }
    };
    let records = prepare(records, config.source.sanitize_ids);

    let transport = ProcessTransport::from_config(&config.oracle);
    let run_config = config.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<RunReport, RunError> {
        let mut orchestrator = Orchestrator::new(run_config, transport, records)?;
        orchestrator.run()
    })
    .await
    .context("Run thread panicked")?;

    let report = match outcome {
        Ok(report) => report,
        Err(err @ RunError::FatalOracle { .. }) => {
            eprintln!("Error: {}", err);
            return Ok(EXIT_FATAL);
        }
        Err(err) => return Err(err.into()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    match report.status {
        RunStatus::Complete => {
            if config.publish.enabled {
                let publish = config.publish.clone();
                let output = config.output.path.clone();
                let published = tokio::task::spawn_blocking(move || git_ops::publish(&publish, &output))
                    .await
                    .context("Publish thread panicked")??;
                println!("Published: {} ({})", published.branch, published.commit);
            }
            Ok(0)
        }
        RunStatus::Incomplete => Ok(EXIT_INCOMPLETE),
    }
}

fn verify_command(args: VerifyArgs) -> Result<i32> {
    let mut config = RunConfig::load(args.config.as_deref())?;
    if let Some(output) = args.output {
        config.output.path = output;
    }
    if let Some(dir) = args.artifact_dir {
        config.output.artifact_dir = dir;
    }

    let records: Vec<Record> = prepare(load_records(&args.input)?, config.source.sanitize_ids);
    let verification = verify(&records, &config.output.path)?;
    print_verification(&verification);

    let artifacts = ArtifactStore::new(&config.output.artifact_dir, Uuid::new_v4());
    if verification.is_complete() {
        artifacts.clear_unresolved()?;
        Ok(0)
    } else {
        let path = artifacts.write_unresolved(&verification.unresolved)?;
        println!("Unresolved ids: {}", path.display());
        Ok(EXIT_INCOMPLETE)
    }
}

fn extract_command(args: ExtractArgs) -> Result<i32> {
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read '{}'", args.file.display()))?;
    match extract_with_strategy(&raw) {
        Some(extraction) => {
            println!("Strategy: {}", extraction.strategy.label());
            println!("Records: {}", extraction.records.len());
            for record in &extraction.records {
                println!("  {}", record.id);
            }
            Ok(0)
        }
        None => {
            println!("No records could be extracted");
            Ok(EXIT_INCOMPLETE)
        }
    }
}

fn print_report(report: &RunReport) {
    println!("Run ID: {}", report.run_id);
    println!("Records: {} ({} resumed)", report.total, report.resumed);
    println!(
        "Main pass: {} batches, {} deferred",
        report.main_pass.batches,
        report.main_pass.deferred.len()
    );
    match report.main_pass.converged_size {
        Some(size) => println!("Batch size: {} ({} probes)", size, report.main_pass.probes),
        None => println!("Batch size: not settled"),
    }
    println!(
        "Reconciliation: {} rounds, {} recovered",
        report.reconcile.rounds, report.reconcile.recovered
    );
    println!("Oracle calls: {}", report.oracle_calls);
    print_verification(&report.verification);
    if let Some(path) = &report.unresolved_path {
        println!("Unresolved ids: {}", path.display());
    }
}

fn print_verification(verification: &Verification) {
    println!(
        "Present: {}/{}",
        verification.present, verification.expected
    );
    if !verification.unresolved.is_empty() {
        println!("Missing: {}", verification.unresolved.len());
    }
    for group in &verification.collisions {
        println!("Ambiguous ids: {}", group.join(", "));
    }
    if verification.duplicate_outputs > 0 {
        println!("Duplicate outputs: {}", verification.duplicate_outputs);
    }
}
