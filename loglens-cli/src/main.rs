//! LogLens CLI - ingest access logs and run aggregations from the shell

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use loglens_core::analytics;
use loglens_core::engine::{EngineConfig, LogEngine};
use loglens_core::query::{AggregationJob, AggregationResult};
use loglens_core::sink::{self, OutputFormat};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "loglens", version, about = "Access-log ingestion and aggregation")]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true, env = "LOGLENS_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory, overrides the config file
    #[arg(short, long, global = true, env = "LOGLENS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest a log file, or stdin with `-`
    Ingest {
        input: PathBuf,
        /// Writer threads
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Run an aggregation job from a JSON file
    Query {
        job: PathBuf,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Most requested pages
    TopPages {
        #[arg(short, default_value_t = 10)]
        k: usize,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// List partitions
    Partitions,
    /// Store statistics
    Stats,
}

#[derive(Debug, clap::Args)]
struct OutputArgs {
    /// Persist the result at this storage path instead of printing it
    #[arg(short, long)]
    out: Option<String>,

    #[arg(short, long, value_enum)]
    format: Option<Format>,

    /// Field delimiter; implies delimited output
    #[arg(long)]
    delimiter: Option<char>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Delimited,
    Json,
}

impl OutputArgs {
    fn apply(&self, config: &mut EngineConfig) {
        let configured = match config.output {
            OutputFormat::Delimited { delimiter } => delimiter,
            OutputFormat::Json => loglens_core::config::DEFAULT_DELIMITER,
        };
        config.output = match (self.format, self.delimiter) {
            (Some(Format::Json), _) => OutputFormat::Json,
            (Some(Format::Delimited), delimiter) => OutputFormat::Delimited {
                delimiter: delimiter.unwrap_or(configured),
            },
            (None, Some(delimiter)) => OutputFormat::Delimited { delimiter },
            (None, None) => return,
        };
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }

    match cli.command {
        Command::Ingest { input, workers } => {
            if let Some(workers) = workers {
                config.ingest.workers = workers;
            }
            let engine = LogEngine::open(config)?;
            let report = if input.as_os_str() == "-" {
                engine.ingest_reader(io::stdin().lock())?
            } else {
                let file = File::open(&input).with_context(|| format!("opening {}", input.display()))?;
                engine.ingest_reader(BufReader::new(file))?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Query { job, output } => {
            let text = std::fs::read_to_string(&job).with_context(|| format!("reading {}", job.display()))?;
            let job = AggregationJob::from_json(&text)?;
            output.apply(&mut config);
            run_job(config, &job, &output).await?;
        }
        Command::TopPages { k, output } => {
            output.apply(&mut config);
            run_job(config, &analytics::top_pages(k), &output).await?;
        }
        Command::Partitions => {
            let engine = LogEngine::open(config)?;
            for partition in engine.list_partitions() {
                println!("{}", partition);
            }
        }
        Command::Stats => {
            let engine = LogEngine::open(config)?;
            println!("{}", serde_json::to_string_pretty(&engine.stats()?)?);
        }
    }
    Ok(())
}

async fn run_job(config: EngineConfig, job: &AggregationJob, output: &OutputArgs) -> anyhow::Result<()> {
    let format = config.output.clone();
    let engine = LogEngine::open(config)?;
    match &output.out {
        Some(destination) => {
            let result = engine.query_into(job, destination).await?;
            eprintln!("{} rows written to {}", result.rows.len(), destination);
        }
        None => {
            let result = engine.query(job).await?;
            print_result(&result, &format)?;
        }
    }
    Ok(())
}

fn print_result(result: &AggregationResult, format: &OutputFormat) -> anyhow::Result<()> {
    let bytes = sink::render(result, format)?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(&bytes)?;
    if matches!(format, OutputFormat::Json) {
        writeln!(stdout)?;
    }
    Ok(())
}
