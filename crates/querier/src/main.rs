use anyhow::{Context, Result};
use bench_core::{
    BatchExecutor, Config, HttpQuery, HttpQueryExecutor, JsonLinesSource, JsonReport,
    MockExecutor, Pipeline, QueryBatch, QueryBatchBuilder, ReportSink, TextReport,
};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "querier")]
#[command(about = "Query benchmarker - replays decoded queries and reports latency per label")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.query.toml")]
    config: PathBuf,

    /// Execution mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Query file, one JSON object per line (defaults to stdin)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Number of concurrent workers (overrides config)
    #[arg(long)]
    workers: Option<usize>,

    /// Queries per batch (overrides config)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Stop after this many queries (overrides config)
    #[arg(long)]
    limit: Option<u64>,

    /// Run every query a second time and report it under "<label>_warm"
    #[arg(long)]
    warm_run: bool,

    /// Discard this many leading measurements (overrides config)
    #[arg(long)]
    burn_in: Option<u64>,

    /// Log intermediate statistics every N milliseconds (overrides config)
    #[arg(long)]
    print_every_ms: Option<u64>,

    /// Write a JSON report into this directory (overrides config)
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Simulated latency per query batch in mock mode
    #[arg(long, default_value = "1")]
    mock_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    if let Some(batch_size) = args.batch_size {
        config.pipeline.batch_size = batch_size;
    }
    if let Some(limit) = args.limit {
        config.pipeline.limit = Some(limit);
    }
    if args.warm_run {
        config.pipeline.warm_run = true;
    }
    if let Some(burn_in) = args.burn_in {
        config.stats.burn_in = burn_in;
    }
    if let Some(ms) = args.print_every_ms {
        config.stats.print_every_ms = ms;
    }
    if let Some(dir) = args.results_dir.clone() {
        config.report.results_dir = Some(dir);
    }

    info!("Starting querier in {} mode", args.mode);
    if config.stats.burn_in > 0 {
        info!("Discarding the first {} measurements", config.stats.burn_in);
    }

    let executor: Arc<dyn BatchExecutor<QueryBatch>> = match args.mode.as_str() {
        "mock" => Arc::new(MockExecutor::new(args.mock_delay_ms)),
        "http" => Arc::new(
            HttpQueryExecutor::new(config.target.urls.clone(), config.target.timeout_ms)
                .context("Failed to create HTTP query executor")?,
        ),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };
    info!("Using executor: {}", executor.name());

    let reader = open_input(args.file.as_ref())?;
    let source = JsonLinesSource::<_, HttpQuery>::new(reader);
    let pipeline = Pipeline::new(config.pipeline.clone(), config.stats.clone(), executor)
        .context("Invalid pipeline configuration")?;

    let report = pipeline
        .run(source, QueryBatchBuilder::new())
        .await
        .map_err(|e| {
            let stage = e.stage();
            anyhow::Error::new(e).context(format!("Query run failed in {stage} stage"))
        })?;

    TextReport::stdout("queries").emit(&report)?;
    if let Some(dir) = &config.report.results_dir {
        JsonReport::new(dir, "query").emit(&report)?;
    }

    Ok(())
}

fn open_input(file: Option<&PathBuf>) -> Result<Box<dyn BufRead + Send>> {
    match file {
        Some(path) => {
            let f = std::fs::File::open(path)
                .with_context(|| format!("Failed to open query file {:?}", path))?;
            Ok(Box::new(std::io::BufReader::new(f)))
        }
        None => Ok(Box::new(std::io::BufReader::new(std::io::stdin()))),
    }
}
