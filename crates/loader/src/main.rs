use anyhow::{Context, Result};
use bench_core::{
    run_bootstrap, BatchExecutor, BufferPool, Config, HttpBootstrap, HttpWriteExecutor,
    JsonReport, LineBatch, LineBatchBuilder, LineSource, MockExecutor, Pipeline, ReportSink,
    TextReport,
};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Read buffer for the input stream.
const INPUT_BUFFER_BYTES: usize = 4 << 20;

#[derive(Parser, Debug)]
#[command(name = "loader")]
#[command(about = "Bulk loader - streams line-protocol data into a time-series database")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.load.toml")]
    config: PathBuf,

    /// Execution mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Input file (defaults to stdin)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Number of concurrent workers (overrides config)
    #[arg(long)]
    workers: Option<usize>,

    /// Lines per batch (overrides config)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Stop after this many lines (overrides config)
    #[arg(long)]
    limit: Option<u64>,

    /// Do not run the bootstrap requests before loading
    #[arg(long)]
    skip_bootstrap: bool,

    /// Write a JSON report into this directory (overrides config)
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Simulated latency per batch in mock mode
    #[arg(long, default_value = "0")]
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
    if let Some(dir) = args.results_dir.clone() {
        config.report.results_dir = Some(dir);
    }

    info!("Starting loader in {} mode", args.mode);

    let executor: Arc<dyn BatchExecutor<LineBatch>> = match args.mode.as_str() {
        "mock" => Arc::new(MockExecutor::new(args.mock_delay_ms)),
        "http" => {
            let mut executor = HttpWriteExecutor::new(
                config.target.urls.clone(),
                &config.target.write_path,
                config.target.timeout_ms,
            )
            .context("Failed to create HTTP write executor")?;
            if let Some(content_type) = &config.target.content_type {
                executor = executor.with_content_type(content_type.clone());
            }
            Arc::new(executor)
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };
    info!("Using executor: {}", executor.name());

    if args.mode == "http" && !args.skip_bootstrap {
        if let Some(bootstrap) = &config.bootstrap {
            let base = config
                .target
                .urls
                .first()
                .context("target.urls must not be empty")?;
            let step = HttpBootstrap::new(base, bootstrap, config.target.timeout_ms)
                .context("Failed to create bootstrap client")?;
            run_bootstrap(&step).await.context("Bootstrap failed")?;
        }
    }

    let reader = open_input(args.file.as_ref())?;
    // Enough buffers for every batch that can be queued or in flight.
    let pool = BufferPool::new(
        config.pipeline.batch_size * 64,
        config.pipeline.workers * 2 + 1,
    );
    let pipeline = Pipeline::new(config.pipeline.clone(), config.stats.clone(), executor)
        .context("Invalid pipeline configuration")?;

    let report = pipeline
        .run(LineSource::new(reader), LineBatchBuilder::new(pool, "write"))
        .await
        .map_err(|e| {
            let stage = e.stage();
            anyhow::Error::new(e).context(format!("Load failed in {stage} stage"))
        })?;

    TextReport::stdout("metrics").emit(&report)?;
    if let Some(dir) = &config.report.results_dir {
        JsonReport::new(dir, "load").emit(&report)?;
    }

    Ok(())
}

fn open_input(file: Option<&PathBuf>) -> Result<Box<dyn BufRead + Send>> {
    match file {
        Some(path) => {
            let f = std::fs::File::open(path)
                .with_context(|| format!("Failed to open input {:?}", path))?;
            Ok(Box::new(std::io::BufReader::with_capacity(
                INPUT_BUFFER_BYTES,
                f,
            )))
        }
        None => Ok(Box::new(std::io::BufReader::with_capacity(
            INPUT_BUFFER_BYTES,
            std::io::stdin(),
        ))),
    }
}
