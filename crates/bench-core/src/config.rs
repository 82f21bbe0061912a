use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }
}

/// Settings fixed for the lifetime of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of input records per batch
    pub batch_size: usize,
    /// Number of concurrent workers (also the batch channel capacity)
    pub workers: usize,
    /// Execute every batch a second time to measure cache-warm latency
    #[serde(default)]
    pub warm_run: bool,
    /// Stop reading after this many records (0 or absent reads everything)
    #[serde(default)]
    pub limit: Option<u64>,
    /// Shared cap on batch executions per second across all workers
    #[serde(default)]
    pub max_batches_per_sec: Option<u64>,
}

impl PipelineConfig {
    pub fn new(batch_size: usize, workers: usize) -> Self {
        Self {
            batch_size,
            workers,
            warm_run: false,
            limit: None,
            max_batches_per_sec: None,
        }
    }

    pub fn with_warm_run(mut self, warm_run: bool) -> Self {
        self.warm_run = warm_run;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be > 0".into()));
        }
        if self.max_batches_per_sec == Some(0) {
            return Err(PipelineError::Config(
                "max_batches_per_sec must be > 0 when set".into(),
            ));
        }
        Ok(())
    }

    /// Effective record limit; `None` means unlimited.
    pub fn record_limit(&self) -> Option<u64> {
        self.limit.filter(|&n| n > 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URLs of the database under test (workers round-robin)
    pub urls: Vec<String>,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    /// Path batches are written to (loader)
    #[serde(default = "default_write_path")]
    pub write_path: String,
    /// Content-Type header for write payloads
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_write_path() -> String {
    "/write".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Log intermediate throughput every N milliseconds (0 disables)
    #[serde(default = "default_print_every_ms")]
    pub print_every_ms: u64,
    /// Number of leading cold measurements to discard
    #[serde(default)]
    pub burn_in: u64,
}

fn default_print_every_ms() -> u64 {
    10_000
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            print_every_ms: default_print_every_ms(),
            burn_in: 0,
        }
    }
}

impl StatsConfig {
    pub fn print_interval(&self) -> Option<Duration> {
        (self.print_every_ms > 0).then(|| Duration::from_millis(self.print_every_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub requests: Vec<BootstrapRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapRequest {
    #[serde(default = "default_bootstrap_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_bootstrap_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory for the JSON run report (none = text only)
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
}
