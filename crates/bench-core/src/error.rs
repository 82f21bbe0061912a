use thiserror::Error;

/// Failure while reading or decoding the input record stream.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed reading input at line {line}: {source}")]
    Io {
        line: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record at line {line}: {message}")]
    Parse { line: u64, message: String },
}

/// Errors surfaced by a pipeline run. Every variant is fatal to the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("input stage failed: {0}")]
    Input(#[from] InputError),

    #[error("worker {worker} failed executing batch '{label}': {source:#}")]
    Execution {
        worker: usize,
        label: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("bootstrap failed: {0:#}")]
    Bootstrap(#[source] anyhow::Error),

    #[error("stat processor stopped before the run finished")]
    StatsClosed,

    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short name of the stage that produced the error.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Input(_) => "input",
            PipelineError::Execution { .. } => "execution",
            PipelineError::Bootstrap(_) => "bootstrap",
            PipelineError::StatsClosed => "stats",
            PipelineError::Join(_) | PipelineError::Cancelled => "coordinator",
        }
    }
}
