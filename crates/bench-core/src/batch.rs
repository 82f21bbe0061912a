use serde::{Deserialize, Serialize};

use crate::pool::{BufferPool, PooledBuffer};

/// One unit of work sent to a backend in a single call.
pub trait Batch: Send + Sync + 'static {
    /// Human label the latency of this batch is recorded under.
    fn label(&self) -> &str;

    /// Number of input records in the batch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accumulates records until the producer decides a batch is complete.
pub trait BatchBuilder: Send + 'static {
    type Record: Send + 'static;
    type Batch: Batch;

    fn push(&mut self, record: Self::Record);

    /// Records accumulated since the last [`BatchBuilder::finish`].
    fn len(&self) -> usize;

    /// Hand out the accumulated batch and start an empty one.
    fn finish(&mut self) -> Self::Batch;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Newline-joined payload of serialized records, backed by a pooled buffer.
#[derive(Debug)]
pub struct LineBatch {
    label: String,
    lines: usize,
    payload: PooledBuffer,
}

impl LineBatch {
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn generation(&self) -> u64 {
        self.payload.generation()
    }
}

impl Batch for LineBatch {
    fn label(&self) -> &str {
        &self.label
    }

    fn len(&self) -> usize {
        self.lines
    }
}

pub struct LineBatchBuilder {
    pool: BufferPool,
    label: String,
    current: Option<PooledBuffer>,
    lines: usize,
}

impl LineBatchBuilder {
    pub fn new(pool: BufferPool, label: impl Into<String>) -> Self {
        Self {
            pool,
            label: label.into(),
            current: None,
            lines: 0,
        }
    }
}

impl BatchBuilder for LineBatchBuilder {
    type Record = String;
    type Batch = LineBatch;

    fn push(&mut self, record: String) {
        let pool = &self.pool;
        let buf = self.current.get_or_insert_with(|| pool.check_out());
        buf.extend_from_slice(record.as_bytes());
        buf.push(b'\n');
        self.lines += 1;
    }

    fn len(&self) -> usize {
        self.lines
    }

    fn finish(&mut self) -> LineBatch {
        let payload = self
            .current
            .take()
            .unwrap_or_else(|| self.pool.check_out());
        let lines = std::mem::take(&mut self.lines);
        LineBatch {
            label: self.label.clone(),
            lines,
            payload,
        }
    }
}

/// A decoded HTTP query, one per input line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpQuery {
    /// Label statistics are grouped under
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// One or more queries executed back to back by one worker.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    queries: Vec<HttpQuery>,
}

impl QueryBatch {
    pub fn queries(&self) -> &[HttpQuery] {
        &self.queries
    }
}

impl Batch for QueryBatch {
    fn label(&self) -> &str {
        self.queries.first().map_or("", |q| q.label.as_str())
    }

    fn len(&self) -> usize {
        self.queries.len()
    }
}

#[derive(Default)]
pub struct QueryBatchBuilder {
    pending: Vec<HttpQuery>,
}

impl QueryBatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchBuilder for QueryBatchBuilder {
    type Record = HttpQuery;
    type Batch = QueryBatch;

    fn push(&mut self, record: HttpQuery) {
        self.pending.push(record);
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn finish(&mut self) -> QueryBatch {
        QueryBatch {
            queries: std::mem::take(&mut self.pending),
        }
    }
}
