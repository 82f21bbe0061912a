use anyhow::{Context, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::batch::{Batch, LineBatch, QueryBatch};

pub type ExecuteFuture<'a> = Pin<Box<dyn Future<Output = Result<f64>> + Send + 'a>>;

/// Backend adapter that runs one batch and reports its latency in
/// milliseconds. May be called twice on the same batch for a warm run; any
/// error stops the whole run.
pub trait BatchExecutor<B: Batch>: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(&'a self, batch: &'a B) -> ExecuteFuture<'a>;
}

/// Executor that sleeps for a fixed delay instead of talking to a backend.
pub struct MockExecutor {
    delay: Duration,
}

impl MockExecutor {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl<B: Batch> BatchExecutor<B> for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(&'a self, _batch: &'a B) -> ExecuteFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            Ok(elapsed_ms(start))
        })
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1e3
}

/// Round-robin over the configured base URLs.
struct Endpoints {
    urls: Vec<String>,
    next: AtomicUsize,
}

impl Endpoints {
    fn new(urls: Vec<String>) -> Result<Self> {
        if urls.is_empty() {
            anyhow::bail!("at least one target url is required");
        }
        for u in &urls {
            url::Url::parse(u).with_context(|| format!("Invalid target url: {u}"))?;
        }
        Ok(Self {
            urls,
            next: AtomicUsize::new(0),
        })
    }

    fn next(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.urls[idx % self.urls.len()].trim_end_matches('/')
    }

    fn join(&self, path: &str) -> String {
        format!("{}/{}", self.next(), path.trim_start_matches('/'))
    }
}

pub(crate) fn build_client(timeout_ms: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms.max(1)))
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")
}

/// POSTs the pooled payload of a [`LineBatch`] to a write endpoint.
pub struct HttpWriteExecutor {
    client: reqwest::Client,
    endpoints: Endpoints,
    write_path: String,
    content_type: String,
}

impl HttpWriteExecutor {
    pub fn new(urls: Vec<String>, write_path: &str, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout_ms)?,
            endpoints: Endpoints::new(urls)?,
            write_path: write_path.to_string(),
            content_type: "text/plain; charset=utf-8".to_string(),
        })
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

impl BatchExecutor<LineBatch> for HttpWriteExecutor {
    fn name(&self) -> &'static str {
        "http-write"
    }

    fn execute<'a>(&'a self, batch: &'a LineBatch) -> ExecuteFuture<'a> {
        Box::pin(async move {
            let endpoint = self.endpoints.join(&self.write_path);
            let start = Instant::now();
            let response = self
                .client
                .post(&endpoint)
                .header(reqwest::header::CONTENT_TYPE, &self.content_type)
                .body(batch.payload().to_vec())
                .send()
                .await
                .with_context(|| format!("POST {endpoint} failed"))?;
            let latency_ms = elapsed_ms(start);

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("POST {endpoint} returned {status}: {}", truncate(&body));
            }
            Ok(latency_ms)
        })
    }
}

/// Issues every query of a [`QueryBatch`] in order; latency covers all of them.
pub struct HttpQueryExecutor {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl HttpQueryExecutor {
    pub fn new(urls: Vec<String>, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout_ms)?,
            endpoints: Endpoints::new(urls)?,
        })
    }
}

impl BatchExecutor<QueryBatch> for HttpQueryExecutor {
    fn name(&self) -> &'static str {
        "http-query"
    }

    fn execute<'a>(&'a self, batch: &'a QueryBatch) -> ExecuteFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            for query in batch.queries() {
                let method = reqwest::Method::from_bytes(query.method.as_bytes())
                    .with_context(|| format!("Invalid HTTP method: {}", query.method))?;
                let endpoint = self.endpoints.join(&query.path);

                let mut request = self.client.request(method, &endpoint);
                if let Some(body) = &query.body {
                    request = request.body(body.clone());
                }
                let response = request
                    .send()
                    .await
                    .with_context(|| format!("{} {endpoint} failed", query.method))?;

                let status = response.status();
                // Read the body so the latency includes the full response.
                let body = response
                    .bytes()
                    .await
                    .with_context(|| format!("reading response of {endpoint}"))?;
                if !status.is_success() {
                    anyhow::bail!(
                        "{} {endpoint} returned {status}: {}",
                        query.method,
                        truncate(&String::from_utf8_lossy(&body))
                    );
                }
            }
            Ok(elapsed_ms(start))
        })
    }
}

fn truncate(s: &str) -> &str {
    const MAX: usize = 256;
    if s.len() <= MAX {
        return s;
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
