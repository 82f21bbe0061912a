//! Schema / database / template setup, run once before the pipeline starts.

use anyhow::{Context, Result};
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::info;

use crate::config::{BootstrapConfig, BootstrapRequest};
use crate::error::PipelineError;
use crate::executor::build_client;

pub trait Bootstrap: Send + Sync {
    fn run<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Runs a bootstrap step, mapping any failure to [`PipelineError::Bootstrap`].
pub async fn run_bootstrap(bootstrap: &dyn Bootstrap) -> Result<(), PipelineError> {
    bootstrap.run().await.map_err(PipelineError::Bootstrap)
}

/// Issues the configured requests in order against the first target URL.
/// Any transport failure or non-2xx status aborts.
pub struct HttpBootstrap {
    client: reqwest::Client,
    base: url::Url,
    requests: Vec<BootstrapRequest>,
}

impl HttpBootstrap {
    pub fn new(base_url: &str, config: &BootstrapConfig, timeout_ms: u64) -> Result<Self> {
        let base =
            url::Url::parse(base_url).with_context(|| format!("Invalid URL: {base_url}"))?;
        if base.host_str().is_none() {
            anyhow::bail!("bootstrap URL must include a hostname (got {base_url})");
        }
        Ok(Self {
            client: build_client(timeout_ms)?,
            base,
            requests: config.requests.clone(),
        })
    }

    async fn issue(&self, req: &BootstrapRequest) -> Result<()> {
        let url = self
            .base
            .join(&req.path)
            .with_context(|| format!("Invalid bootstrap path: {}", req.path))?;
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .with_context(|| format!("Invalid HTTP method: {}", req.method))?;

        let mut builder = self.client.request(method, url.clone());
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let start = Instant::now();
        let resp = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", req.method, url))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let status = resp.status();
        info!("{} {:<10} -> {} ({}ms)", req.method, req.path, status.as_u16(), latency_ms);
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} {} returned {}: {}", req.method, url, status, body.trim());
        }
        Ok(())
    }
}

impl Bootstrap for HttpBootstrap {
    fn run<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            for req in &self.requests {
                self.issue(req).await?;
            }
            Ok(())
        })
    }
}
