use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use crate::stats::{
    LabeledGroup, StatGroup, StatSummary, LABEL_ALL_REQUESTS, LABEL_COLD_REQUESTS,
    LABEL_WARM_REQUESTS,
};

/// Everything known about a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub timestamp: String,
    pub workers: usize,
    pub batch_size: usize,
    pub warm_run: bool,
    pub records_read: u64,
    pub batches: u64,
    pub executions: u64,
    pub items: u64,
    pub elapsed_secs: f64,
    pub items_per_sec: f64,
    pub groups: Vec<LabeledGroup>,
    pub all: StatGroup,
    /// Cold and warm aggregates, present on warm runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cold: Option<StatGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<StatGroup>,
    pub burned_in: u64,
}

impl RunReport {
    pub(crate) fn new(
        workers: usize,
        batch_size: usize,
        warm_run: bool,
        counts: RunCounts,
        elapsed_secs: f64,
        stats: StatSummary,
    ) -> Self {
        let items_per_sec = if elapsed_secs > 0.0 {
            counts.items as f64 / elapsed_secs
        } else {
            0.0
        };
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            workers,
            batch_size,
            warm_run,
            records_read: counts.records_read,
            batches: counts.batches,
            executions: counts.executions,
            items: counts.items,
            elapsed_secs,
            items_per_sec,
            groups: stats.groups,
            all: stats.all,
            cold: stats.cold,
            warm: stats.warm,
            burned_in: stats.burned_in,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunCounts {
    pub records_read: u64,
    pub batches: u64,
    pub executions: u64,
    pub items: u64,
}

/// Destination for the final report of a run.
pub trait ReportSink {
    fn emit(&mut self, report: &RunReport) -> Result<()>;
}

/// Plain text, one line per label, then the aggregate and throughput.
pub struct TextReport<W> {
    out: W,
    noun: String,
}

impl TextReport<std::io::Stdout> {
    pub fn stdout(noun: impl Into<String>) -> Self {
        Self::new(std::io::stdout(), noun)
    }
}

impl<W: Write> TextReport<W> {
    /// `noun` names what an item is ("metrics", "queries", ...).
    pub fn new(out: W, noun: impl Into<String>) -> Self {
        Self {
            out,
            noun: noun.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for TextReport<W> {
    fn emit(&mut self, report: &RunReport) -> Result<()> {
        let width = report
            .groups
            .iter()
            .map(|g| g.label.len())
            .chain([
                LABEL_ALL_REQUESTS.len(),
                LABEL_COLD_REQUESTS.len(),
                LABEL_WARM_REQUESTS.len(),
            ])
            .max()
            .unwrap_or(0);

        writeln!(
            self.out,
            "run complete after {} batches with {} workers:",
            report.batches, report.workers
        )?;
        for group in &report.groups {
            writeln!(self.out, "{:<width$} : {}", group.label, group.stats)?;
        }
        if let Some(cold) = &report.cold {
            writeln!(self.out, "{:<width$} : {}", LABEL_COLD_REQUESTS, cold)?;
        }
        if let Some(warm) = &report.warm {
            writeln!(self.out, "{:<width$} : {}", LABEL_WARM_REQUESTS, warm)?;
        }
        writeln!(self.out, "{:<width$} : {}", LABEL_ALL_REQUESTS, report.all)?;
        writeln!(self.out)?;
        writeln!(self.out, "Summary:")?;
        writeln!(
            self.out,
            "loaded {} {} in {:.3}sec with {} workers (mean rate {:.2} {}/sec)",
            report.items,
            self.noun,
            report.elapsed_secs,
            report.workers,
            report.items_per_sec,
            self.noun
        )?;
        self.out.flush()?;
        Ok(())
    }
}

/// Writes `<dir>/<name>_<timestamp>.json`.
pub struct JsonReport {
    dir: PathBuf,
    name: String,
    written: Option<PathBuf>,
}

impl JsonReport {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            written: None,
        }
    }

    /// Path of the last report written.
    pub fn written(&self) -> Option<&PathBuf> {
        self.written.as_ref()
    }
}

impl ReportSink for JsonReport {
    fn emit(&mut self, report: &RunReport) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {:?}", self.dir))?;
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("{}_{}.json", self.name, timestamp));

        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Results written to {}", path.display());
        self.written = Some(path);
        Ok(())
    }
}
