use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;

use crate::model::RunReport;

/// Receives every finished run report, e.g. to persist it
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, report: &RunReport) -> anyhow::Result<()>;
}

/// Logs a one-line summary of each report
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn deliver(&self, report: &RunReport) -> anyhow::Result<()> {
        log::info!(
            "Run {} finished: {:?}, {} of {} cases failed",
            report.run_id.as_deref().unwrap_or("-"),
            report.status,
            report.failed_case_count,
            report.results.len()
        );
        Ok(())
    }
}

/// Writes each report to `<dir>/<runId>.json`
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ReportSink for JsonDirSink {
    async fn deliver(&self, report: &RunReport) -> anyhow::Result<()> {
        let run_id = report
            .run_id
            .as_deref()
            .context("Report has no run id")?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create report dir {}", self.dir.display()))?;

        let path = self.dir.join(format!("{run_id}.json"));
        let json = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        log::debug!("Report of run {run_id} written to {}", path.display());
        Ok(())
    }
}
