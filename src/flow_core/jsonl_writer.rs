//! JSONL writer for engine outputs - one append-only file per output stream

use super::correlator::CorrelatedAnalysis;
use super::detector::Alert;
use super::scorer::RouteRecommendation;
use super::writer_backend::{SinkBackend, SinkError};
use async_trait::async_trait;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const ANALYSIS_FILE: &str = "analysis.jsonl";
pub const ALERTS_FILE: &str = "alerts.jsonl";
pub const RECOMMENDATIONS_FILE: &str = "recommendations.jsonl";

pub struct JsonlSinkWriter {
    analysis: BufWriter<File>,
    alerts: BufWriter<File>,
    recommendations: BufWriter<File>,
    /// Lines buffered since the last successful flush
    pending: usize,
    last_flush: Instant,
    flush_interval: Duration,
}

fn open_append(base_path: &Path, filename: &str) -> std::io::Result<BufWriter<File>> {
    let file_path: PathBuf = base_path.join(filename);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file_path)?;

    log::info!("📝 Writing {} to: {}", filename, file_path.display());
    Ok(BufWriter::new(file))
}

fn append_line<T: Serialize>(writer: &mut BufWriter<File>, value: &T) -> Result<(), SinkError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    Ok(())
}

/// Swap in an empty buffer over the same file; the old bytes are never written
fn discard_buffer(writer: &mut BufWriter<File>) -> std::io::Result<()> {
    let file = writer.get_ref().try_clone()?;
    let old = std::mem::replace(writer, BufWriter::new(file));
    let _ = old.into_parts();
    Ok(())
}

impl JsonlSinkWriter {
    pub fn new(base_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let base_path = base_path.as_ref();
        std::fs::create_dir_all(base_path)?;

        Ok(Self {
            analysis: open_append(base_path, ANALYSIS_FILE)?,
            alerts: open_append(base_path, ALERTS_FILE)?,
            recommendations: open_append(base_path, RECOMMENDATIONS_FILE)?,
            pending: 0,
            last_flush: Instant::now(),
            flush_interval: Duration::from_secs(5),
        })
    }

    /// Called after a line was buffered, so a failure here leaves it queued
    fn maybe_flush(&mut self) -> Result<(), SinkError> {
        self.pending += 1;
        if self.last_flush.elapsed() > self.flush_interval {
            self.flush_all().map_err(SinkError::unflushed)?;
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> std::io::Result<()> {
        self.analysis.flush()?;
        self.alerts.flush()?;
        self.recommendations.flush()?;
        self.pending = 0;
        self.last_flush = Instant::now();
        Ok(())
    }
}

impl Drop for JsonlSinkWriter {
    fn drop(&mut self) {
        let _ = self.flush_all();
    }
}

#[async_trait]
impl SinkBackend for JsonlSinkWriter {
    async fn write_analysis(&mut self, analysis: &CorrelatedAnalysis) -> Result<(), SinkError> {
        append_line(&mut self.analysis, analysis)?;
        self.maybe_flush()
    }

    async fn write_alert(&mut self, alert: &Alert) -> Result<(), SinkError> {
        append_line(&mut self.alerts, alert)?;
        self.maybe_flush()
    }

    async fn write_recommendation(
        &mut self,
        recommendation: &RouteRecommendation,
    ) -> Result<(), SinkError> {
        append_line(&mut self.recommendations, recommendation)?;
        self.maybe_flush()
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.flush_all()?;
        Ok(())
    }

    fn discard_pending(&mut self) -> usize {
        let discarded = self.pending;
        for writer in [&mut self.analysis, &mut self.alerts, &mut self.recommendations] {
            if let Err(e) = discard_buffer(writer) {
                log::error!("❌ Failed to discard buffered JSONL lines: {}", e);
            }
        }
        self.pending = 0;
        discarded
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}
