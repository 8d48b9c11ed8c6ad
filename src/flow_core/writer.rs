//! Unified writer interface for engine outputs
//!
//! Routes writes to either JSONL or SQLite backend based on configuration.

use super::correlator::CorrelatedAnalysis;
use super::detector::Alert;
use super::jsonl_writer::JsonlSinkWriter;
use super::scorer::RouteRecommendation;
use super::sqlite_writer::SqliteSinkWriter;
use super::writer_backend::{SinkBackend, SinkError};
use crate::pipeline::config::BackendType;
use async_trait::async_trait;
use std::path::PathBuf;

/// Unified writer that routes to either JSONL or SQLite backend
pub enum OutputWriter {
    Jsonl(JsonlSinkWriter),
    Sqlite(SqliteSinkWriter),
}

impl OutputWriter {
    /// `path` is the output directory for JSONL, the database file for SQLite
    pub fn new(backend: BackendType, path: PathBuf) -> Result<Self, SinkError> {
        match backend {
            BackendType::Jsonl => Ok(OutputWriter::Jsonl(JsonlSinkWriter::new(path)?)),
            BackendType::Sqlite => Ok(OutputWriter::Sqlite(SqliteSinkWriter::new(path)?)),
        }
    }
}

#[async_trait]
impl SinkBackend for OutputWriter {
    async fn write_analysis(&mut self, analysis: &CorrelatedAnalysis) -> Result<(), SinkError> {
        match self {
            OutputWriter::Jsonl(w) => w.write_analysis(analysis).await,
            OutputWriter::Sqlite(w) => w.write_analysis(analysis).await,
        }
    }

    async fn write_alert(&mut self, alert: &Alert) -> Result<(), SinkError> {
        match self {
            OutputWriter::Jsonl(w) => w.write_alert(alert).await,
            OutputWriter::Sqlite(w) => w.write_alert(alert).await,
        }
    }

    async fn write_recommendation(
        &mut self,
        recommendation: &RouteRecommendation,
    ) -> Result<(), SinkError> {
        match self {
            OutputWriter::Jsonl(w) => w.write_recommendation(recommendation).await,
            OutputWriter::Sqlite(w) => w.write_recommendation(recommendation).await,
        }
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        match self {
            OutputWriter::Jsonl(w) => w.flush().await,
            OutputWriter::Sqlite(w) => w.flush().await,
        }
    }

    fn discard_pending(&mut self) -> usize {
        match self {
            OutputWriter::Jsonl(w) => w.discard_pending(),
            OutputWriter::Sqlite(w) => w.discard_pending(),
        }
    }

    fn backend_type(&self) -> &'static str {
        match self {
            OutputWriter::Jsonl(w) => w.backend_type(),
            OutputWriter::Sqlite(w) => w.backend_type(),
        }
    }
}
