//! Writer backend trait for engine outputs
//!
//! Defines the interface for appending analyses, alerts and route
//! recommendations to durable storage.

use super::correlator::CorrelatedAnalysis;
use super::detector::Alert;
use super::scorer::RouteRecommendation;
use async_trait::async_trait;

#[derive(Debug)]
pub enum SinkError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Database(String),
    /// The record is queued in the backend but committing it failed;
    /// retry with `flush`, not by writing the record again
    Unflushed(Box<SinkError>),
}

impl SinkError {
    pub fn unflushed(err: impl Into<SinkError>) -> Self {
        SinkError::Unflushed(Box::new(err.into()))
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Io(err)
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Serialization(err)
    }
}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        SinkError::Database(err.to_string())
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "IO error: {}", e),
            SinkError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SinkError::Database(e) => write!(f, "Database error: {}", e),
            SinkError::Unflushed(e) => write!(f, "Queued but not flushed: {}", e),
        }
    }
}

impl std::error::Error for SinkError {}

/// One output record bound for an append-only stream
#[derive(Debug, Clone)]
pub enum SinkRecord {
    Analysis(CorrelatedAnalysis),
    Alert(Alert),
    Recommendation(RouteRecommendation),
}

impl SinkRecord {
    pub fn stream_name(&self) -> &'static str {
        match self {
            SinkRecord::Analysis(_) => "analysis",
            SinkRecord::Alert(_) => "alerts",
            SinkRecord::Recommendation(_) => "recommendations",
        }
    }
}

/// Backend trait for append-only output streams
#[async_trait]
pub trait SinkBackend: Send {
    async fn write_analysis(&mut self, analysis: &CorrelatedAnalysis) -> Result<(), SinkError>;

    async fn write_alert(&mut self, alert: &Alert) -> Result<(), SinkError>;

    async fn write_recommendation(
        &mut self,
        recommendation: &RouteRecommendation,
    ) -> Result<(), SinkError>;

    /// Flush pending writes to storage
    async fn flush(&mut self) -> Result<(), SinkError>;

    /// Drop records queued but not yet committed; returns how many were dropped
    fn discard_pending(&mut self) -> usize;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;

    async fn write_record(&mut self, record: &SinkRecord) -> Result<(), SinkError> {
        match record {
            SinkRecord::Analysis(a) => self.write_analysis(a).await,
            SinkRecord::Alert(a) => self.write_alert(a).await,
            SinkRecord::Recommendation(r) => self.write_recommendation(r).await,
        }
    }
}
