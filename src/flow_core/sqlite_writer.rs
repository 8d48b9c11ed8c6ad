//! SQLite writer for engine outputs
//!
//! Three append-only tables, batched inserts committed in one transaction.

use super::correlator::CorrelatedAnalysis;
use super::detector::Alert;
use super::scorer::RouteRecommendation;
use super::writer_backend::{SinkBackend, SinkError, SinkRecord};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Instant;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traffic_analysis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    segment_id TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    avg_speed REAL NOT NULL,
    congestion_index REAL NOT NULL,
    event_count INTEGER NOT NULL,
    max_severity INTEGER NOT NULL,
    update_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_analysis_segment ON traffic_analysis(segment_id, update_time DESC);

CREATE TABLE IF NOT EXISTS traffic_alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_type TEXT NOT NULL,
    segment_id TEXT NOT NULL,
    details TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON traffic_alerts(timestamp DESC);

CREATE TABLE IF NOT EXISTS route_recommendations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    route_id TEXT NOT NULL,
    segment_id TEXT,
    matched INTEGER NOT NULL,
    adjusted_eta REAL NOT NULL,
    risk_level REAL NOT NULL,
    recommendation TEXT NOT NULL
);
";

pub struct SqliteSinkWriter {
    conn: Connection,
    batch: Vec<SinkRecord>,
    batch_size: usize,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl SqliteSinkWriter {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;

        log::info!(
            "✅ SQLite sink initialized: {} (journal_mode={})",
            db_path.as_ref().display(),
            mode
        );

        Ok(Self {
            conn,
            batch: Vec::with_capacity(100),
            batch_size: 100,
            last_flush: Instant::now(),
            flush_interval_secs: 2,
        })
    }

    /// Queue a record; a failed commit leaves it queued for the next flush
    fn push(&mut self, record: SinkRecord) -> Result<(), SinkError> {
        self.batch.push(record);

        if self.batch.len() >= self.batch_size
            || self.last_flush.elapsed().as_secs() >= self.flush_interval_secs
        {
            self.flush_batch().map_err(SinkError::unflushed)?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;

        for record in &self.batch {
            match record {
                SinkRecord::Analysis(a) => {
                    tx.execute(
                        "INSERT INTO traffic_analysis
                         (segment_id, window_start, avg_speed, congestion_index,
                          event_count, max_severity, update_time)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            a.segment_id,
                            a.window_start,
                            a.avg_speed,
                            a.congestion_index,
                            a.event_count as i64,
                            a.max_severity,
                            a.update_time,
                        ],
                    )?;
                }
                SinkRecord::Alert(a) => {
                    tx.execute(
                        "INSERT INTO traffic_alerts (alert_type, segment_id, details, timestamp)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![a.alert_type.as_str(), a.segment_id, a.details, a.timestamp],
                    )?;
                }
                SinkRecord::Recommendation(r) => {
                    tx.execute(
                        "INSERT INTO route_recommendations
                         (route_id, segment_id, matched, adjusted_eta, risk_level, recommendation)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            r.route_id,
                            r.segment_id,
                            r.matched,
                            r.adjusted_eta,
                            r.risk_level,
                            r.recommendation.as_str(),
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;

        log::debug!("✅ Flushed {} records to SQLite", self.batch.len());
        self.batch.clear();
        self.last_flush = Instant::now();

        Ok(())
    }
}

impl Drop for SqliteSinkWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush_batch() {
            log::error!("❌ Failed to flush SQLite sink on drop: {}", e);
        }
    }
}

#[async_trait]
impl SinkBackend for SqliteSinkWriter {
    async fn write_analysis(&mut self, analysis: &CorrelatedAnalysis) -> Result<(), SinkError> {
        self.push(SinkRecord::Analysis(analysis.clone()))
    }

    async fn write_alert(&mut self, alert: &Alert) -> Result<(), SinkError> {
        self.push(SinkRecord::Alert(alert.clone()))
    }

    async fn write_recommendation(
        &mut self,
        recommendation: &RouteRecommendation,
    ) -> Result<(), SinkError> {
        self.push(SinkRecord::Recommendation(recommendation.clone()))
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.flush_batch()
    }

    fn discard_pending(&mut self) -> usize {
        let discarded = self.batch.len();
        self.batch.clear();
        discarded
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
