//! Pipeline ingestion - concurrent stage tasks over bounded channels
//!
//! One tokio task per stage. Every channel is bounded by
//! `PipelineConfig::channel_buffer`; a full downstream buffer blocks the
//! producer on `send().await` instead of dropping records.
//!
//! Shutdown runs front to back: closing the input senders lets each window
//! stage drain its open windows (when `drain_on_shutdown` is set) and drop
//! its output sender, which in turn ends the next stage.

use super::config::PipelineConfig;
use super::engine::{AlertStage, CorrelationStage, EventWindowStage, FlowWindowStage, RoutingStage};
use super::retry::ExponentialBackoff;
use super::stats::PipelineStats;
use super::store::AnalysisStore;
use crate::flow_core::correlator::CorrelatedAnalysis;
use crate::flow_core::normalizer::{FlowSample, IncidentEvent, Record, RouteRequest};
use crate::flow_core::reader::TailReader;
use crate::flow_core::window::{AreaEventSummary, SegmentFlowSummary};
use crate::flow_core::writer_backend::{SinkBackend, SinkError, SinkRecord};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Input senders plus the shared read side of a running pipeline
pub struct PipelineHandle {
    pub events: mpsc::Sender<IncidentEvent>,
    pub flows: mpsc::Sender<FlowSample>,
    pub routes: mpsc::Sender<RouteRequest>,
    store: AnalysisStore,
    stats: Arc<PipelineStats>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineHandle {
    pub fn store(&self) -> AnalysisStore {
        self.store.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Close the event and flow inputs and wait until every window they
    /// opened has been correlated and published to the store.
    ///
    /// Routes sent afterwards are scored against the final analyses.
    /// Sending on `events` or `flows` after this fails.
    pub async fn close_windows(&mut self) {
        let (events, _) = mpsc::channel(1);
        let (flows, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.events, events));
        drop(std::mem::replace(&mut self.flows, flows));

        let upstream = ["event-window", "flow-window", "correlator"];
        let (closing, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|(name, _)| upstream.contains(name));
        self.tasks = rest;

        for (name, task) in closing {
            if let Err(e) = task.await {
                log::error!("❌ {} stage terminated abnormally: {}", name, e);
            }
        }
        log::info!("✅ Windows closed ({} segments in store)", self.store.len());
    }

    /// Close the inputs and wait for every stage to drain and exit
    pub async fn shutdown(self) {
        let PipelineHandle {
            events,
            flows,
            routes,
            tasks,
            ..
        } = self;
        drop(events);
        drop(flows);
        drop(routes);

        for (name, task) in tasks {
            if let Err(e) = task.await {
                log::error!("❌ {} stage terminated abnormally: {}", name, e);
            }
        }
        log::info!("✅ Pipeline stopped");
    }
}

/// Start every stage and return the handle that feeds them
pub fn spawn_pipeline<W>(
    config: &PipelineConfig,
    writer: W,
    directory: &HashMap<String, (f64, f64)>,
) -> PipelineHandle
where
    W: SinkBackend + 'static,
{
    let buffer = config.channel_buffer;
    let store = AnalysisStore::new();
    let stats = Arc::new(PipelineStats::default());

    let (events_tx, events_rx) = mpsc::channel::<IncidentEvent>(buffer);
    let (flows_tx, flows_rx) = mpsc::channel::<FlowSample>(buffer);
    let (routes_tx, routes_rx) = mpsc::channel::<RouteRequest>(buffer);
    let (event_summary_tx, event_summary_rx) = mpsc::channel::<AreaEventSummary>(buffer);
    let (flow_summary_tx, flow_summary_rx) = mpsc::channel::<SegmentFlowSummary>(buffer);
    let (analysis_tx, analysis_rx) = mpsc::channel::<CorrelatedAnalysis>(buffer);
    let (sink_tx, sink_rx) = mpsc::channel::<SinkRecord>(buffer);

    log::info!("🚀 Starting traffic pipeline");
    log::info!(
        "   ├─ Windows: events {}s, flow {}s, grace {}s",
        config.event_window_secs,
        config.flow_window_secs,
        config.watermark_grace_secs
    );
    log::info!(
        "   ├─ Dedup: {} | min severity: {}",
        config.dedup_enabled,
        config.min_event_severity
    );
    log::info!("   └─ Sink: {} | channel buffer: {}", writer.backend_type(), buffer);

    let drain = config.drain_on_shutdown;
    let mut tasks = Vec::new();

    let event_stage = EventWindowStage::new(config, stats.clone());
    tasks.push((
        "event-window",
        tokio::spawn(run_event_stage(event_stage, events_rx, event_summary_tx, drain)),
    ));

    let flow_stage = FlowWindowStage::new(config, stats.clone());
    tasks.push((
        "flow-window",
        tokio::spawn(run_flow_stage(flow_stage, flows_rx, flow_summary_tx, drain)),
    ));

    let correlation = CorrelationStage::new(config, directory, store.clone(), stats.clone());
    tasks.push((
        "correlator",
        tokio::spawn(run_correlation_stage(
            correlation,
            event_summary_rx,
            flow_summary_rx,
            analysis_tx,
        )),
    ));

    let alerts = AlertStage::new(config, stats.clone());
    tasks.push((
        "alert",
        tokio::spawn(run_alert_stage(alerts, analysis_rx, sink_tx.clone())),
    ));

    let routing = RoutingStage::new(config, store.clone(), stats.clone());
    tasks.push((
        "routing",
        tokio::spawn(run_routing_stage(routing, routes_rx, sink_tx)),
    ));

    let backoff = SinkRetry {
        initial: Duration::from_millis(config.sink_retry_initial_ms),
        max_retries: config.sink_max_retries,
    };
    tasks.push((
        "sink",
        tokio::spawn(run_sink_stage(writer, sink_rx, backoff, stats.clone())),
    ));

    PipelineHandle {
        events: events_tx,
        flows: flows_tx,
        routes: routes_tx,
        store,
        stats,
        tasks,
    }
}

async fn run_event_stage(
    mut stage: EventWindowStage,
    mut rx: mpsc::Receiver<IncidentEvent>,
    tx: mpsc::Sender<AreaEventSummary>,
    drain: bool,
) {
    while let Some(event) = rx.recv().await {
        for summary in stage.ingest(&event) {
            if tx.send(summary).await.is_err() {
                log::warn!("⚠️  Correlator gone, stopping event stage");
                return;
            }
        }
    }

    if drain {
        let remaining = stage.drain();
        log::info!("🔄 Draining {} event summaries", remaining.len());
        for summary in remaining {
            if tx.send(summary).await.is_err() {
                break;
            }
        }
    }
}

async fn run_flow_stage(
    mut stage: FlowWindowStage,
    mut rx: mpsc::Receiver<FlowSample>,
    tx: mpsc::Sender<SegmentFlowSummary>,
    drain: bool,
) {
    while let Some(sample) = rx.recv().await {
        for summary in stage.ingest(&sample) {
            if tx.send(summary).await.is_err() {
                log::warn!("⚠️  Correlator gone, stopping flow stage");
                return;
            }
        }
    }

    if drain {
        let remaining = stage.drain();
        log::info!("🔄 Draining {} flow summaries", remaining.len());
        for summary in remaining {
            if tx.send(summary).await.is_err() {
                break;
            }
        }
    }
}

async fn run_correlation_stage(
    mut stage: CorrelationStage,
    mut events_rx: mpsc::Receiver<AreaEventSummary>,
    mut flows_rx: mpsc::Receiver<SegmentFlowSummary>,
    tx: mpsc::Sender<CorrelatedAnalysis>,
) {
    loop {
        let analyses = tokio::select! {
            Some(summary) = events_rx.recv() => stage.on_event_summary(summary),
            Some(summary) = flows_rx.recv() => stage.on_flow_summary(summary).into_iter().collect::<Vec<_>>(),
            else => break,
        };

        for analysis in analyses {
            if tx.send(analysis).await.is_err() {
                log::warn!("⚠️  Alert stage gone, stopping correlator");
                return;
            }
        }
    }

    log::info!(
        "✅ Correlator finished ({} segments tracked)",
        stage.tracked_segments()
    );
}

async fn run_alert_stage(
    stage: AlertStage,
    mut rx: mpsc::Receiver<CorrelatedAnalysis>,
    sink: mpsc::Sender<SinkRecord>,
) {
    while let Some(analysis) = rx.recv().await {
        let alert = stage.on_analysis(&analysis);

        if sink.send(SinkRecord::Analysis(analysis)).await.is_err() {
            log::warn!("⚠️  Sink gone, stopping alert stage");
            return;
        }
        if let Some(alert) = alert {
            if sink.send(SinkRecord::Alert(alert)).await.is_err() {
                return;
            }
        }
    }
}

async fn run_routing_stage(
    stage: RoutingStage,
    mut rx: mpsc::Receiver<RouteRequest>,
    sink: mpsc::Sender<SinkRecord>,
) {
    while let Some(request) = rx.recv().await {
        let recommendation = stage.score(&request);
        if sink.send(SinkRecord::Recommendation(recommendation)).await.is_err() {
            log::warn!("⚠️  Sink gone, stopping routing stage");
            return;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SinkRetry {
    initial: Duration,
    max_retries: u32,
}

/// Append each record exactly once.
///
/// A write that fails before the backend accepted the record is retried as a
/// write. Once the backend holds the record (`SinkError::Unflushed`), only the
/// flush is retried. When retries run out the backend's queue is discarded so
/// nothing counted as failed is committed later.
async fn run_sink_stage<W: SinkBackend>(
    mut writer: W,
    mut rx: mpsc::Receiver<SinkRecord>,
    retry: SinkRetry,
    stats: Arc<PipelineStats>,
) {
    let mut written = 0u64;

    while let Some(record) = rx.recv().await {
        let mut backoff =
            ExponentialBackoff::new(retry.initial, retry.initial * 16, retry.max_retries);
        let mut queued = false;

        loop {
            let attempt = if queued {
                writer.flush().await
            } else {
                writer.write_record(&record).await
            };

            let e = match attempt {
                Ok(()) => {
                    written += 1;
                    break;
                }
                Err(SinkError::Unflushed(e)) => {
                    queued = true;
                    *e
                }
                Err(e) => e,
            };

            log::warn!("⚠️  {} write failed: {}", record.stream_name(), e);
            if backoff.sleep().await.is_err() {
                let discarded = if queued { writer.discard_pending() } else { 1 };
                log::error!(
                    "❌ Dropping {} {} record(s) after {} retries: {}",
                    discarded,
                    record.stream_name(),
                    backoff.attempts(),
                    e
                );
                PipelineStats::add(&stats.sink_failures, discarded as u64);
                break;
            }
        }
    }

    if let Err(e) = writer.flush().await {
        log::error!("❌ Final sink flush failed: {}", e);
        let discarded = writer.discard_pending().max(1);
        PipelineStats::add(&stats.sink_failures, discarded as u64);
    }
    log::info!("✅ Sink closed ({} records written)", written);
}

/// Tail a JSONL file forever, forwarding each valid record
///
/// Malformed lines are counted and skipped. Returns when the receiver is gone.
pub async fn forward_tail<R>(
    mut reader: TailReader,
    tx: mpsc::Sender<R>,
    stats: Arc<PipelineStats>,
) -> std::io::Result<()>
where
    R: Record + Send + 'static,
{
    reader.start().await?;
    let source = reader.path().display().to_string();

    while let Some(line) = reader.read_line().await? {
        if !forward_line(&line, &source, &tx, &stats).await {
            break;
        }
    }
    Ok(())
}

/// Read a JSONL file once to EOF, forwarding each valid record.
/// Returns the number of lines read.
pub async fn replay_file<R>(
    path: &Path,
    tx: &mpsc::Sender<R>,
    stats: &PipelineStats,
) -> std::io::Result<u64>
where
    R: Record + Send + 'static,
{
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let source = path.display().to_string();
    let mut count = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        count += 1;
        if !forward_line(line, &source, tx, stats).await {
            break;
        }
    }

    log::info!("📖 Replayed {} lines from {}", count, source);
    Ok(count)
}

async fn forward_line<R: Record>(
    line: &str,
    source: &str,
    tx: &mpsc::Sender<R>,
    stats: &PipelineStats,
) -> bool {
    match R::from_jsonl(line) {
        Ok(record) => tx.send(record).await.is_ok(),
        Err(e) => {
            PipelineStats::incr(&stats.malformed);
            log::warn!("⚠️  Skipping line from {}: {}", source, e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_core::detector::Alert;
    use crate::flow_core::scorer::RouteRecommendation;
    use crate::flow_core::writer::OutputWriter;
    use crate::pipeline::config::BackendType;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Queues analyses and fails the first `failures` commits
    struct FlakySink {
        queued: Vec<String>,
        committed: Arc<Mutex<Vec<String>>>,
        failures: u32,
    }

    impl FlakySink {
        fn new(failures: u32) -> (Self, Arc<Mutex<Vec<String>>>) {
            let committed = Arc::new(Mutex::new(Vec::new()));
            let sink = Self {
                queued: Vec::new(),
                committed: committed.clone(),
                failures,
            };
            (sink, committed)
        }

        fn commit(&mut self) -> Result<(), SinkError> {
            if self.queued.is_empty() {
                return Ok(());
            }
            if self.failures > 0 {
                self.failures -= 1;
                return Err(SinkError::Database("database is locked".to_string()));
            }
            self.committed.lock().unwrap().append(&mut self.queued);
            Ok(())
        }
    }

    #[async_trait]
    impl SinkBackend for FlakySink {
        async fn write_analysis(&mut self, analysis: &CorrelatedAnalysis) -> Result<(), SinkError> {
            self.queued.push(analysis.segment_id.clone());
            self.commit().map_err(SinkError::unflushed)
        }

        async fn write_alert(&mut self, _alert: &Alert) -> Result<(), SinkError> {
            Ok(())
        }

        async fn write_recommendation(
            &mut self,
            _recommendation: &RouteRecommendation,
        ) -> Result<(), SinkError> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), SinkError> {
            self.commit()
        }

        fn discard_pending(&mut self) -> usize {
            let discarded = self.queued.len();
            self.queued.clear();
            discarded
        }

        fn backend_type(&self) -> &'static str {
            "Flaky"
        }
    }

    fn analysis_record(segment: &str) -> SinkRecord {
        SinkRecord::Analysis(CorrelatedAnalysis {
            segment_id: segment.to_string(),
            window_start: T0,
            avg_speed: 30.0,
            congestion_index: 0.75,
            event_count: 0,
            max_severity: 0,
            update_time: T0 + 10,
        })
    }

    async fn run_sink(
        sink: FlakySink,
        records: Vec<SinkRecord>,
        max_retries: u32,
    ) -> Arc<PipelineStats> {
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for record in records {
            tx.send(record).await.unwrap();
        }
        drop(tx);

        let retry = SinkRetry {
            initial: Duration::from_millis(1),
            max_retries,
        };
        run_sink_stage(sink, rx, retry, stats.clone()).await;
        stats
    }

    const T0: i64 = 1_700_000_100;

    fn sample(segment: &str, ts: i64, speed: f64) -> FlowSample {
        FlowSample {
            record_id: None,
            timestamp: ts,
            segment_id: segment.to_string(),
            speed,
            free_flow_speed: 40.0,
            congestion_level: None,
            latitude: Some(40.7128),
            longitude: Some(-74.0060),
        }
    }

    #[tokio::test]
    async fn test_pipeline_drains_on_shutdown() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            channel_buffer: 4,
            output_path: dir.path().join("out"),
            ..PipelineConfig::default()
        };
        let writer = OutputWriter::new(BackendType::Jsonl, config.sink_path()).unwrap();
        let handle = spawn_pipeline(&config, writer, &HashMap::new());
        let store = handle.store();
        let stats = handle.stats();

        for i in 0..10 {
            handle.flows.send(sample("seg-1", T0 + i, 12.0)).await.unwrap();
        }
        handle.shutdown().await;

        let analysis = store.latest("seg-1").unwrap();
        assert!((analysis.congestion_index - 0.3).abs() < 1e-9);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.samples_accepted, 10);
        assert_eq!(snapshot.analyses, 1);
        assert_eq!(snapshot.alerts, 1);

        let alerts = std::fs::read_to_string(dir.path().join("out/alerts.jsonl")).unwrap();
        assert!(alerts.contains("SEVERE_CONGESTION"));
    }

    #[tokio::test]
    async fn test_no_drain_discards_open_windows() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            drain_on_shutdown: false,
            output_path: dir.path().join("out"),
            ..PipelineConfig::default()
        };
        let writer = OutputWriter::new(BackendType::Jsonl, config.sink_path()).unwrap();
        let handle = spawn_pipeline(&config, writer, &HashMap::new());
        let store = handle.store();

        handle.flows.send(sample("seg-1", T0, 30.0)).await.unwrap();
        handle.shutdown().await;

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_first_commit_writes_record_once() {
        let (sink, committed) = FlakySink::new(1);
        let stats = run_sink(sink, vec![analysis_record("seg-1"), analysis_record("seg-2")], 3).await;

        assert_eq!(*committed.lock().unwrap(), vec!["seg-1", "seg-2"]);
        assert_eq!(stats.snapshot().sink_failures, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_discard_queued_record() {
        let (sink, committed) = FlakySink::new(3);
        let stats = run_sink(sink, vec![analysis_record("seg-1"), analysis_record("seg-2")], 2).await;

        // seg-1 used up all three failures and was dropped; seg-2 committed alone
        assert_eq!(*committed.lock().unwrap(), vec!["seg-2"]);
        assert_eq!(stats.snapshot().sink_failures, 1);
    }

    #[tokio::test]
    async fn test_close_windows_publishes_before_routes() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            output_path: dir.path().join("out"),
            ..PipelineConfig::default()
        };
        let writer = OutputWriter::new(BackendType::Jsonl, config.sink_path()).unwrap();
        let mut handle = spawn_pipeline(&config, writer, &HashMap::new());
        let store = handle.store();

        handle.flows.send(sample("seg-1", T0, 32.0)).await.unwrap();
        handle.close_windows().await;

        let latest = store.latest("seg-1").unwrap();
        assert!((latest.congestion_index - 0.8).abs() < 1e-9);
        assert!(handle.flows.send(sample("seg-1", T0 + 1, 32.0)).await.is_err());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_replay_file_counts_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flow.jsonl");
        let lines = format!(
            "{}\nnot json\n\n{}\n",
            r#"{"timestamp": 1700000100, "segment_id": "seg-1", "speed": 20.0, "free_flow_speed": 40.0}"#,
            r#"{"timestamp": 1700000160, "segment_id": "", "speed": 20.0, "free_flow_speed": 40.0}"#,
        );
        std::fs::write(&path, lines).unwrap();

        let stats = PipelineStats::default();
        let (tx, mut rx) = mpsc::channel::<FlowSample>(8);
        let count = replay_file(&path, &tx, &stats).await.unwrap();
        drop(tx);

        assert_eq!(count, 3);
        assert_eq!(stats.snapshot().malformed, 2);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.segment_id, "seg-1");
        assert!(rx.recv().await.is_none());
    }
}
