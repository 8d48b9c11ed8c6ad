//! Pipeline Engine - stage state and single-threaded orchestration
//!
//! Each stage struct owns the state of one dataflow stage and is driven by
//! exactly one task in `ingestion`. `PipelineEngine` composes the same stages
//! in-line so a whole run can be replayed deterministically.
//!
//! ## Architecture
//!
//! ```text
//! IncidentEvent → EventWindowStage ─→ AreaEventSummary ─┐
//!                                                        ├→ CorrelationStage → AnalysisStore
//! FlowSample ───→ FlowWindowStage ──→ SegmentFlowSummary ┘        ↓
//!                                                    CorrelatedAnalysis → AlertStage
//! RouteRequest ─────────────────────────────→ RoutingStage (reads AnalysisStore)
//! ```

use super::config::PipelineConfig;
use super::stats::PipelineStats;
use super::store::AnalysisStore;
use crate::flow_core::correlator::{CorrelatedAnalysis, CorrelationEngine};
use crate::flow_core::detector::{Alert, AlertClassifier};
use crate::flow_core::normalizer::{FlowSample, IncidentEvent, RouteRequest};
use crate::flow_core::scorer::{RouteRecommendation, RoutingRiskScorer};
use crate::flow_core::window::{
    AreaEventSummary, EventWindowAggregator, FlowWindowAggregator, IngestOutcome,
    SegmentFlowSummary, WindowSpec,
};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

fn record_outcome(stats: &PipelineStats, outcome: IngestOutcome, accepted: &AtomicU64) {
    match outcome {
        IngestOutcome::Accepted => PipelineStats::incr(accepted),
        IngestOutcome::Filtered => PipelineStats::incr(&stats.severity_filtered),
        IngestOutcome::Duplicate => PipelineStats::incr(&stats.duplicates),
        IngestOutcome::Late => PipelineStats::incr(&stats.late_dropped),
        IngestOutcome::Undefined => PipelineStats::incr(&stats.undefined_ratio),
    }
}

pub struct EventWindowStage {
    aggregator: EventWindowAggregator,
    stats: Arc<PipelineStats>,
}

impl EventWindowStage {
    pub fn new(config: &PipelineConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            aggregator: EventWindowAggregator::new(
                WindowSpec::new(config.event_window_secs, config.watermark_grace_secs),
                config.min_event_severity,
                config.cell_precision,
                config.dedup_enabled,
            ),
            stats,
        }
    }

    /// Absorb one event; returns the summaries of any windows it closed
    pub fn ingest(&mut self, event: &IncidentEvent) -> Vec<AreaEventSummary> {
        let outcome = self.aggregator.add_event(event);
        if outcome == IngestOutcome::Late {
            log::debug!(
                "Late event at {} dropped (watermark: {:?})",
                event.timestamp,
                self.aggregator.watermark()
            );
        }
        record_outcome(&self.stats, outcome, &self.stats.events_accepted);
        self.aggregator.take_closed()
    }

    pub fn drain(&mut self) -> Vec<AreaEventSummary> {
        self.aggregator.flush_all()
    }
}

pub struct FlowWindowStage {
    aggregator: FlowWindowAggregator,
    stats: Arc<PipelineStats>,
}

impl FlowWindowStage {
    pub fn new(config: &PipelineConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            aggregator: FlowWindowAggregator::new(
                WindowSpec::new(config.flow_window_secs, config.watermark_grace_secs),
                config.dedup_enabled,
            ),
            stats,
        }
    }

    pub fn ingest(&mut self, sample: &FlowSample) -> Vec<SegmentFlowSummary> {
        let outcome = self.aggregator.add_sample(sample);
        match outcome {
            IngestOutcome::Late => log::debug!(
                "Late flow sample for {} at {} dropped (watermark: {:?})",
                sample.segment_id,
                sample.timestamp,
                self.aggregator.watermark()
            ),
            IngestOutcome::Undefined => log::debug!(
                "Flow sample for {} has free_flow_speed {}; excluded from averages",
                sample.segment_id,
                sample.free_flow_speed
            ),
            _ => {}
        }
        record_outcome(&self.stats, outcome, &self.stats.samples_accepted);
        self.aggregator.take_closed()
    }

    pub fn drain(&mut self) -> Vec<SegmentFlowSummary> {
        self.aggregator.flush_all()
    }
}

/// Sole writer of the latest-analysis table
pub struct CorrelationStage {
    engine: CorrelationEngine,
    store: AnalysisStore,
    stats: Arc<PipelineStats>,
}

impl CorrelationStage {
    pub fn new(
        config: &PipelineConfig,
        directory: &HashMap<String, (f64, f64)>,
        store: AnalysisStore,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let mut engine = CorrelationEngine::new(
            config.event_window_secs,
            config.cell_precision,
            config.event_retention_windows,
        );
        for (segment_id, (lat, lon)) in directory {
            engine.register_segment(segment_id, *lat, *lon);
        }
        Self {
            engine,
            store,
            stats,
        }
    }

    pub fn on_flow_summary(&mut self, summary: SegmentFlowSummary) -> Option<CorrelatedAnalysis> {
        let analysis = self.engine.on_flow_summary(summary)?;
        self.publish(&analysis);
        Some(analysis)
    }

    pub fn on_event_summary(&mut self, summary: AreaEventSummary) -> Vec<CorrelatedAnalysis> {
        let refreshed = self.engine.on_event_summary(summary);
        for analysis in &refreshed {
            self.publish(analysis);
        }
        refreshed
    }

    fn publish(&self, analysis: &CorrelatedAnalysis) {
        self.store.publish(analysis.clone());
        PipelineStats::incr(&self.stats.analyses);
    }

    pub fn tracked_segments(&self) -> usize {
        self.engine.tracked_segments()
    }
}

pub struct AlertStage {
    classifier: AlertClassifier,
    stats: Arc<PipelineStats>,
}

impl AlertStage {
    pub fn new(config: &PipelineConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            classifier: AlertClassifier::new(config.alert_thresholds),
            stats,
        }
    }

    pub fn on_analysis(&self, analysis: &CorrelatedAnalysis) -> Option<Alert> {
        let alert = self.classifier.classify(analysis)?;
        PipelineStats::incr(&self.stats.alerts);
        log::debug!(
            "🚨 {} on {}: {}",
            alert.alert_type.as_str(),
            alert.segment_id,
            alert.details
        );
        Some(alert)
    }
}

/// Scores route requests against whatever the store holds at request time
pub struct RoutingStage {
    scorer: RoutingRiskScorer,
    store: AnalysisStore,
    stats: Arc<PipelineStats>,
}

impl RoutingStage {
    pub fn new(config: &PipelineConfig, store: AnalysisStore, stats: Arc<PipelineStats>) -> Self {
        Self {
            scorer: RoutingRiskScorer::new(config.routing_thresholds),
            store,
            stats,
        }
    }

    pub fn score(&self, request: &RouteRequest) -> RouteRecommendation {
        let analysis = request
            .segment_id
            .as_deref()
            .and_then(|segment| self.store.latest_shared(segment));
        if analysis.is_none() {
            log::debug!(
                "No analysis for route {} (segment: {:?}); scoring worst case",
                request.route_id,
                request.segment_id
            );
        }
        PipelineStats::incr(&self.stats.routes_scored);
        self.scorer.score(request, analysis.as_deref())
    }
}

/// Analyses and alerts produced by one engine step, in emission order
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EngineOutput {
    pub analyses: Vec<CorrelatedAnalysis>,
    pub alerts: Vec<Alert>,
}

impl EngineOutput {
    pub fn is_empty(&self) -> bool {
        self.analyses.is_empty() && self.alerts.is_empty()
    }
}

/// All stages wired in-line on the caller's thread
pub struct PipelineEngine {
    events: EventWindowStage,
    flows: FlowWindowStage,
    correlation: CorrelationStage,
    alerts: AlertStage,
    routing: RoutingStage,
    store: AnalysisStore,
    stats: Arc<PipelineStats>,
}

impl PipelineEngine {
    pub fn new(config: &PipelineConfig, directory: &HashMap<String, (f64, f64)>) -> Self {
        let store = AnalysisStore::new();
        let stats = Arc::new(PipelineStats::default());
        Self {
            events: EventWindowStage::new(config, stats.clone()),
            flows: FlowWindowStage::new(config, stats.clone()),
            correlation: CorrelationStage::new(config, directory, store.clone(), stats.clone()),
            alerts: AlertStage::new(config, stats.clone()),
            routing: RoutingStage::new(config, store.clone(), stats.clone()),
            store,
            stats,
        }
    }

    pub fn process_event(&mut self, event: &IncidentEvent) -> EngineOutput {
        let summaries = self.events.ingest(event);
        self.correlate_events(summaries)
    }

    pub fn process_flow(&mut self, sample: &FlowSample) -> EngineOutput {
        let summaries = self.flows.ingest(sample);
        self.correlate_flows(summaries)
    }

    pub fn score_route(&self, request: &RouteRequest) -> RouteRecommendation {
        self.routing.score(request)
    }

    /// Close every open window, events first so flow windows join them directly
    pub fn drain(&mut self) -> EngineOutput {
        let event_summaries = self.events.drain();
        let mut output = self.correlate_events(event_summaries);
        let flow_summaries = self.flows.drain();
        let flows = self.correlate_flows(flow_summaries);
        output.analyses.extend(flows.analyses);
        output.alerts.extend(flows.alerts);
        output
    }

    fn correlate_events(&mut self, summaries: Vec<AreaEventSummary>) -> EngineOutput {
        let mut analyses = Vec::new();
        for summary in summaries {
            analyses.extend(self.correlation.on_event_summary(summary));
        }
        self.with_alerts(analyses)
    }

    fn correlate_flows(&mut self, summaries: Vec<SegmentFlowSummary>) -> EngineOutput {
        let analyses = summaries
            .into_iter()
            .filter_map(|summary| self.correlation.on_flow_summary(summary))
            .collect();
        self.with_alerts(analyses)
    }

    fn with_alerts(&self, analyses: Vec<CorrelatedAnalysis>) -> EngineOutput {
        let alerts = analyses
            .iter()
            .filter_map(|analysis| self.alerts.on_analysis(analysis))
            .collect();
        EngineOutput { analyses, alerts }
    }

    pub fn store(&self) -> &AnalysisStore {
        &self.store
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn tracked_segments(&self) -> usize {
        self.correlation.tracked_segments()
    }
}
