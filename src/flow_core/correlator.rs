//! Cross-stream correlation engine joining flow windows against incident cells

use super::window::{AreaEventSummary, SegmentFlowSummary, SpatialCell, EVENT_WINDOW_SECS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-segment merged view of the latest flow window and matching incidents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedAnalysis {
    pub segment_id: String,
    pub window_start: i64,
    pub avg_speed: f64,
    pub congestion_index: f64,
    pub event_count: u64,
    pub max_severity: u32,
    pub update_time: i64,
}

pub struct CorrelationEngine {
    event_window_secs: i64,
    cell_precision: u32,
    retention_windows: i64,
    segment_cells: HashMap<String, SpatialCell>,
    event_summaries: HashMap<(i64, SpatialCell), AreaEventSummary>,
    latest_flow: HashMap<String, SegmentFlowSummary>,
    newest_event_window: Option<i64>,
}

impl CorrelationEngine {
    pub fn new(event_window_secs: i64, cell_precision: u32, retention_windows: i64) -> Self {
        Self {
            event_window_secs,
            cell_precision,
            retention_windows,
            segment_cells: HashMap::new(),
            event_summaries: HashMap::new(),
            latest_flow: HashMap::new(),
            newest_event_window: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EVENT_WINDOW_SECS, 2, 4)
    }

    /// Pin a segment's representative coordinate (segment directory entries win
    /// over coordinates carried on flow samples)
    pub fn register_segment(&mut self, segment_id: &str, lat: f64, lon: f64) {
        let cell = SpatialCell::from_coordinate(lat, lon, self.cell_precision);
        self.segment_cells.insert(segment_id.to_string(), cell);
    }

    pub fn segment_cell(&self, segment_id: &str) -> Option<SpatialCell> {
        self.segment_cells.get(segment_id).copied()
    }

    /// Driving side of the left outer join.
    ///
    /// Returns `None` when the summary is older than the segment's latest
    /// window; an out-of-order window never replaces a newer analysis.
    pub fn on_flow_summary(&mut self, summary: SegmentFlowSummary) -> Option<CorrelatedAnalysis> {
        if let Some(current) = self.latest_flow.get(&summary.segment_id) {
            if current.window_start > summary.window_start {
                log::debug!(
                    "Ignoring stale flow window {} for {} (latest: {})",
                    summary.window_start,
                    summary.segment_id,
                    current.window_start
                );
                return None;
            }
        }

        if let Some((lat, lon)) = summary.coordinate {
            let cell = SpatialCell::from_coordinate(lat, lon, self.cell_precision);
            self.segment_cells
                .entry(summary.segment_id.clone())
                .or_insert(cell);
        }

        let analysis = self.correlate(&summary);
        self.latest_flow.insert(summary.segment_id.clone(), summary);
        Some(analysis)
    }

    /// Store an incident summary and re-emit every segment whose latest flow
    /// window falls inside it and whose cell matches
    pub fn on_event_summary(&mut self, summary: AreaEventSummary) -> Vec<CorrelatedAnalysis> {
        let window = summary.window_start;
        let cell = summary.cell;
        self.event_summaries.insert((window, cell), summary);
        self.newest_event_window = Some(self.newest_event_window.map_or(window, |w| w.max(window)));
        self.evict_expired();

        let mut refreshed: Vec<CorrelatedAnalysis> = self
            .latest_flow
            .values()
            .filter(|flow| self.event_window_of(flow.window_start) == window)
            .filter(|flow| self.segment_cells.get(&flow.segment_id) == Some(&cell))
            .map(|flow| self.correlate(flow))
            .collect();
        refreshed.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));
        refreshed
    }

    fn event_window_of(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.event_window_secs) * self.event_window_secs
    }

    fn correlate(&self, flow: &SegmentFlowSummary) -> CorrelatedAnalysis {
        let event_window = self.event_window_of(flow.window_start);
        let events = self
            .segment_cells
            .get(&flow.segment_id)
            .and_then(|cell| self.event_summaries.get(&(event_window, *cell)));

        CorrelatedAnalysis {
            segment_id: flow.segment_id.clone(),
            window_start: flow.window_start,
            avg_speed: flow.avg_speed,
            congestion_index: flow.congestion_index,
            event_count: events.map_or(0, |e| e.event_count),
            max_severity: events.map_or(0, |e| e.max_severity),
            update_time: flow.update_time,
        }
    }

    fn evict_expired(&mut self) {
        if let Some(newest) = self.newest_event_window {
            let cutoff = newest - self.retention_windows * self.event_window_secs;
            self.event_summaries.retain(|(window, _), _| *window > cutoff);
        }
    }

    pub fn tracked_segments(&self) -> usize {
        self.latest_flow.len()
    }

    pub fn retained_event_summaries(&self) -> usize {
        self.event_summaries.len()
    }
}
