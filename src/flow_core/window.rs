//! Tumbling time window aggregation for incident and flow streams

use super::normalizer::{FlowSample, IncidentEvent, TimedRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

pub const EVENT_WINDOW_SECS: i64 = 15 * 60;
pub const FLOW_WINDOW_SECS: i64 = 5 * 60;

/// Spatial key: latitude and longitude rounded to a fixed number of decimals,
/// stored as scaled integers so the key is hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpatialCell {
    pub lat_bucket: i64,
    pub lon_bucket: i64,
    pub precision: u32,
}

impl SpatialCell {
    pub fn from_coordinate(lat: f64, lon: f64, precision: u32) -> Self {
        let scale = 10f64.powi(precision as i32);
        Self {
            lat_bucket: (lat * scale).round() as i64,
            lon_bucket: (lon * scale).round() as i64,
            precision,
        }
    }
}

/// Fixed window length plus the grace period applied to the watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub length_secs: i64,
    pub grace_secs: i64,
}

impl WindowSpec {
    pub fn new(length_secs: i64, grace_secs: i64) -> Self {
        Self {
            length_secs,
            grace_secs,
        }
    }

    pub fn window_start(&self, timestamp: i64) -> i64 {
        timestamp.saturating_sub(timestamp.rem_euclid(self.length_secs))
    }

    /// Saturates at `i64::MAX` so a window at the edge of the range never wraps
    pub fn window_end(&self, window_start: i64) -> i64 {
        window_start.saturating_add(self.length_secs)
    }
}

/// What happened to a record handed to an aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Below the severity floor; dropped before windowing
    Filtered,
    /// Already absorbed into its window
    Duplicate,
    /// Older than watermark - grace
    Late,
    /// Advanced the watermark but was excluded from the averages
    Undefined,
}

struct OpenWindow<K, A> {
    seen: HashSet<String>,
    keys: HashMap<K, A>,
}

impl<K, A> Default for OpenWindow<K, A> {
    fn default() -> Self {
        Self {
            seen: HashSet::new(),
            keys: HashMap::new(),
        }
    }
}

/// Keyed tumbling windows closed by watermark advance.
///
/// Accumulators live in an arena indexed by window start then key, and are
/// evicted when their window closes. A window `[start, end)` closes once
/// `watermark - grace >= end`; a record is late once `ts < watermark - grace`.
/// Together these guarantee no accepted record ever lands in a closed window.
struct TumblingWindows<K, A> {
    spec: WindowSpec,
    dedup: bool,
    watermark: Option<i64>,
    open: BTreeMap<i64, OpenWindow<K, A>>,
}

impl<K: Eq + Hash, A: Default> TumblingWindows<K, A> {
    fn new(spec: WindowSpec, dedup: bool) -> Self {
        Self {
            spec,
            dedup,
            watermark: None,
            open: BTreeMap::new(),
        }
    }

    fn horizon(&self) -> Option<i64> {
        self.watermark.map(|wm| wm.saturating_sub(self.spec.grace_secs))
    }

    /// Admit a record; returns its window start when it should be applied
    fn admit<R: TimedRecord>(&mut self, record: &R) -> Result<i64, IngestOutcome> {
        let timestamp = record.timestamp();
        if let Some(horizon) = self.horizon() {
            if timestamp < horizon {
                return Err(IngestOutcome::Late);
            }
        }

        let start = self.spec.window_start(timestamp);
        let window = self.open.entry(start).or_default();
        if self.dedup && !window.seen.insert(record.dedup_key()) {
            return Err(IngestOutcome::Duplicate);
        }

        self.watermark = Some(self.watermark.map_or(timestamp, |wm| wm.max(timestamp)));
        Ok(start)
    }

    fn accumulator(&mut self, start: i64, key: K) -> &mut A {
        self.open
            .entry(start)
            .or_default()
            .keys
            .entry(key)
            .or_default()
    }

    fn take_closed(&mut self) -> Vec<(i64, K, A)> {
        let Some(horizon) = self.horizon() else {
            return Vec::new();
        };
        let mut closed = Vec::new();
        while let Some(entry) = self.open.first_entry() {
            if self.spec.window_end(*entry.key()) > horizon {
                break;
            }
            let (start, window) = entry.remove_entry();
            closed.extend(window.keys.into_iter().map(|(k, acc)| (start, k, acc)));
        }
        closed
    }

    fn take_all(&mut self) -> Vec<(i64, K, A)> {
        std::mem::take(&mut self.open)
            .into_iter()
            .flat_map(|(start, window)| window.keys.into_iter().map(move |(k, acc)| (start, k, acc)))
            .collect()
    }

    fn open_windows(&self) -> usize {
        self.open.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaEventSummary {
    pub window_start: i64,
    pub window_end: i64,
    pub cell: SpatialCell,
    pub event_count: u64,
    pub max_severity: u32,
    pub descriptions: Vec<String>,
}

#[derive(Debug, Default)]
struct EventAccumulator {
    event_count: u64,
    max_severity: u32,
    descriptions: Vec<String>,
}

impl EventAccumulator {
    fn add(&mut self, event: &IncidentEvent) {
        self.event_count += 1;
        self.max_severity = self.max_severity.max(event.severity);
        self.descriptions.push(event.description.clone());
    }
}

/// Buckets incident events into fixed windows per spatial cell
pub struct EventWindowAggregator {
    windows: TumblingWindows<SpatialCell, EventAccumulator>,
    min_severity: u32,
    cell_precision: u32,
}

impl EventWindowAggregator {
    pub fn new(spec: WindowSpec, min_severity: u32, cell_precision: u32, dedup: bool) -> Self {
        Self {
            windows: TumblingWindows::new(spec, dedup),
            min_severity,
            cell_precision,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(WindowSpec::new(EVENT_WINDOW_SECS, 0), 2, 2, true)
    }

    pub fn add_event(&mut self, event: &IncidentEvent) -> IngestOutcome {
        if event.severity < self.min_severity {
            return IngestOutcome::Filtered;
        }

        let start = match self.windows.admit(event) {
            Ok(start) => start,
            Err(outcome) => return outcome,
        };

        let cell = SpatialCell::from_coordinate(event.latitude, event.longitude, self.cell_precision);
        self.windows.accumulator(start, cell).add(event);
        IngestOutcome::Accepted
    }

    /// Summaries for every window the watermark has moved past
    pub fn take_closed(&mut self) -> Vec<AreaEventSummary> {
        let closed = self.windows.take_closed();
        self.summarize(closed)
    }

    /// Close every open window regardless of watermark (shutdown drain)
    pub fn flush_all(&mut self) -> Vec<AreaEventSummary> {
        let all = self.windows.take_all();
        self.summarize(all)
    }

    pub fn watermark(&self) -> Option<i64> {
        self.windows.watermark
    }

    pub fn open_windows(&self) -> usize {
        self.windows.open_windows()
    }

    fn summarize(&self, closed: Vec<(i64, SpatialCell, EventAccumulator)>) -> Vec<AreaEventSummary> {
        let mut summaries: Vec<AreaEventSummary> = closed
            .into_iter()
            .map(|(start, cell, acc)| AreaEventSummary {
                window_start: start,
                window_end: self.windows.spec.window_end(start),
                cell,
                event_count: acc.event_count,
                max_severity: acc.max_severity,
                descriptions: acc.descriptions,
            })
            .collect();
        summaries.sort_by(|a, b| (a.window_start, a.cell).cmp(&(b.window_start, b.cell)));
        summaries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFlowSummary {
    pub window_start: i64,
    pub window_end: i64,
    pub segment_id: String,
    pub avg_speed: f64,
    /// Mean of per-sample speed / free_flow_speed
    pub congestion_index: f64,
    pub update_time: i64,
    pub sample_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinate: Option<(f64, f64)>,
}

#[derive(Debug, Default)]
struct FlowAccumulator {
    sample_count: u64,
    speed_sum: f64,
    ratio_sum: f64,
    update_time: i64,
    coordinate: Option<(f64, f64)>,
}

impl FlowAccumulator {
    fn add(&mut self, sample: &FlowSample, ratio: f64) {
        if self.sample_count == 0 {
            self.update_time = sample.timestamp;
        }
        self.sample_count += 1;
        self.speed_sum += sample.speed;
        self.ratio_sum += ratio;
        self.update_time = self.update_time.max(sample.timestamp);
        if self.coordinate.is_none() {
            self.coordinate = sample.coordinate();
        }
    }
}

/// Buckets flow samples into fixed windows per segment
pub struct FlowWindowAggregator {
    windows: TumblingWindows<String, FlowAccumulator>,
}

impl FlowWindowAggregator {
    pub fn new(spec: WindowSpec, dedup: bool) -> Self {
        Self {
            windows: TumblingWindows::new(spec, dedup),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(WindowSpec::new(FLOW_WINDOW_SECS, 0), true)
    }

    pub fn add_sample(&mut self, sample: &FlowSample) -> IngestOutcome {
        let start = match self.windows.admit(sample) {
            Ok(start) => start,
            Err(outcome) => return outcome,
        };

        match sample.congestion_ratio() {
            Some(ratio) => {
                self.windows
                    .accumulator(start, sample.segment_id.clone())
                    .add(sample, ratio);
                IngestOutcome::Accepted
            }
            None => IngestOutcome::Undefined,
        }
    }

    pub fn take_closed(&mut self) -> Vec<SegmentFlowSummary> {
        let closed = self.windows.take_closed();
        self.summarize(closed)
    }

    pub fn flush_all(&mut self) -> Vec<SegmentFlowSummary> {
        let all = self.windows.take_all();
        self.summarize(all)
    }

    pub fn watermark(&self) -> Option<i64> {
        self.windows.watermark
    }

    pub fn open_windows(&self) -> usize {
        self.windows.open_windows()
    }

    fn summarize(&self, closed: Vec<(i64, String, FlowAccumulator)>) -> Vec<SegmentFlowSummary> {
        let mut summaries: Vec<SegmentFlowSummary> = closed
            .into_iter()
            .filter(|(_, _, acc)| acc.sample_count > 0)
            .map(|(start, segment_id, acc)| {
                let n = acc.sample_count as f64;
                SegmentFlowSummary {
                    window_start: start,
                    window_end: self.windows.spec.window_end(start),
                    segment_id,
                    avg_speed: acc.speed_sum / n,
                    congestion_index: acc.ratio_sum / n,
                    update_time: acc.update_time,
                    sample_count: acc.sample_count,
                    coordinate: acc.coordinate,
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            (a.window_start, &a.segment_id).cmp(&(b.window_start, &b.segment_id))
        });
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(timestamp: i64, severity: u32, lat: f64, lon: f64) -> IncidentEvent {
        IncidentEvent {
            record_id: None,
            timestamp,
            event_type: "ACCIDENT".to_string(),
            latitude: lat,
            longitude: lon,
            severity,
            description: format!("sev {} at {}", severity, timestamp),
        }
    }

    fn sample(timestamp: i64, segment: &str, speed: f64, free_flow_speed: f64) -> FlowSample {
        FlowSample {
            record_id: None,
            timestamp,
            segment_id: segment.to_string(),
            speed,
            free_flow_speed,
            congestion_level: None,
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn test_window_start_buckets() {
        let spec = WindowSpec::new(300, 0);
        assert_eq!(spec.window_start(0), 0);
        assert_eq!(spec.window_start(299), 0);
        assert_eq!(spec.window_start(300), 300);
        assert_eq!(spec.window_start(-1), -300);
    }

    #[test]
    fn test_window_bounds_saturate_at_range_edges() {
        let spec = WindowSpec::new(300, 60);
        let last = spec.window_start(i64::MAX);
        assert_eq!(last, i64::MAX - 7);
        assert_eq!(spec.window_end(last), i64::MAX);

        let mut agg = FlowWindowAggregator::new(spec, true);
        assert_eq!(agg.add_sample(&sample(i64::MIN, "s1", 20.0, 40.0)), IngestOutcome::Accepted);
        assert_eq!(agg.add_sample(&sample(i64::MIN + 5, "s1", 20.0, 40.0)), IngestOutcome::Accepted);
        assert_eq!(agg.add_sample(&sample(i64::MAX, "s1", 20.0, 40.0)), IngestOutcome::Accepted);

        let closed = agg.take_closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].sample_count, 2);

        let remaining = agg.flush_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].window_end, i64::MAX);
    }

    #[test]
    fn test_spatial_cell_rounding() {
        let a = SpatialCell::from_coordinate(40.7128, -74.0060, 2);
        let b = SpatialCell::from_coordinate(40.7149, -74.0051, 2);
        assert_eq!(a, b);
        assert_eq!(a.lat_bucket, 4071);
        assert_eq!(a.lon_bucket, -7401);

        let c = SpatialCell::from_coordinate(40.7251, -74.0060, 2);
        assert_ne!(a, c);
    }

    #[test]
    fn test_congestion_index_is_mean_of_ratios() {
        let mut agg = FlowWindowAggregator::with_defaults();
        assert_eq!(agg.add_sample(&sample(10, "s1", 20.0, 40.0)), IngestOutcome::Accepted);
        assert_eq!(agg.add_sample(&sample(20, "s1", 30.0, 40.0)), IngestOutcome::Accepted);

        let summaries = agg.flush_all();
        assert_eq!(summaries.len(), 1);
        assert!((summaries[0].congestion_index - 0.625).abs() < 1e-12);
        assert!((summaries[0].avg_speed - 25.0).abs() < 1e-12);
        assert_eq!(summaries[0].update_time, 20);
    }

    #[test]
    fn test_mean_of_ratios_not_ratio_of_means() {
        let mut agg = FlowWindowAggregator::with_defaults();
        agg.add_sample(&sample(10, "s1", 10.0, 20.0)); // 0.5
        agg.add_sample(&sample(20, "s1", 90.0, 100.0)); // 0.9

        let summaries = agg.flush_all();
        // ratio of means would be 100 / 120
        assert!((summaries[0].congestion_index - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_zero_free_flow_excluded() {
        let mut agg = FlowWindowAggregator::with_defaults();
        assert_eq!(agg.add_sample(&sample(10, "s1", 30.0, 0.0)), IngestOutcome::Undefined);
        assert_eq!(agg.add_sample(&sample(20, "s1", 20.0, 40.0)), IngestOutcome::Accepted);

        let summaries = agg.flush_all();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].sample_count, 1);
        assert!((summaries[0].congestion_index - 0.5).abs() < 1e-12);
        assert!(summaries[0].congestion_index.is_finite());
    }

    #[test]
    fn test_window_without_valid_samples_emits_nothing() {
        let mut agg = FlowWindowAggregator::with_defaults();
        agg.add_sample(&sample(10, "s1", 30.0, 0.0));
        agg.add_sample(&sample(400, "s2", 30.0, 60.0));

        let closed = agg.take_closed();
        assert!(closed.is_empty());
        assert_eq!(agg.open_windows(), 1);
    }

    #[test]
    fn test_window_closes_on_watermark() {
        let mut agg = FlowWindowAggregator::with_defaults();
        agg.add_sample(&sample(100, "s1", 30.0, 60.0));
        agg.add_sample(&sample(250, "s2", 45.0, 60.0));
        assert!(agg.take_closed().is_empty());

        // Watermark reaches the end of [0, 300)
        agg.add_sample(&sample(300, "s1", 60.0, 60.0));
        let closed = agg.take_closed();
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].segment_id, "s1");
        assert_eq!(closed[1].segment_id, "s2");
        assert!(closed.iter().all(|s| s.window_start == 0 && s.window_end == 300));

        // Window is evicted after closing
        assert!(agg.take_closed().is_empty());
        assert_eq!(agg.open_windows(), 1);
    }

    #[test]
    fn test_grace_period_delays_close() {
        let mut agg = FlowWindowAggregator::new(WindowSpec::new(300, 60), true);
        agg.add_sample(&sample(100, "s1", 30.0, 60.0));
        agg.add_sample(&sample(330, "s1", 30.0, 60.0));
        assert!(agg.take_closed().is_empty());

        // Within grace: still lands in [0, 300)
        assert_eq!(agg.add_sample(&sample(290, "s1", 60.0, 60.0)), IngestOutcome::Accepted);

        agg.add_sample(&sample(360, "s1", 30.0, 60.0));
        let closed = agg.take_closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].sample_count, 2);
    }

    #[test]
    fn test_late_record_dropped() {
        let mut agg = FlowWindowAggregator::with_defaults();
        agg.add_sample(&sample(100, "s1", 30.0, 60.0));
        agg.add_sample(&sample(310, "s1", 30.0, 60.0));
        let first = agg.take_closed();
        assert_eq!(first.len(), 1);

        assert_eq!(agg.add_sample(&sample(120, "s1", 5.0, 60.0)), IngestOutcome::Late);
        assert_eq!(agg.watermark(), Some(310));

        agg.add_sample(&sample(700, "s1", 30.0, 60.0));
        let closed = agg.take_closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].window_start, 300);
    }

    #[test]
    fn test_duplicate_absorbed() {
        let mut agg = FlowWindowAggregator::with_defaults();
        let s = sample(100, "s1", 30.0, 60.0);
        assert_eq!(agg.add_sample(&s), IngestOutcome::Accepted);
        assert_eq!(agg.add_sample(&s), IngestOutcome::Duplicate);

        let summaries = agg.flush_all();
        assert_eq!(summaries[0].sample_count, 1);
    }

    #[test]
    fn test_duplicates_counted_when_dedup_disabled() {
        let mut agg = FlowWindowAggregator::new(WindowSpec::new(300, 0), false);
        let s = sample(100, "s1", 30.0, 60.0);
        agg.add_sample(&s);
        agg.add_sample(&s);

        assert_eq!(agg.flush_all()[0].sample_count, 2);
    }

    #[test]
    fn test_events_filtered_before_windowing() {
        let mut agg = EventWindowAggregator::with_defaults();
        assert_eq!(agg.add_event(&event(100, 1, 40.0, -74.0)), IngestOutcome::Filtered);
        assert_eq!(agg.watermark(), None);
        assert_eq!(agg.open_windows(), 0);

        assert_eq!(agg.add_event(&event(100, 2, 40.0, -74.0)), IngestOutcome::Accepted);
        assert_eq!(agg.watermark(), Some(100));
    }

    #[test]
    fn test_event_summary_by_cell() {
        let mut agg = EventWindowAggregator::with_defaults();
        agg.add_event(&event(100, 2, 40.7128, -74.0060));
        agg.add_event(&event(200, 5, 40.7149, -74.0051));
        agg.add_event(&event(300, 3, 41.0, -73.0));
        agg.add_event(&event(900, 2, 41.0, -73.0));

        let closed = agg.take_closed();
        assert_eq!(closed.len(), 2);

        let nyc = closed.iter().find(|s| s.cell.lat_bucket == 4071).unwrap();
        assert_eq!(nyc.event_count, 2);
        assert_eq!(nyc.max_severity, 5);
        assert_eq!(nyc.descriptions.len(), 2);
        assert_eq!(nyc.window_start, 0);
        assert_eq!(nyc.window_end, 900);

        let other = closed.iter().find(|s| s.cell.lat_bucket == 4100).unwrap();
        assert_eq!(other.event_count, 1);
    }

    #[test]
    fn test_empty_aggregator_emits_nothing() {
        let mut agg = EventWindowAggregator::with_defaults();
        assert!(agg.take_closed().is_empty());
        assert!(agg.flush_all().is_empty());
    }
}
