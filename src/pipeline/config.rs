//! Pipeline configuration from environment variables

use crate::flow_core::detector::ClassifierThresholds;
use crate::flow_core::scorer::RoutingThresholds;
use crate::flow_core::window::{EVENT_WINDOW_SECS, FLOW_WINDOW_SECS};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Jsonl,
    Sqlite,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
    SegmentDirectory(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigError::SegmentDirectory(msg) => write!(f, "Segment directory error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the pipeline runtime.
///
/// Built once at startup and handed to each stage's constructor.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub backend: BackendType,

    /// Input JSONL streams
    pub events_path: PathBuf,
    pub flow_path: PathBuf,
    pub routes_path: PathBuf,

    /// Output directory for JSONL sinks
    pub output_path: PathBuf,

    /// SQLite database file (used when backend is SQLite)
    pub db_path: PathBuf,

    /// Optional JSON file mapping segment_id to [lat, lon]
    pub segment_directory_path: Option<PathBuf>,

    pub event_window_secs: i64,
    pub flow_window_secs: i64,
    pub watermark_grace_secs: i64,
    pub min_event_severity: u32,
    pub cell_precision: u32,
    pub event_retention_windows: i64,
    pub dedup_enabled: bool,

    /// Bounded buffer between stages
    pub channel_buffer: usize,

    /// Close in-flight windows when inputs end
    pub drain_on_shutdown: bool,

    /// Read input files from the start instead of tailing
    pub replay_from_start: bool,

    pub stats_interval_secs: u64,
    pub sink_max_retries: u32,
    pub sink_retry_initial_ms: u64,

    pub alert_thresholds: ClassifierThresholds,
    pub routing_thresholds: RoutingThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Jsonl,
            events_path: PathBuf::from("streams/traffic_events/events.jsonl"),
            flow_path: PathBuf::from("streams/traffic_flow/flow.jsonl"),
            routes_path: PathBuf::from("streams/route_requests/routes.jsonl"),
            output_path: PathBuf::from("output"),
            db_path: PathBuf::from("data/trafficflow.db"),
            segment_directory_path: None,
            event_window_secs: EVENT_WINDOW_SECS,
            flow_window_secs: FLOW_WINDOW_SECS,
            watermark_grace_secs: 0,
            min_event_severity: 2,
            cell_precision: 2,
            event_retention_windows: 4,
            dedup_enabled: true,
            channel_buffer: 10_000,
            drain_on_shutdown: true,
            replay_from_start: true,
            stats_interval_secs: 30,
            sink_max_retries: 3,
            sink_retry_initial_ms: 500,
            alert_thresholds: ClassifierThresholds::with_defaults(),
            routing_thresholds: RoutingThresholds::with_defaults(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().to_lowercase().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(format!("{}='{}' could not be parsed", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    env::var(name).map(PathBuf::from).unwrap_or(default)
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `EVENTS_STREAM_PATH` (default: streams/traffic_events/events.jsonl)
    /// - `FLOW_STREAM_PATH` (default: streams/traffic_flow/flow.jsonl)
    /// - `ROUTES_STREAM_PATH` (default: streams/route_requests/routes.jsonl)
    /// - `OUTPUT_PATH` (default: output)
    /// - `TRAFFICFLOW_DB_PATH` (default: data/trafficflow.db)
    /// - `SEGMENT_DIRECTORY_PATH` (optional)
    /// - `EVENT_WINDOW_SECS` (default: 900)
    /// - `FLOW_WINDOW_SECS` (default: 300)
    /// - `WATERMARK_GRACE_SECS` (default: 0)
    /// - `MIN_EVENT_SEVERITY` (default: 2)
    /// - `CELL_PRECISION` (default: 2)
    /// - `EVENT_RETENTION_WINDOWS` (default: 4)
    /// - `ENABLE_DEDUP` (default: true)
    /// - `CHANNEL_BUFFER` (default: 10000)
    /// - `DRAIN_ON_SHUTDOWN` (default: true)
    /// - `REPLAY_FROM_START` (default: true)
    /// - `STATS_INTERVAL_SECS` (default: 30)
    /// - `SINK_MAX_RETRIES` (default: 3)
    /// - `SINK_RETRY_INITIAL_MS` (default: 500)
    /// - `ALERT_SEVERE_CONGESTION_INDEX` (default: 0.5)
    /// - `ALERT_MULTIPLE_INCIDENTS` (default: 2)
    /// - `ALERT_CRITICAL_SEVERITY` (default: 4)
    /// - `ROUTE_ALTERNATIVE_CONGESTION_INDEX` (default: 0.6)
    /// - `ROUTE_ALTERNATIVE_EVENT_COUNT` (default: 1)
    /// - `ROUTE_CRITICAL_SEVERITY` (default: 4)
    /// - `ROUTE_ELEVATED_SEVERITY` (default: 2)
    /// - `ROUTE_CAUTION_RISK` (default: 0.5)
    pub fn from_env(backend: BackendType) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let alert = defaults.alert_thresholds;
        let routing = defaults.routing_thresholds;

        let config = Self {
            backend,
            events_path: env_path("EVENTS_STREAM_PATH", defaults.events_path),
            flow_path: env_path("FLOW_STREAM_PATH", defaults.flow_path),
            routes_path: env_path("ROUTES_STREAM_PATH", defaults.routes_path),
            output_path: env_path("OUTPUT_PATH", defaults.output_path),
            db_path: env_path("TRAFFICFLOW_DB_PATH", defaults.db_path),
            segment_directory_path: env::var("SEGMENT_DIRECTORY_PATH").ok().map(PathBuf::from),
            event_window_secs: env_parse("EVENT_WINDOW_SECS", defaults.event_window_secs)?,
            flow_window_secs: env_parse("FLOW_WINDOW_SECS", defaults.flow_window_secs)?,
            watermark_grace_secs: env_parse("WATERMARK_GRACE_SECS", defaults.watermark_grace_secs)?,
            min_event_severity: env_parse("MIN_EVENT_SEVERITY", defaults.min_event_severity)?,
            cell_precision: env_parse("CELL_PRECISION", defaults.cell_precision)?,
            event_retention_windows: env_parse(
                "EVENT_RETENTION_WINDOWS",
                defaults.event_retention_windows,
            )?,
            dedup_enabled: env_parse("ENABLE_DEDUP", defaults.dedup_enabled)?,
            channel_buffer: env_parse("CHANNEL_BUFFER", defaults.channel_buffer)?,
            drain_on_shutdown: env_parse("DRAIN_ON_SHUTDOWN", defaults.drain_on_shutdown)?,
            replay_from_start: env_parse("REPLAY_FROM_START", defaults.replay_from_start)?,
            stats_interval_secs: env_parse("STATS_INTERVAL_SECS", defaults.stats_interval_secs)?,
            sink_max_retries: env_parse("SINK_MAX_RETRIES", defaults.sink_max_retries)?,
            sink_retry_initial_ms: env_parse(
                "SINK_RETRY_INITIAL_MS",
                defaults.sink_retry_initial_ms,
            )?,
            alert_thresholds: ClassifierThresholds {
                severe_congestion_index: env_parse(
                    "ALERT_SEVERE_CONGESTION_INDEX",
                    alert.severe_congestion_index,
                )?,
                multiple_incidents_count: env_parse(
                    "ALERT_MULTIPLE_INCIDENTS",
                    alert.multiple_incidents_count,
                )?,
                critical_severity: env_parse("ALERT_CRITICAL_SEVERITY", alert.critical_severity)?,
            },
            routing_thresholds: RoutingThresholds {
                alternative_congestion_index: env_parse(
                    "ROUTE_ALTERNATIVE_CONGESTION_INDEX",
                    routing.alternative_congestion_index,
                )?,
                alternative_event_count: env_parse(
                    "ROUTE_ALTERNATIVE_EVENT_COUNT",
                    routing.alternative_event_count,
                )?,
                critical_severity: env_parse("ROUTE_CRITICAL_SEVERITY", routing.critical_severity)?,
                elevated_severity: env_parse("ROUTE_ELEVATED_SEVERITY", routing.elevated_severity)?,
                caution_risk: env_parse("ROUTE_CAUTION_RISK", routing.caution_risk)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn parse_backend_from_args() -> BackendType {
        let args: Vec<String> = env::args().collect();

        if let Some(idx) = args.iter().position(|x| x == "--backend") {
            match args.get(idx + 1).map(|s| s.as_str()) {
                Some("sqlite") => return BackendType::Sqlite,
                Some("jsonl") => return BackendType::Jsonl,
                other => log::warn!("Unknown --backend {:?}, defaulting to jsonl", other),
            }
        }

        BackendType::Jsonl
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_window_secs <= 0 || self.flow_window_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "window lengths must be positive".to_string(),
            ));
        }
        if self.watermark_grace_secs < 0 {
            return Err(ConfigError::InvalidValue(
                "WATERMARK_GRACE_SECS cannot be negative".to_string(),
            ));
        }
        if self.channel_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "CHANNEL_BUFFER must be at least 1".to_string(),
            ));
        }
        if self.cell_precision > 6 {
            return Err(ConfigError::InvalidValue(format!(
                "CELL_PRECISION must be <= 6, got {}",
                self.cell_precision
            )));
        }
        if self.event_retention_windows < 1 {
            return Err(ConfigError::InvalidValue(
                "EVENT_RETENTION_WINDOWS must be at least 1".to_string(),
            ));
        }

        let congestion = [
            self.alert_thresholds.severe_congestion_index,
            self.routing_thresholds.alternative_congestion_index,
            self.routing_thresholds.caution_risk,
        ];
        if congestion.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::InvalidValue(
                "congestion and risk thresholds must be finite and non-negative".to_string(),
            ));
        }
        let routing = &self.routing_thresholds;
        if routing.elevated_severity > routing.critical_severity {
            return Err(ConfigError::InvalidValue(format!(
                "ROUTE_ELEVATED_SEVERITY ({}) exceeds ROUTE_CRITICAL_SEVERITY ({})",
                routing.elevated_severity, routing.critical_severity
            )));
        }
        Ok(())
    }

    /// Sink location for the configured backend
    pub fn sink_path(&self) -> PathBuf {
        match self.backend {
            BackendType::Jsonl => self.output_path.clone(),
            BackendType::Sqlite => self.db_path.clone(),
        }
    }

    /// Load `{"segment_id": [lat, lon], ...}` if a directory file is configured
    pub fn load_segment_directory(&self) -> Result<HashMap<String, (f64, f64)>, ConfigError> {
        let Some(path) = &self.segment_directory_path else {
            return Ok(HashMap::new());
        };

        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::SegmentDirectory(format!("{}: {}", path.display(), e))
        })?;
        let directory: HashMap<String, (f64, f64)> = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::SegmentDirectory(format!("{}: {}", path.display(), e))
        })?;

        for (segment, (lat, lon)) in &directory {
            if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
                return Err(ConfigError::SegmentDirectory(format!(
                    "segment {} has invalid coordinate ({}, {})",
                    segment, lat, lon
                )));
            }
        }

        log::info!(
            "🗺️  Loaded {} segment coordinates from {}",
            directory.len(),
            path.display()
        );
        Ok(directory)
    }
}
