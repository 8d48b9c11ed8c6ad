//! Flow Core - Windowed Aggregation and Stream Correlation
//!
//! Synchronous building blocks for the traffic telemetry engine. Every piece
//! here is single-owner state or a pure function; the async stage wiring
//! lives in `crate::pipeline`.
//!
//! # Architecture
//!
//! ```text
//! IncidentEvent ─→ EventWindowAggregator (15m × lat/lon cell) ─┐
//!                                                               ├─→ CorrelationEngine
//! FlowSample ────→ FlowWindowAggregator (5m × segment_id) ─────┘        ↓
//!                                                          CorrelatedAnalysis
//!                                                           ↓              ↓
//!                                                  AlertClassifier   RoutingRiskScorer ←─ RouteRequest
//!                                                           ↓              ↓
//!                                                   OutputWriter → JSONL or SQLite backend
//! ```

pub mod correlator;
pub mod detector;
pub mod jsonl_writer;
pub mod normalizer;
pub mod reader;
pub mod scorer;
pub mod sqlite_writer;
pub mod window;
pub mod writer;
pub mod writer_backend;

pub use correlator::{CorrelatedAnalysis, CorrelationEngine};
pub use detector::{Alert, AlertClassifier, AlertType, ClassifierThresholds};
pub use jsonl_writer::JsonlSinkWriter;
pub use normalizer::{FlowSample, IncidentEvent, Record, RecordError, RouteRequest, TimedRecord};
pub use reader::TailReader;
pub use scorer::{Recommendation, RouteRecommendation, RoutingRiskScorer, RoutingThresholds};
pub use sqlite_writer::SqliteSinkWriter;
pub use window::{
    AreaEventSummary, EventWindowAggregator, FlowWindowAggregator, IngestOutcome,
    SegmentFlowSummary, SpatialCell, WindowSpec,
};
pub use writer::OutputWriter;
pub use writer_backend::{SinkBackend, SinkError, SinkRecord};
