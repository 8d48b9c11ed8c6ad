//! # Traffic Pipeline Runtime
//!
//! Async runtime around `flow_core`: configuration, stage tasks connected by
//! bounded channels, the concurrent latest-analysis store, and counters.
//!
//! ## Stages
//!
//! 1. Event window stage: 15 minute windows per spatial cell
//! 2. Flow window stage: 5 minute windows per segment
//! 3. Correlator: left outer join of flow windows against incident cells,
//!    sole writer of the `AnalysisStore`
//! 4. Alert stage: one classification per emitted analysis
//! 5. Routing stage: scores route requests against the store
//! 6. Sink stage: append-only JSONL or SQLite output with retry
//!
//! Records are never persisted between stages; a restart rebuilds window
//! state by replaying the input files.

pub mod config;
pub mod engine;
pub mod ingestion;
pub mod retry;
pub mod stats;
pub mod store;

pub use config::{BackendType, ConfigError, PipelineConfig};
pub use engine::{EngineOutput, PipelineEngine};
pub use ingestion::{forward_tail, replay_file, spawn_pipeline, PipelineHandle};
pub use stats::{PipelineStats, StatsSnapshot};
pub use store::AnalysisStore;
