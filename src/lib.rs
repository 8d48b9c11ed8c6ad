//! Streaming traffic telemetry engine.
//!
//! Incident events and road-segment flow readings are bucketed into tumbling
//! windows, joined per segment into a correlated analysis, classified into
//! alerts, and used to score incoming route requests.

pub mod flow_core;
pub mod pipeline;
