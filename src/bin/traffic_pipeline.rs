//! Traffic Pipeline - streaming telemetry engine entry point
//!
//! Reads incident events, flow samples and route requests from JSONL files,
//! runs them through the windowing and correlation stages, and appends
//! analyses, alerts and route recommendations to the configured sink.
//!
//! Usage:
//!   traffic_pipeline [--backend jsonl|sqlite] [--once]
//!
//! `--once` replays events and flow to EOF, closes every window, then scores
//! the route file against the final analyses and exits.
//! Without it the inputs are tailed until Ctrl+C.
//!
//! See `PipelineConfig::from_env` for the environment variables.

use dotenv::dotenv;
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use trafficflow::flow_core::{FlowSample, IncidentEvent, OutputWriter, RouteRequest, TailReader};
use trafficflow::pipeline::{
    forward_tail, replay_file, spawn_pipeline, PipelineConfig, PipelineHandle, PipelineStats,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let backend = PipelineConfig::parse_backend_from_args();
    let once = env::args().any(|arg| arg == "--once");

    let config = PipelineConfig::from_env(backend)?;
    let directory = config.load_segment_directory()?;

    info!("🚦 Traffic Pipeline");
    info!("   ├─ Events: {}", config.events_path.display());
    info!("   ├─ Flow: {}", config.flow_path.display());
    info!("   ├─ Routes: {}", config.routes_path.display());
    info!("   ├─ Sink: {}", config.sink_path().display());
    info!(
        "   └─ Mode: {}",
        if once { "replay once" } else { "tail" }
    );

    let writer = OutputWriter::new(config.backend, config.sink_path())?;
    let mut handle = spawn_pipeline(&config, writer, &directory);
    let stats = handle.stats();

    let ticker = spawn_stats_ticker(stats.clone(), config.stats_interval_secs);

    if once {
        replay_inputs(&config, &mut handle).await;
    } else {
        tail_until_interrupted(&config, &handle).await;
    }

    ticker.abort();
    info!("🔄 Draining pipeline...");
    handle.shutdown().await;
    stats.log_summary();

    Ok(())
}

fn spawn_stats_ticker(stats: Arc<PipelineStats>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if interval_secs == 0 {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            stats.log_summary();
        }
    })
}

async fn replay_inputs(config: &PipelineConfig, handle: &mut PipelineHandle) {
    let stats = handle.stats();

    // Events before flow so drained flow windows join existing incident cells
    if let Err(e) = replay_file::<IncidentEvent>(&config.events_path, &handle.events, &stats).await {
        warn!("⚠️  Could not replay {}: {}", config.events_path.display(), e);
    }
    if let Err(e) = replay_file::<FlowSample>(&config.flow_path, &handle.flows, &stats).await {
        warn!("⚠️  Could not replay {}: {}", config.flow_path.display(), e);
    }

    handle.close_windows().await;
    if let Err(e) = replay_file::<RouteRequest>(&config.routes_path, &handle.routes, &stats).await {
        warn!("⚠️  Could not replay {}: {}", config.routes_path.display(), e);
    }
}

async fn tail_until_interrupted(config: &PipelineConfig, handle: &PipelineHandle) {
    let stats = handle.stats();
    let from_start = config.replay_from_start;

    let events = tokio::spawn(forward_tail(
        TailReader::new(config.events_path.clone()).from_beginning(from_start),
        handle.events.clone(),
        stats.clone(),
    ));
    let flows = tokio::spawn(forward_tail(
        TailReader::new(config.flow_path.clone()).from_beginning(from_start),
        handle.flows.clone(),
        stats.clone(),
    ));
    let routes = tokio::spawn(forward_tail(
        TailReader::new(config.routes_path.clone()).from_beginning(from_start),
        handle.routes.clone(),
        stats,
    ));

    let readers = [events, flows, routes];

    info!("✅ Tailing inputs (Ctrl+C to stop)");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Failed to listen for shutdown signal: {}", e);
    }
    info!("🛑 Shutdown requested");

    // Readers hold sender clones; they must be gone before the stages can close
    for reader in readers {
        reader.abort();
        match reader.await {
            Ok(Err(e)) => error!("❌ Reader failed: {}", e),
            Ok(Ok(())) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("❌ Reader task panicked: {}", e),
        }
    }
}
