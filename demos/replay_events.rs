use anyhow::Result;
use graph_telemetry::{
    setup_logging, ErrorExt, LogConfig, MetricsRegistry, Millis, NodeEvent, SamplePhase, TelemetryConfig,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use tracing::{info, warn};

// Synthetic run: loader, sampler, decoder; every other run hits the loader cache
fn synthetic_events(runs: usize) -> Vec<NodeEvent> {
    let mut events = Vec::new();
    let base: Millis = graph_telemetry::types::now_millis().saturating_sub(runs as Millis * 60_000);

    for run in 0..runs {
        let prompt_id = format!("prompt-{}", run);
        let mut t = base + run as Millis * 60_000;
        for (node_id, node_type, duration, vram) in [
            ("1", "CheckpointLoader", 800, 4_000_000_000u64),
            ("2", "KSampler", 2_500, 6_500_000_000),
            ("3", "VAEDecode", 400, 5_000_000_000),
        ] {
            let mut start = NodeEvent::start(&prompt_id, node_id, node_type, t);
            start.vram_before = Some(vram / 2);
            events.push(start);
            events.push(
                NodeEvent::sample(&prompt_id, node_id, SamplePhase::During, t + duration / 2)
                    .with_vram_sample(vram + 250_000_000),
            );
            t += duration;
            events.push(NodeEvent::end(&prompt_id, node_id, t).with_vram(vram / 2, vram));
            let hit = node_type == "CheckpointLoader" && run % 2 == 1;
            events.push(NodeEvent::cache_resolved(&prompt_id, node_id, hit, t));
        }
    }
    events
}

fn read_events(path: &str) -> Result<Vec<NodeEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<NodeEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(line = number + 1, error = %e, "Skipping malformed event"),
        }
    }
    Ok(events)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(LogConfig::default())?;

    // Optional argument: a file with one JSON event per line
    let args: Vec<String> = std::env::args().collect();
    let events = match args.get(1) {
        Some(path) => read_events(path)?,
        None => synthetic_events(6),
    };

    let mut config = TelemetryConfig::default();
    config.history.max_data_points = 4;
    config.monitoring.tracing_enabled = true;

    info!(events = events.len(), "Replaying events");
    let registry = MetricsRegistry::init(config).await?;

    // Each workflow ends at its last event
    let mut last_seen: BTreeMap<String, Millis> = BTreeMap::new();
    for event in &events {
        // Event-level failures are already logged and counted
        if let Err(e) = registry.handle_event(event) {
            if !e.is_event_level() {
                warn!(error = %e, "Unexpected ingest failure");
            }
        }
        let last = last_seen.entry(event.prompt_id.clone()).or_insert(event.timestamp);
        *last = (*last).max(event.timestamp);
    }
    for (prompt_id, end_time) in &last_seen {
        if let Err(e) = registry.finalize(prompt_id, *end_time) {
            warn!(%prompt_id, error = %e, "Could not finalize workflow");
        }
    }

    let stats = registry.get_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    for range in ["1h", "24h", "all"] {
        println!("{:>4}: {} workflows", range, registry.get_history(range).len());
    }

    registry.shutdown().await;
    Ok(())
}
