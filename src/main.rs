//! Demo binary for candidate-orchestrator
//!
//! Runs one staged candidate session end to end against echo providers:
//! dimensions, parts, then subparts per selected part.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter (default: info)

use candidate_orchestrator::aggregator::BatchEvent;
use candidate_orchestrator::config::loader;
use candidate_orchestrator::orchestrator::SessionEvent;
use candidate_orchestrator::{
    init_tracing, metrics, metrics_server, Orchestrator, SessionId, StageKey,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

const DEMO_CONFIG: &str = r#"
[orchestrator]
name = "candidate-orchestrator-demo"
description = "echo-provider walkthrough of the staged workflow"
worker_processes = 1

[routing]
strategy = "weighted"
default_route = "primary"

[[routing.routes]]
name = "primary"
weight = 80
default_provider = "echo"

[[routing.routes]]
name = "fallback"
weight = 20
default_provider = "echo"

[[models]]
logical = "qwen"
route = "primary"
provider = "echo"
physical = "qwen-plus"

[[models]]
logical = "deepseek"
route = "primary"
provider = "echo"
physical = "deepseek-chat"

[[models]]
logical = "hunyuan"
route = "primary"
provider = "echo"
physical = "hunyuan-turbo"

[[models]]
logical = "kimi"
route = "primary"
provider = "echo"
physical = "moonshot-v1"

[[providers]]
name = "echo"
kind = "echo"

[aggregator]
candidates_per_model = 5
max_tokens = 500
model_deadline_s = 20

[workflow]
session_idle_timeout_s = 1800
sweep_interval_s = 300

[observability]
log_format = "pretty"
metrics_port = 9090
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();

    // Initialize the metrics registry before anything records into it.
    metrics::init_metrics()?;

    info!(
        started_at = %chrono::Utc::now().to_rfc3339(),
        "Starting candidate-orchestrator demo"
    );

    let config = loader::load_from_str(DEMO_CONFIG, "demo-config")?;
    if let Some(port) = config.observability.metrics_port {
        let addr = format!("127.0.0.1:{port}");
        tokio::spawn(async move {
            if let Err(error) = metrics_server::start_server(&addr).await {
                tracing::debug!(%error, "metrics endpoint not started");
            }
        });
    }

    let orchestrator = Orchestrator::from_config(config)?;
    let sweeper = orchestrator.spawn_idle_sweeper();

    // ── Stage 1: dimensions ──────────────────────────────────────────────
    let session = SessionId::new("demo-session");
    let rx = orchestrator
        .start(&session, "brace_map", &json!({ "whole": "Bicycle" }))
        .await?;
    let dimension_ids = pump(rx).await;

    let chosen = dimension_ids
        .first()
        .cloned()
        .ok_or("no dimension candidates generated")?;
    let snapshot = orchestrator
        .select(&session, &StageKey::Dimensions, &[chosen])
        .await?;
    info!(next = ?snapshot.current, "dimension locked");

    // ── Stage 2: parts ───────────────────────────────────────────────────
    let rx = orchestrator.next_batch(&session, &StageKey::Parts, None)?;
    let part_ids: Vec<String> = pump(rx).await.into_iter().take(3).collect();
    if part_ids.is_empty() {
        return Err("no part candidates generated".into());
    }
    let mut snapshot = orchestrator
        .select(&session, &StageKey::Parts, &part_ids)
        .await?;
    info!(parts = part_ids.len(), next = ?snapshot.current, "parts locked");

    // ── Stage 3: subparts, tab by tab ────────────────────────────────────
    while let Some(stage) = snapshot.current.clone() {
        let rx = orchestrator.next_batch(&session, &stage, None)?;
        let subpart_ids: Vec<String> = pump(rx).await.into_iter().take(2).collect();
        if subpart_ids.is_empty() {
            return Err("no subpart candidates generated".into());
        }
        snapshot = orchestrator.select(&session, &stage, &subpart_ids).await?;
        info!(stage = %stage, next = ?snapshot.current, "subparts locked");
    }

    let done = orchestrator.finish(&session)?;
    info!(stages = done.stages.len(), "session finished");

    sweeper.abort();

    // Dump the counters the session produced.
    for line in metrics::gather_metrics()
        .lines()
        .filter(|l| l.starts_with("orchestrator_") && !l.contains("_bucket"))
    {
        info!("{line}");
    }

    Ok(())
}

/// Drain one session stream, logging as events arrive. Returns the ids of
/// every candidate seen, in arrival order.
async fn pump(mut rx: mpsc::Receiver<SessionEvent>) -> Vec<String> {
    let mut ids = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::StateChanged(state) => {
                info!(
                    current = ?state.snapshot.current,
                    resumed = state.snapshot.resumed,
                    "state"
                );
            }
            SessionEvent::Batch(BatchEvent::Candidate { candidate }) => {
                info!(
                    id = %candidate.id,
                    model = %candidate.model,
                    text_chars = candidate.text.chars().count(),
                    "candidate"
                );
                ids.push(candidate.id);
            }
            SessionEvent::Batch(BatchEvent::Error { model, kind, .. }) => {
                info!(%model, %kind, "model failed");
            }
            SessionEvent::Batch(BatchEvent::BatchComplete {
                new_unique,
                failed_models,
                duration_ms,
                ..
            }) => {
                info!(new_unique, failed_models, duration_ms, "batch complete");
            }
            SessionEvent::Batch(_) => {}
        }
    }
    ids
}
