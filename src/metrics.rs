//! Prometheus metrics for the candidate orchestrator.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** the first batch
//! runs. Every helper (`record_usage`, `inc_candidate`, …) is a no-op if
//! `init_metrics` was never called, so the orchestrator is always safe to
//! run — observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `orchestrator_provider_requests_total` | Counter | `provider`, `model` |
//! | `orchestrator_provider_errors_total` | Counter | `provider`, `kind` |
//! | `orchestrator_candidates_total` | Counter | `stage`, `model` |
//! | `orchestrator_duplicates_total` | Counter | `stage`, `model` |
//! | `orchestrator_route_selections_total` | Counter | `route` |
//! | `orchestrator_usage_tokens_total` | Counter | `provider`, `model`, `direction` |
//! | `orchestrator_model_duration_seconds` | Histogram | `provider`, `model` |
//! | `orchestrator_batch_duration_seconds` | Histogram | `stage` |
//! | `orchestrator_batches_inflight` | Gauge | `stage` |

use crate::OrchestratorError;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the orchestrator, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Provider calls attempted, per provider and logical model.
    pub provider_requests: CounterVec,
    /// Classified provider failures, per provider and error kind.
    pub provider_errors: CounterVec,
    /// Unique candidates emitted, per stage and logical model.
    pub candidates_total: CounterVec,
    /// Candidates dropped as duplicates, per stage and logical model.
    pub duplicates_total: CounterVec,
    /// Route selections, per route.
    pub route_selections: CounterVec,
    /// Token usage, per provider, logical model, and direction.
    pub usage_tokens: CounterVec,
    /// Wall-clock duration of one model's stream, attempt retries included.
    pub model_duration: HistogramVec,
    /// Wall-clock duration of a whole batch, per stage.
    pub batch_duration: HistogramVec,
    /// Batches currently running, per stage.
    pub batches_inflight: IntGaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

fn register_counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<CounterVec, OrchestratorError> {
    let counter = CounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;
    Ok(counter)
}

fn register_histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<HistogramVec, OrchestratorError> {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help), labels)
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;
    Ok(histogram)
}

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Must be called once at process startup before the first batch is started.
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let provider_requests = register_counter(
        &registry,
        "orchestrator_provider_requests_total",
        "Provider calls attempted",
        &["provider", "model"],
    )?;
    let provider_errors = register_counter(
        &registry,
        "orchestrator_provider_errors_total",
        "Classified provider failures",
        &["provider", "kind"],
    )?;
    let candidates_total = register_counter(
        &registry,
        "orchestrator_candidates_total",
        "Unique candidates emitted",
        &["stage", "model"],
    )?;
    let duplicates_total = register_counter(
        &registry,
        "orchestrator_duplicates_total",
        "Candidates dropped as duplicates",
        &["stage", "model"],
    )?;
    let route_selections = register_counter(
        &registry,
        "orchestrator_route_selections_total",
        "Route selections per batch",
        &["route"],
    )?;
    let usage_tokens = register_counter(
        &registry,
        "orchestrator_usage_tokens_total",
        "Tokens consumed and produced",
        &["provider", "model", "direction"],
    )?;
    let model_duration = register_histogram(
        &registry,
        "orchestrator_model_duration_seconds",
        "Duration of one model stream within a batch",
        &["provider", "model"],
    )?;
    let batch_duration = register_histogram(
        &registry,
        "orchestrator_batch_duration_seconds",
        "Duration of a whole fan-out batch",
        &["stage"],
    )?;

    let batches_inflight = IntGaugeVec::new(
        Opts::new("orchestrator_batches_inflight", "Batches currently running"),
        &["stage"],
    )
    .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(batches_inflight.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

    // If another thread raced us, the first one wins — both initializations
    // produce identical metric descriptors, so neither outcome is incorrect.
    let _ = METRICS.set(Metrics {
        registry,
        provider_requests,
        provider_errors,
        candidates_total,
        duplicates_total,
        route_selections,
        usage_tokens,
        model_duration,
        batch_duration,
        batches_inflight,
    });

    Ok(())
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one attempted provider call.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_provider_request(provider: &str, model: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .provider_requests
            .get_metric_with_label_values(&[provider, model])
        {
            c.inc();
        }
    }
}

/// Count one classified provider failure.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_provider_error(provider: &str, kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .provider_errors
            .get_metric_with_label_values(&[provider, kind])
        {
            c.inc();
        }
    }
}

/// Count one unique candidate emitted to the caller.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_candidate(stage: &str, model: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .candidates_total
            .get_metric_with_label_values(&[stage, model])
        {
            c.inc();
        }
    }
}

/// Count one candidate dropped by deduplication.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_duplicate(stage: &str, model: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .duplicates_total
            .get_metric_with_label_values(&[stage, model])
        {
            c.inc();
        }
    }
}

/// Count one route selection.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_route_selection(route: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.route_selections.get_metric_with_label_values(&[route]) {
            c.inc();
        }
    }
}

/// Record token usage and stream duration for one completed model call.
///
/// Fire-and-forget: failures to record are swallowed, and nothing is
/// recorded before [`init_metrics`].
///
/// # Panics
///
/// This function never panics.
pub fn record_usage(
    provider: &str,
    model: &str,
    input_tokens: u32,
    output_tokens: u32,
    latency: Duration,
) {
    let Some(m) = metrics() else {
        return;
    };
    if let Ok(c) = m
        .usage_tokens
        .get_metric_with_label_values(&[provider, model, "input"])
    {
        c.inc_by(f64::from(input_tokens));
    }
    if let Ok(c) = m
        .usage_tokens
        .get_metric_with_label_values(&[provider, model, "output"])
    {
        c.inc_by(f64::from(output_tokens));
    }
    if let Ok(h) = m
        .model_duration
        .get_metric_with_label_values(&[provider, model])
    {
        h.observe(latency.as_secs_f64());
    }
}

/// Record the wall-clock duration of a completed batch.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_batch_duration(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.batch_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Mark one batch as started for a stage.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_batches_inflight(stage: &str) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.batches_inflight.get_metric_with_label_values(&[stage]) {
            g.inc();
        }
    }
}

/// Mark one batch as finished for a stage.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn dec_batches_inflight(stage: &str) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.batches_inflight.get_metric_with_label_values(&[stage]) {
            g.dec();
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails. Observability degrades gracefully rather than panicking.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// ── Tests ──────────────────────────────────────────────────────────────
