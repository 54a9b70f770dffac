//! # Streaming Fan-Out Aggregator
//!
//! ## Responsibility
//! Fan one prompt out to N logical models under a single selected route,
//! merge their token streams into candidate events by arrival order,
//! deduplicate on normalized keys, and tolerate per-model failure.
//!
//! ## Guarantees
//! - One route per batch: every model in a fan-out resolves under the same
//!   route, so the result set is internally consistent
//! - At most one in-flight batch per (session, stage); a second request is
//!   rejected with `BatchInProgress`, never queued or merged
//! - A terminal `batch_complete` event is always emitted, even when models
//!   fail or the batch is cancelled
//! - A failing model never aborts its siblings; its classified error is
//!   reported as an `error` event tagged with the model
//! - Cancellation stops candidate emission promptly; underlying network
//!   transfers are torn down best-effort
//!
//! ## NOT Responsible For
//! - Stage gating and selection locks (that belongs to `workflow`)
//! - Prompt construction (callers pass the finished prompt)
//! - Recording accepted candidates (the caller consumes the event stream)
//!
//! ## Span Fields
//!
//! Model tasks and the merge loop run inside structured spans:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `session_id` | Session the batch belongs to |
//! | `request_id` | Unique per-batch id for trace correlation |
//! | `stage` | Stage key string |
//! | `model` | Logical model name (model spans only) |
//! | `duration_ms` | Recorded when the task reaches its terminal state |
//! | `outcome` | `"ok"`, `"err"`, or `"cancelled"` |
//! | `error_kind` | Recorded only on terminal failure |
//!
//! Prompt content and candidate text are never logged, only lengths and
//! counts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::client::{ChatRequest, ProviderClient, ProviderSet, StreamEvent, Usage};
use crate::config::AggregatorConfig;
use crate::dedup::{clean_line, DedupSet, LineAssembler};
use crate::error::{classify_deadline, ErrorKind, ProviderError};
use crate::limiter::{Acquired, RateLimiter};
use crate::metrics;
use crate::registry::{ModelBinding, ModelRegistry};
use crate::retry::{with_jitter, RetryPolicy};
use crate::routing::RouteSelector;
use crate::{Candidate, OrchestratorError, SessionId, StageKey};

// ── Batch request and events ─────────────────────────────────────────────

/// One fan-out request, already gated and prompted by the workflow layer.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Session this batch belongs to.
    pub session: SessionId,
    /// Stage the candidates are generated for.
    pub stage: StageKey,
    /// 1-based batch number within the stage. Drives the temperature ramp
    /// and candidate ids.
    pub batch: u32,
    /// Finished prompt sent to every model.
    pub prompt: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// Logical model names to fan out to.
    pub models: Vec<String>,
    /// Dedup keys of every candidate earlier batches of this stage produced.
    pub seed_keys: Vec<String>,
}

/// Events of one aggregation batch, in emission order.
///
/// Serialized with an `event` tag so the SSE layer can forward them as-is.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    /// The batch has started; candidates will follow.
    BatchStart {
        /// 1-based batch number within the stage.
        batch: u32,
        /// Number of models fanned out to.
        model_count: usize,
        /// Route every model in this batch resolves under.
        route: String,
    },
    /// A unique candidate, forwarded the moment its line completed.
    Candidate {
        /// The accepted candidate.
        candidate: Candidate,
    },
    /// One model's stream finished cleanly.
    ModelComplete {
        /// Logical model name.
        model: String,
        /// Unique candidates this model contributed.
        unique: u32,
        /// Candidates from this model dropped as duplicates.
        duplicates: u32,
        /// Wall-clock duration of the model's task, retries included.
        duration_ms: u64,
    },
    /// One model failed terminally (non-retryable or retries exhausted).
    Error {
        /// Logical model name.
        model: String,
        /// Classified failure kind.
        kind: ErrorKind,
        /// Stable caller-facing message key.
        message_key: &'static str,
        /// Whether the kind is retryable in principle. Terminal here either
        /// way; callers use this for display only.
        retryable: bool,
    },
    /// Terminal event. Always emitted, even on cancellation.
    BatchComplete {
        /// 1-based batch number within the stage.
        batch: u32,
        /// Wall-clock duration of the whole batch.
        duration_ms: u64,
        /// Unique candidates this batch added.
        new_unique: u32,
        /// Distinct keys the stage has seen in total, seeds included.
        stage_total: u32,
        /// Models that failed terminally.
        failed_models: u32,
        /// Whether the batch was cut short by cancellation.
        cancelled: bool,
    },
}

// ── Aggregator ───────────────────────────────────────────────────────────

type FlightKey = (String, String);

/// Concurrent multi-model streaming aggregator.
///
/// Cheap to clone; clones share the in-flight batch table.
#[derive(Clone)]
pub struct StreamAggregator {
    registry: Arc<ModelRegistry>,
    selector: Arc<RouteSelector>,
    providers: ProviderSet,
    limiter: RateLimiter,
    policy: RetryPolicy,
    config: AggregatorConfig,
    inflight: Arc<DashMap<FlightKey, Arc<watch::Sender<bool>>>>,
}

impl std::fmt::Debug for StreamAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAggregator")
            .field("inflight", &self.inflight.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl StreamAggregator {
    /// Build an aggregator over shared routing and provider state.
    pub fn new(
        registry: Arc<ModelRegistry>,
        selector: Arc<RouteSelector>,
        providers: ProviderSet,
        limiter: RateLimiter,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            providers,
            limiter,
            policy: RetryPolicy::from_config(&config),
            config,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Fan a prompt out to the requested models and stream merged events.
    ///
    /// Selects one route for the whole batch, spawns one task per model,
    /// and returns the receiving end of the merged event stream. The batch
    /// runs to its terminal `batch_complete` even if the receiver is
    /// dropped early (dropping it cancels the remaining work).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::BatchInProgress`] when a batch is
    /// already running for the same (session, stage).
    pub fn fan_out(
        &self,
        request: BatchRequest,
    ) -> Result<mpsc::Receiver<BatchEvent>, OrchestratorError> {
        let key: FlightKey = (
            request.session.as_str().to_string(),
            request.stage.to_string(),
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);

        match self.inflight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::warn!(
                    target: "orchestrator::aggregator",
                    session = %key.0,
                    stage = %key.1,
                    "rejecting batch: one is already in flight for this key"
                );
                return Err(OrchestratorError::BatchInProgress {
                    session: key.0,
                    stage: key.1,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        // Route is a batch-level decision so the result set is internally
        // consistent; models are never mixed across routes.
        let route = self.selector.select().clone();
        metrics::inc_route_selection(route.id.as_str());

        let run_id = Uuid::new_v4().to_string();
        let temperature = temperature_for(&self.config, request.batch);
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);
        let (raw_tx, raw_rx) = mpsc::channel(self.config.channel_capacity);

        tracing::info!(
            target: "orchestrator::aggregator",
            session = %key.0,
            stage = %key.1,
            request_id = %run_id,
            batch = request.batch,
            route = %route.id,
            models = request.models.len(),
            temperature,
            "batch starting"
        );

        for logical in &request.models {
            let binding = self.registry.resolve(logical, &route);
            let chat = ChatRequest {
                model: binding.physical.clone(),
                system: request.system.clone(),
                prompt: request.prompt.clone(),
                temperature,
                max_tokens: self.config.max_tokens,
            };

            match self.providers.get(&binding.provider) {
                Some(provider) => {
                    let spec = ModelTaskSpec {
                        logical: logical.clone(),
                        binding,
                        provider,
                        chat,
                        limiter: self.limiter.clone(),
                        policy: self.policy,
                        deadline_secs: self.config.model_deadline_s,
                    };
                    let span = tracing::info_span!(
                        "aggregator.model",
                        session_id = %key.0,
                        request_id = %run_id,
                        stage = %key.1,
                        model = %spec.logical,
                        provider = %spec.binding.provider,
                        duration_ms = tracing::field::Empty,
                        outcome = tracing::field::Empty,
                        error_kind = tracing::field::Empty,
                    );
                    let task = run_model(spec, raw_tx.clone(), cancel_rx.clone());
                    tokio::spawn(task.instrument(span));
                }
                None => {
                    // Config validation ties bindings to providers, so this
                    // only happens with hand-assembled sets. Fail the model,
                    // not the batch.
                    let raw_tx = raw_tx.clone();
                    let model = logical.clone();
                    let error = ProviderError::new(
                        ErrorKind::Unknown,
                        binding.provider,
                        "provider not registered",
                    );
                    tokio::spawn(async move {
                        let _ = raw_tx
                            .send(ModelMessage::Failed {
                                model,
                                error,
                                duration_ms: 0,
                            })
                            .await;
                    });
                }
            }
        }
        drop(raw_tx);

        let merge = MergeSpec {
            key,
            session: request.session,
            stage: request.stage,
            batch: request.batch,
            models: request.models,
            seed_keys: request.seed_keys,
            route: route.id.to_string(),
            inflight: self.inflight.clone(),
            cancel,
        };
        let span = tracing::info_span!(
            "aggregator.batch",
            session_id = %merge.key.0,
            request_id = %run_id,
            stage = %merge.key.1,
            batch = merge.batch,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        tokio::spawn(run_merge(merge, raw_rx, cancel_rx, event_tx).instrument(span));

        Ok(event_rx)
    }

    /// Signal cancellation to every in-flight batch of a session.
    ///
    /// Idempotent; returns the number of batches signalled. Each batch
    /// still emits its terminal `batch_complete` before its key is
    /// released.
    pub fn cancel_session(&self, session: &SessionId) -> usize {
        let mut signalled = 0;
        for entry in self.inflight.iter() {
            if entry.key().0 == session.as_str() {
                let _ = entry.value().send(true);
                signalled += 1;
            }
        }
        if signalled > 0 {
            tracing::info!(
                target: "orchestrator::aggregator",
                session = %session,
                batches = signalled,
                "cancellation signalled"
            );
        }
        signalled
    }

    /// Whether a batch is currently running for (session, stage).
    pub fn is_inflight(&self, session: &SessionId, stage: &StageKey) -> bool {
        self.inflight
            .contains_key(&(session.as_str().to_string(), stage.to_string()))
    }
}

/// Temperature for a batch: ramps up per batch for diversity, capped.
fn temperature_for(config: &AggregatorConfig, batch: u32) -> f32 {
    let ramp = config.temperature_step * batch.saturating_sub(1) as f32;
    (config.temperature_base + ramp).min(config.temperature_max)
}

// ── Model tasks ──────────────────────────────────────────────────────────

/// Messages from model tasks to the merge loop.
enum ModelMessage {
    Line {
        model: String,
        line: String,
    },
    Complete {
        model: String,
        duration_ms: u64,
    },
    Failed {
        model: String,
        error: ProviderError,
        duration_ms: u64,
    },
}

struct ModelTaskSpec {
    logical: String,
    binding: ModelBinding,
    provider: Arc<dyn ProviderClient>,
    chat: ChatRequest,
    limiter: RateLimiter,
    policy: RetryPolicy,
    deadline_secs: u64,
}

enum AttemptOutcome {
    Success { usage: Usage },
    Cancelled,
    Failed(ProviderError),
}

/// Drive one model through its attempts until terminal.
async fn run_model(
    spec: ModelTaskSpec,
    raw_tx: mpsc::Sender<ModelMessage>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let started = Instant::now();

    for attempt in 1..=spec.policy.attempts {
        if *cancel_rx.borrow() {
            Span::current().record("outcome", "cancelled");
            return;
        }

        metrics::inc_provider_request(&spec.binding.provider, &spec.logical);
        let outcome = run_attempt(&spec, &raw_tx, &mut cancel_rx).await;

        match outcome {
            AttemptOutcome::Success { usage } => {
                metrics::record_usage(
                    &spec.binding.provider,
                    &spec.logical,
                    usage.input_tokens,
                    usage.output_tokens,
                    started.elapsed(),
                );
                tracing::debug!(
                    target: "orchestrator::aggregator",
                    model = %spec.logical,
                    provider = %spec.binding.provider,
                    attempt,
                    output_tokens = usage.output_tokens,
                    "model stream complete"
                );
                Span::current().record("duration_ms", started.elapsed().as_millis() as u64);
                Span::current().record("outcome", "ok");
                let _ = raw_tx
                    .send(ModelMessage::Complete {
                        model: spec.logical,
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
                return;
            }
            AttemptOutcome::Cancelled => {
                Span::current().record("outcome", "cancelled");
                return;
            }
            AttemptOutcome::Failed(error) => {
                metrics::inc_provider_error(&error.provider, &error.kind.to_string());

                if error.is_retryable() && attempt < spec.policy.attempts {
                    let delay = with_jitter(spec.policy.delay_for(attempt));
                    tracing::warn!(
                        target: "orchestrator::aggregator",
                        model = %spec.logical,
                        provider = %error.provider,
                        kind = %error.kind,
                        digest = %error.digest,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "model attempt failed; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel_rx.changed() => {
                            Span::current().record("outcome", "cancelled");
                            return;
                        }
                    }
                    continue;
                }

                tracing::warn!(
                    target: "orchestrator::aggregator",
                    model = %spec.logical,
                    provider = %error.provider,
                    kind = %error.kind,
                    digest = %error.digest,
                    attempt,
                    "model failed terminally"
                );
                Span::current().record("duration_ms", started.elapsed().as_millis() as u64);
                Span::current().record("outcome", "err");
                Span::current().record("error_kind", tracing::field::display(error.kind));
                let _ = raw_tx
                    .send(ModelMessage::Failed {
                        model: spec.logical,
                        error,
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
                return;
            }
        }
    }
}

/// One attempt: fresh rate-limit acquisition, stream, line assembly.
///
/// The deadline is absolute per attempt and covers permit wait, connection
/// setup, and the whole stream.
async fn run_attempt(
    spec: &ModelTaskSpec,
    raw_tx: &mpsc::Sender<ModelMessage>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> AttemptOutcome {
    let deadline = Instant::now() + Duration::from_secs(spec.deadline_secs);

    // Every attempt consumes a fresh acquisition; budget is not carried
    // over from a failed attempt.
    let max_wait = deadline.saturating_duration_since(Instant::now());
    let acquired = tokio::select! {
        acquired = spec.limiter.acquire(&spec.binding.limit_key, max_wait) => acquired,
        _ = cancel_rx.changed() => return AttemptOutcome::Cancelled,
    };
    match acquired {
        Ok(Acquired::Immediate) => {}
        Ok(Acquired::AfterWait(waited)) => {
            tracing::debug!(
                target: "orchestrator::aggregator",
                model = %spec.logical,
                limit_key = %spec.binding.limit_key,
                waited_ms = waited.as_millis() as u64,
                "acquired rate-limit permit after wait"
            );
        }
        Err(limited) => {
            return AttemptOutcome::Failed(ProviderError::new(
                ErrorKind::RateLimit,
                spec.binding.provider.clone(),
                &limited.to_string(),
            ));
        }
    }

    let mut stream = match tokio::time::timeout_at(deadline, spec.provider.stream_chat(&spec.chat))
        .await
    {
        Err(_) => {
            return AttemptOutcome::Failed(classify_deadline(
                &spec.binding.provider,
                spec.deadline_secs,
            ));
        }
        Ok(Err(error)) => return AttemptOutcome::Failed(error),
        Ok(Ok(stream)) => stream,
    };

    let mut assembler = LineAssembler::new();
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => return AttemptOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => {
                return AttemptOutcome::Failed(classify_deadline(
                    &spec.binding.provider,
                    spec.deadline_secs,
                ));
            }
            item = stream.next() => match item {
                Some(Ok(StreamEvent::Delta(delta))) => {
                    for line in assembler.push(&delta) {
                        let message = ModelMessage::Line {
                            model: spec.logical.clone(),
                            line,
                        };
                        if raw_tx.send(message).await.is_err() {
                            return AttemptOutcome::Cancelled;
                        }
                    }
                }
                Some(Ok(StreamEvent::Usage(usage))) => {
                    flush_tail(&spec.logical, std::mem::take(&mut assembler), raw_tx).await;
                    return AttemptOutcome::Success { usage };
                }
                Some(Err(error)) => return AttemptOutcome::Failed(error),
                None => {
                    // Clients terminate streams with a usage event; a bare
                    // end still counts as success with zero usage.
                    flush_tail(&spec.logical, std::mem::take(&mut assembler), raw_tx).await;
                    return AttemptOutcome::Success { usage: Usage::default() };
                }
            }
        }
    }
}

/// Forward a model's unterminated final line, if any.
async fn flush_tail(logical: &str, assembler: LineAssembler, raw_tx: &mpsc::Sender<ModelMessage>) {
    if let Some(tail) = assembler.finish() {
        let _ = raw_tx
            .send(ModelMessage::Line {
                model: logical.to_string(),
                line: tail,
            })
            .await;
    }
}

// ── Merge loop ───────────────────────────────────────────────────────────

#[derive(Default, Clone, Copy)]
struct ModelStats {
    unique: u32,
    duplicates: u32,
}

struct MergeSpec {
    key: FlightKey,
    session: SessionId,
    stage: StageKey,
    batch: u32,
    models: Vec<String>,
    seed_keys: Vec<String>,
    route: String,
    inflight: Arc<DashMap<FlightKey, Arc<watch::Sender<bool>>>>,
    cancel: Arc<watch::Sender<bool>>,
}

/// Merge model messages into ordered batch events.
///
/// Owns the stage-scoped dedup set for the duration of the batch. Runs to
/// its terminal event even when the consumer disappears, so the in-flight
/// key is always released.
async fn run_merge(
    spec: MergeSpec,
    mut raw_rx: mpsc::Receiver<ModelMessage>,
    mut cancel_rx: watch::Receiver<bool>,
    event_tx: mpsc::Sender<BatchEvent>,
) {
    let started = Instant::now();
    let stage_label = spec.stage.to_string();
    metrics::inc_batches_inflight(&stage_label);

    let mut dedup = DedupSet::seeded(spec.seed_keys);
    let mut stats: HashMap<String, ModelStats> = spec
        .models
        .iter()
        .map(|m| (m.clone(), ModelStats::default()))
        .collect();
    let mut failed_models = 0u32;
    let mut cancelled = false;

    let start_event = BatchEvent::BatchStart {
        batch: spec.batch,
        model_count: spec.models.len(),
        route: spec.route.clone(),
    };
    if event_tx.send(start_event).await.is_err() {
        cancelled = true;
        let _ = spec.cancel.send(true);
    }

    while !cancelled {
        let message = tokio::select! {
            _ = cancel_rx.changed() => {
                cancelled = true;
                break;
            }
            message = raw_rx.recv() => message,
        };
        let Some(message) = message else {
            break; // every model task reached a terminal state
        };

        match message {
            ModelMessage::Line { model, line } => {
                let Some(text) = clean_line(&line) else {
                    continue;
                };
                match dedup.admit(text) {
                    Some(dedup_key) => {
                        let stat = stats.entry(model.clone()).or_default();
                        let candidate = Candidate {
                            id: format!(
                                "{}_{}_{}_{}",
                                spec.session, model, spec.batch, stat.unique
                            ),
                            text: text.to_string(),
                            model: model.clone(),
                            stage: spec.stage.clone(),
                            batch: spec.batch,
                            dedup_key,
                        };
                        stat.unique += 1;
                        metrics::inc_candidate(&stage_label, &model);
                        tracing::debug!(
                            target: "orchestrator::aggregator",
                            session = %spec.key.0,
                            stage = %stage_label,
                            model = %model,
                            id = %candidate.id,
                            text_chars = candidate.text.chars().count(),
                            "candidate accepted"
                        );
                        if event_tx
                            .send(BatchEvent::Candidate { candidate })
                            .await
                            .is_err()
                        {
                            cancelled = true;
                            let _ = spec.cancel.send(true);
                        }
                    }
                    None => {
                        stats.entry(model.clone()).or_default().duplicates += 1;
                        metrics::inc_duplicate(&stage_label, &model);
                    }
                }
            }
            ModelMessage::Complete { model, duration_ms } => {
                let stat = stats.get(&model).copied().unwrap_or_default();
                tracing::info!(
                    target: "orchestrator::aggregator",
                    session = %spec.key.0,
                    stage = %stage_label,
                    model = %model,
                    unique = stat.unique,
                    duplicates = stat.duplicates,
                    duration_ms,
                    "model complete"
                );
                let event = BatchEvent::ModelComplete {
                    model,
                    unique: stat.unique,
                    duplicates: stat.duplicates,
                    duration_ms,
                };
                if event_tx.send(event).await.is_err() {
                    cancelled = true;
                    let _ = spec.cancel.send(true);
                }
            }
            ModelMessage::Failed {
                model,
                error,
                duration_ms,
            } => {
                failed_models += 1;
                tracing::warn!(
                    target: "orchestrator::aggregator",
                    session = %spec.key.0,
                    stage = %stage_label,
                    model = %model,
                    kind = %error.kind,
                    digest = %error.digest,
                    duration_ms,
                    "model failed; batch continues"
                );
                let event = BatchEvent::Error {
                    model,
                    kind: error.kind,
                    message_key: error.message_key,
                    retryable: error.kind.is_retryable(),
                };
                if event_tx.send(event).await.is_err() {
                    cancelled = true;
                    let _ = spec.cancel.send(true);
                }
            }
        }
    }

    let new_unique: u32 = stats.values().map(|s| s.unique).sum();
    let duration = started.elapsed();
    Span::current().record("duration_ms", duration.as_millis() as u64);
    Span::current().record("outcome", if cancelled { "cancelled" } else { "ok" });

    // Release the key before the terminal event: a consumer that has seen
    // batch_complete may immediately start the next batch.
    metrics::record_batch_duration(&stage_label, duration);
    metrics::dec_batches_inflight(&stage_label);
    spec.inflight.remove(&spec.key);

    let _ = event_tx
        .send(BatchEvent::BatchComplete {
            batch: spec.batch,
            duration_ms: duration.as_millis() as u64,
            new_unique,
            stage_total: dedup.len() as u32,
            failed_models,
            cancelled,
        })
        .await;

    tracing::info!(
        target: "orchestrator::aggregator",
        session = %spec.key.0,
        stage = %stage_label,
        batch = spec.batch,
        new_unique,
        failed_models,
        cancelled,
        duration_ms = duration.as_millis() as u64,
        "batch complete"
    );
}

// ── Tests ──────────────────────────────────────────────────────────────
