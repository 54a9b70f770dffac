//! # Orchestration Facade
//!
//! ## Responsibility
//! Assemble the full stack from configuration and expose the five session
//! operations: `start`, `next_batch`, `select`, `cancel`, `finish`. Relay
//! aggregation events to the caller while recording candidates into the
//! workflow, and clear the stage's generation guard exactly when the
//! terminal event is handed over.
//!
//! ## Guarantees
//! - `start` emits a `state_changed` snapshot before any batch event
//! - A candidate is recorded in the workflow before its event is forwarded
//! - A forwarded `batch_complete` implies the stage accepts the next batch
//! - A consumer that hangs up cancels the generation it was watching; the
//!   batch still runs to its terminal event internally
//!
//! ## NOT Responsible For
//! - Stage gating rules (workflow) and fan-out mechanics (aggregator)
//! - HTTP/SSE transport; callers adapt the event channel themselves

use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregator::{BatchEvent, BatchRequest, StreamAggregator};
use crate::client::ProviderSet;
use crate::config::{validation, OrchestratorConfig};
use crate::limiter::RateLimiter;
use crate::registry::ModelRegistry;
use crate::routing::RouteSelector;
use crate::workflow::{
    DiagramStore, InMemoryDiagramStore, SessionSnapshot, WorkflowStateMachine,
};
use crate::{OrchestratorError, SessionId, StageKey};

// ── Session events ───────────────────────────────────────────────────────

/// Workflow state transition notification.
#[derive(Debug, Clone)]
pub struct StateChanged {
    /// The session's workflow state after the operation.
    pub snapshot: SessionSnapshot,
}

impl Serialize for StateChanged {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StateChanged", 2)?;
        state.serialize_field("event", "state_changed")?;
        state.serialize_field("snapshot", &self.snapshot)?;
        state.end()
    }
}

/// One event on a session stream.
///
/// Both variants serialize with an `event` tag, so the SSE layer can
/// forward the stream without inspecting it.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SessionEvent {
    /// Forwarded aggregation event, carrying its own `event` tag.
    Batch(BatchEvent),
    /// Workflow state transition, tagged `state_changed`.
    StateChanged(StateChanged),
}

// ── Facade ───────────────────────────────────────────────────────────────

/// One-stop entry point over registry, routing, providers, rate limiting,
/// aggregation, and the staged workflow.
pub struct Orchestrator {
    workflow: Arc<WorkflowStateMachine>,
    aggregator: StreamAggregator,
    registry: Arc<ModelRegistry>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("name", &self.config.orchestrator.name)
            .field("workflow", &self.workflow)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Assemble the stack from configuration, with an in-process diagram
    /// store.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ConfigError`] when validation fails or a
    /// provider cannot be built (missing base URL or API key variable).
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        Self::from_config_with_store(config, Arc::new(InMemoryDiagramStore::new()))
    }

    /// Assemble the stack from configuration over a caller-supplied
    /// diagram store.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::from_config`].
    pub fn from_config_with_store(
        config: OrchestratorConfig,
        store: Arc<dyn DiagramStore>,
    ) -> Result<Self, OrchestratorError> {
        validation::validate(&config).map_err(|errors| {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            OrchestratorError::ConfigError(joined)
        })?;
        let providers = ProviderSet::from_config(&config)?;
        Ok(Self::from_parts(config, providers, store))
    }

    /// Assemble the stack around a hand-built provider set.
    ///
    /// Skips validation; tests and demos use this to inject scripted
    /// providers.
    pub fn from_parts(
        config: OrchestratorConfig,
        providers: ProviderSet,
        store: Arc<dyn DiagramStore>,
    ) -> Self {
        let registry = Arc::new(ModelRegistry::from_config(&config));
        let selector = Arc::new(RouteSelector::new(registry.clone()));
        let limiter = RateLimiter::from_config(&config);
        let aggregator = StreamAggregator::new(
            registry.clone(),
            selector,
            providers,
            limiter,
            config.aggregator.clone(),
        );
        let workflow = Arc::new(WorkflowStateMachine::new(config.workflow.clone(), store));
        Self {
            workflow,
            aggregator,
            registry,
            config,
        }
    }

    /// Start (or re-attach to) a session and stream its events.
    ///
    /// The first event is always a `state_changed` snapshot. When the
    /// session resumes at a generatable stage, the first batch for that
    /// stage is kicked off automatically and its events follow on the same
    /// stream. The stream ends when the batch completes (or immediately
    /// after the snapshot when every stage is already confirmed).
    ///
    /// # Errors
    ///
    /// [`StateError::MissingTopic`](crate::workflow::StateError) when the
    /// diagram data carries no usable center topic.
    pub async fn start(
        &self,
        session: &SessionId,
        diagram_type: &str,
        diagram: &Value,
    ) -> Result<mpsc::Receiver<SessionEvent>, OrchestratorError> {
        let snapshot = self.workflow.start(session, diagram_type, diagram).await?;
        let current = snapshot.current.clone();

        let (tx, rx) = mpsc::channel(self.config.aggregator.channel_capacity);
        let _ = tx
            .send(SessionEvent::StateChanged(StateChanged { snapshot }))
            .await;

        if let Some(stage) = current {
            // Re-attaching mid-batch is legal; the running batch keeps its
            // original event stream and this one ends after the snapshot.
            if let Err(error) = self.launch_batch(session, &stage, None, tx) {
                tracing::debug!(
                    target: "orchestrator::session",
                    session = %session,
                    stage = %stage,
                    %error,
                    "start without auto-generation"
                );
            }
        }
        Ok(rx)
    }

    /// Run one more batch for a stage and stream its events.
    ///
    /// `count` overrides the configured per-model candidate goal.
    ///
    /// # Errors
    ///
    /// [`StateError`](crate::workflow::StateError) variants for gating
    /// violations; [`OrchestratorError::BatchInProgress`] while the stage's
    /// previous batch has not reached `batch_complete`.
    pub fn next_batch(
        &self,
        session: &SessionId,
        stage: &StageKey,
        count: Option<u32>,
    ) -> Result<mpsc::Receiver<SessionEvent>, OrchestratorError> {
        let (tx, rx) = mpsc::channel(self.config.aggregator.channel_capacity);
        self.launch_batch(session, stage, count, tx)?;
        Ok(rx)
    }

    /// Confirm a selection: lock the stage, persist it, seed the next
    /// stage.
    ///
    /// # Errors
    ///
    /// [`StateError`](crate::workflow::StateError) variants for gating
    /// violations, unknown candidate ids, or wrong selection arity.
    pub async fn select(
        &self,
        session: &SessionId,
        stage: &StageKey,
        candidate_ids: &[String],
    ) -> Result<SessionSnapshot, OrchestratorError> {
        Ok(self.workflow.select(session, stage, candidate_ids).await?)
    }

    /// Cancel a session: stop in-flight generation and discard uncommitted
    /// state. Idempotent.
    ///
    /// Already-locked selections stay persisted. In-flight batches still
    /// emit their terminal `batch_complete` with `cancelled: true`.
    pub fn cancel(&self, session: &SessionId) -> Option<SessionSnapshot> {
        self.aggregator.cancel_session(session);
        self.workflow.cancel(session)
    }

    /// Terminate a session normally and release its state.
    ///
    /// # Errors
    ///
    /// [`StateError::UnknownSession`](crate::workflow::StateError) when no
    /// such session exists.
    pub fn finish(&self, session: &SessionId) -> Result<SessionSnapshot, OrchestratorError> {
        self.aggregator.cancel_session(session);
        Ok(self.workflow.finish(session)?)
    }

    /// Current state of a session.
    ///
    /// # Errors
    ///
    /// [`StateError::UnknownSession`](crate::workflow::StateError) when no
    /// such session exists.
    pub fn snapshot(&self, session: &SessionId) -> Result<SessionSnapshot, OrchestratorError> {
        Ok(self.workflow.snapshot(session)?)
    }

    /// Spawn the periodic idle-session sweeper. Runs until aborted.
    pub fn spawn_idle_sweeper(&self) -> JoinHandle<()> {
        let workflow = self.workflow.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(workflow.sweep_interval());
            loop {
                ticker.tick().await;
                workflow.sweep_idle();
            }
        })
    }

    /// The underlying workflow state machine.
    pub fn workflow(&self) -> &WorkflowStateMachine {
        &self.workflow
    }

    /// The model registry this instance routes through.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn launch_batch(
        &self,
        session: &SessionId,
        stage: &StageKey,
        count: Option<u32>,
        tx: mpsc::Sender<SessionEvent>,
    ) -> Result<(), OrchestratorError> {
        let count = count.unwrap_or(self.config.aggregator.candidates_per_model);
        let plan = self.workflow.begin_batch(session, stage, count)?;

        let request = BatchRequest {
            session: session.clone(),
            stage: plan.stage,
            batch: plan.batch,
            prompt: plan.prompt,
            system: plan.system,
            models: self.registry.logical_models(),
            seed_keys: plan.seed_keys,
        };
        let batch_rx = match self.aggregator.fan_out(request) {
            Ok(batch_rx) => batch_rx,
            Err(error) => {
                self.workflow.finish_batch(session, stage);
                return Err(error);
            }
        };

        tokio::spawn(run_relay(
            self.workflow.clone(),
            self.aggregator.clone(),
            session.clone(),
            stage.clone(),
            batch_rx,
            tx,
        ));
        Ok(())
    }
}

// ── Relay task ───────────────────────────────────────────────────────────

/// Pump one batch's events into the session stream, recording candidates
/// into the workflow along the way.
///
/// The generation guard is cleared before the terminal event is forwarded,
/// so a consumer that has seen `batch_complete` can immediately begin the
/// next batch. The relay drains the batch to completion even when the
/// consumer hangs up, with the remaining work cancelled.
async fn run_relay(
    workflow: Arc<WorkflowStateMachine>,
    aggregator: StreamAggregator,
    session: SessionId,
    stage: StageKey,
    mut batch_rx: mpsc::Receiver<BatchEvent>,
    tx: mpsc::Sender<SessionEvent>,
) {
    let mut consumer_gone = false;
    let mut session_lost = false;

    while let Some(event) = batch_rx.recv().await {
        if let BatchEvent::Candidate { candidate } = &event {
            if !session_lost && workflow.record_candidate(&session, candidate).is_err() {
                session_lost = true;
                aggregator.cancel_session(&session);
                tracing::warn!(
                    target: "orchestrator::session",
                    session = %session,
                    stage = %stage,
                    "session disappeared mid-batch; cancelling its generation"
                );
            }
        }

        let terminal = matches!(event, BatchEvent::BatchComplete { .. });
        if terminal {
            workflow.finish_batch(&session, &stage);
        }

        if !consumer_gone && tx.send(SessionEvent::Batch(event)).await.is_err() {
            consumer_gone = true;
            aggregator.cancel_session(&session);
            tracing::debug!(
                target: "orchestrator::session",
                session = %session,
                stage = %stage,
                "consumer hung up; cancelling generation"
            );
        }

        if terminal {
            return;
        }
    }

    // Batch channel closed without a terminal event; release the stage.
    workflow.finish_batch(&session, &stage);
}

// ── Tests ──────────────────────────────────────────────────────────────
