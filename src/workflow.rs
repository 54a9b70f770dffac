//! # Staged Candidate Workflow
//!
//! ## Responsibility
//! Gate the multi-step candidate workflow per session: dimensions → parts →
//! per-part subparts → complete. Track per-stage candidate lists, lock
//! flags, and selections; build stage prompts; detect the resume stage from
//! persisted diagram content; reap idle sessions.
//!
//! ## Guarantees
//! - A locked stage's candidate list and selection are immutable
//! - Selecting locks the stage immediately and seeds the next stage
//! - Generation is only permitted on an unlocked stage whose prerequisite
//!   stage carries a confirmed selection
//! - Subpart tabs are independent: switching tabs never discards another
//!   tab's candidates, and a tab outside the parts selection is rejected
//! - Violations surface as `StateError` — caller misuse, never retried
//! - Confirmed selections are written through to the diagram store at lock
//!   time; `cancel` never retracts them
//!
//! ## NOT Responsible For
//! - Running the fan-out (that belongs to `aggregator`)
//! - Durable diagram persistence (behind the `DiagramStore` seam)
//! - Transporting events to the caller (that belongs to the facade)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::WorkflowConfig;
use crate::{Candidate, OrchestratorError, SessionId, StageKey};

// ── Errors ───────────────────────────────────────────────────────────────

/// Workflow rule violations. Caller misuse, never retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// No session with this id exists (never started, finished, or reaped).
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The stage already carries a confirmed selection.
    #[error("stage {stage} is locked")]
    StageLocked {
        /// The locked stage.
        stage: String,
    },

    /// The stage's prerequisite has no confirmed selection yet.
    #[error("stage {stage} requires a confirmed selection in {prerequisite}")]
    PrerequisiteUnlocked {
        /// The stage the caller asked for.
        stage: String,
        /// The stage that must be selected first.
        prerequisite: String,
    },

    /// A subparts tab was named that is not among the selected parts.
    #[error("part {part} is not among the selected parts")]
    UnknownPart {
        /// The part name the caller supplied.
        part: String,
    },

    /// The stage accepts exactly one selected candidate.
    #[error("stage {stage} requires exactly one selection, got {got}")]
    SingleSelectionRequired {
        /// The stage being selected.
        stage: String,
        /// Number of ids the caller supplied.
        got: usize,
    },

    /// The selection was empty.
    #[error("no candidate ids supplied for stage {stage}")]
    EmptySelection {
        /// The stage being selected.
        stage: String,
    },

    /// A selected id does not name a recorded candidate of this stage.
    #[error("candidate {id} does not exist in stage {stage}")]
    UnknownCandidate {
        /// The unresolved candidate id.
        id: String,
        /// The stage that was searched.
        stage: String,
    },

    /// Selection attempted while a batch for the stage is still running.
    #[error("stage {stage} is still generating; wait for batch_complete")]
    GenerationInProgress {
        /// The generating stage.
        stage: String,
    },

    /// The diagram data carries no usable center topic.
    #[error("diagram of type {diagram_type} has no usable topic")]
    MissingTopic {
        /// The diagram type the caller supplied.
        diagram_type: String,
    },
}

// ── Diagram store seam ───────────────────────────────────────────────────

/// Persistence collaborator: read current diagram content for resume
/// detection, write confirmed selections after a stage locks.
///
/// Implementations absorb their own IO failures (log and continue); a
/// selection is committed in memory the moment the stage locks.
#[async_trait]
pub trait DiagramStore: Send + Sync {
    /// Current persisted diagram for a session, if any.
    async fn load(&self, session: &SessionId) -> Option<Value>;

    /// Record a confirmed selection for a stage.
    async fn save_selection(&self, session: &SessionId, stage: &StageKey, selected: &[String]);
}

/// In-process diagram store for demos and tests.
#[derive(Debug, Default)]
pub struct InMemoryDiagramStore {
    diagrams: DashMap<String, Value>,
}

impl InMemoryDiagramStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session's diagram, replacing any existing content.
    pub fn seed(&self, session: &SessionId, diagram: Value) {
        self.diagrams.insert(session.as_str().to_string(), diagram);
    }
}

#[async_trait]
impl DiagramStore for InMemoryDiagramStore {
    async fn load(&self, session: &SessionId) -> Option<Value> {
        self.diagrams.get(session.as_str()).map(|d| d.clone())
    }

    async fn save_selection(&self, session: &SessionId, stage: &StageKey, selected: &[String]) {
        let mut diagram = self
            .diagrams
            .entry(session.as_str().to_string())
            .or_insert_with(|| json!({}));
        let root = diagram.value_mut();

        match stage {
            StageKey::Dimensions => {
                if let (Some(object), Some(dimension)) = (root.as_object_mut(), selected.first()) {
                    object.insert("dimension".to_string(), json!(dimension));
                }
            }
            StageKey::Parts => {
                let parts: Vec<Value> = selected
                    .iter()
                    .map(|name| json!({ "name": name, "subparts": [] }))
                    .collect();
                if let Some(object) = root.as_object_mut() {
                    object.insert("parts".to_string(), json!(parts));
                }
            }
            StageKey::Subparts { part } => {
                let subparts: Vec<Value> =
                    selected.iter().map(|name| json!({ "name": name })).collect();
                if let Some(parts) = root.get_mut("parts").and_then(Value::as_array_mut) {
                    for entry in parts {
                        if entry.get("name").and_then(Value::as_str) == Some(part.as_str()) {
                            if let Some(object) = entry.as_object_mut() {
                                object.insert("subparts".to_string(), json!(subparts));
                            }
                        }
                    }
                }
            }
        }
    }
}

// ── Session views ────────────────────────────────────────────────────────

/// Read-only view of one stage, for snapshots and `state_changed` events.
#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    /// Stage identity.
    pub stage: StageKey,
    /// Number of candidates recorded so far.
    pub candidates: usize,
    /// Batches started for this stage.
    pub batches: u32,
    /// Whether a batch is currently running.
    pub generating: bool,
    /// Whether the stage carries a confirmed selection.
    pub locked: bool,
    /// Selected candidate texts (empty while unlocked).
    pub selected: Vec<String>,
}

/// Full workflow state of one session at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session id.
    pub session: String,
    /// Diagram type the session was started for.
    pub diagram_type: String,
    /// Center topic extracted from the diagram data.
    pub topic: String,
    /// The stage generation currently targets; `None` once every stage is
    /// confirmed.
    pub current: Option<StageKey>,
    /// Whether `start` skipped at least one already-confirmed stage.
    pub resumed: bool,
    /// Whether the session has reached its terminal state.
    pub finished: bool,
    /// Per-stage views in workflow order (subpart tabs in selection order).
    pub stages: Vec<StageView>,
}

/// Everything the aggregation layer needs to run one batch.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// Stage the batch generates for.
    pub stage: StageKey,
    /// 1-based batch number within the stage.
    pub batch: u32,
    /// Dedup keys of every candidate earlier batches of this stage produced.
    pub seed_keys: Vec<String>,
    /// Finished stage prompt.
    pub prompt: String,
    /// System prompt.
    pub system: Option<String>,
}

// ── Internal state ───────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct StageState {
    candidates: Vec<Candidate>,
    seen_keys: HashSet<String>,
    batches: u32,
    generating: bool,
    locked: bool,
    selected_ids: Vec<String>,
    selected_texts: Vec<String>,
}

impl StageState {
    /// Locked stage carrying a selection recovered from persisted content.
    fn confirmed(texts: Vec<String>) -> Self {
        Self {
            locked: true,
            selected_texts: texts,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct SessionState {
    diagram_type: String,
    topic: String,
    stages: HashMap<StageKey, StageState>,
    /// Selected part names, in selection order. Fixed when parts locks.
    tabs: Vec<String>,
    current: Option<StageKey>,
    resumed: bool,
    last_touched: Instant,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    fn view(&self, stage: &StageKey) -> Option<StageView> {
        self.stages.get(stage).map(|s| StageView {
            stage: stage.clone(),
            candidates: s.candidates.len(),
            batches: s.batches,
            generating: s.generating,
            locked: s.locked,
            selected: s.selected_texts.clone(),
        })
    }

    fn snapshot(&self, session: &str, finished: bool) -> SessionSnapshot {
        let mut stages = Vec::new();
        for stage in [StageKey::Dimensions, StageKey::Parts] {
            if let Some(view) = self.view(&stage) {
                stages.push(view);
            }
        }
        for tab in &self.tabs {
            if let Some(view) = self.view(&StageKey::subparts(tab.as_str())) {
                stages.push(view);
            }
        }
        SessionSnapshot {
            session: session.to_string(),
            diagram_type: self.diagram_type.clone(),
            topic: self.topic.clone(),
            current: self.current.clone(),
            resumed: self.resumed,
            finished,
            stages,
        }
    }

    fn is_locked(&self, stage: &StageKey) -> bool {
        self.stages.get(stage).map(|s| s.locked).unwrap_or(false)
    }

    /// First stage in workflow order without a confirmed selection.
    fn next_unconfirmed(&self) -> Option<StageKey> {
        if !self.is_locked(&StageKey::Dimensions) {
            return Some(StageKey::Dimensions);
        }
        if !self.is_locked(&StageKey::Parts) {
            return Some(StageKey::Parts);
        }
        self.tabs
            .iter()
            .find(|tab| !self.is_locked(&StageKey::subparts(tab.as_str())))
            .map(|tab| StageKey::subparts(tab.as_str()))
    }

    /// Stage ordering rules: a stage is reachable only once its
    /// prerequisite carries a confirmed selection; subpart tabs must name a
    /// selected part.
    fn gate(&self, stage: &StageKey) -> Result<(), StateError> {
        match stage {
            StageKey::Dimensions => Ok(()),
            StageKey::Parts => {
                if self.is_locked(&StageKey::Dimensions) {
                    Ok(())
                } else {
                    Err(StateError::PrerequisiteUnlocked {
                        stage: stage.to_string(),
                        prerequisite: StageKey::Dimensions.to_string(),
                    })
                }
            }
            StageKey::Subparts { part } => {
                if !self.is_locked(&StageKey::Parts) {
                    return Err(StateError::PrerequisiteUnlocked {
                        stage: stage.to_string(),
                        prerequisite: StageKey::Parts.to_string(),
                    });
                }
                if self.tabs.iter().any(|tab| tab == part) {
                    Ok(())
                } else {
                    Err(StateError::UnknownPart { part: part.clone() })
                }
            }
        }
    }
}

// ── Resume detection ─────────────────────────────────────────────────────

struct ResumedContent {
    topic: String,
    dimension: Option<String>,
    /// (part name, subparts already confirmed)
    parts: Vec<(String, bool)>,
}

/// Extract topic and already-confirmed selections from diagram content.
///
/// A non-empty `dimension` string confirms the dimensions stage; a
/// non-empty `parts` array confirms the parts stage (and, implicitly, the
/// dimensions stage); a part with non-empty `subparts` confirms that tab.
fn parse_diagram(diagram_type: &str, diagram: &Value) -> Result<ResumedContent, StateError> {
    let topic = ["whole", "topic", "title"]
        .iter()
        .find_map(|key| diagram.get(key).and_then(Value::as_str))
        .or_else(|| {
            diagram
                .get("center")
                .and_then(|c| c.get("text"))
                .and_then(Value::as_str)
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StateError::MissingTopic {
            diagram_type: diagram_type.to_string(),
        })?;

    let dimension = diagram
        .get("dimension")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);

    let mut parts = Vec::new();
    if let Some(entries) = diagram.get("parts").and_then(Value::as_array) {
        for entry in entries {
            let Some(name) = entry
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty())
            else {
                continue;
            };
            let confirmed = entry
                .get("subparts")
                .and_then(Value::as_array)
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            parts.push((name.to_string(), confirmed));
        }
    }

    Ok(ResumedContent {
        topic: topic.to_string(),
        dimension,
        parts,
    })
}

// ── State machine ────────────────────────────────────────────────────────

/// Per-session staged workflow: stage gating, locks, selections, resume.
///
/// Session state is process-local with a single logical writer per
/// (session, stage); concurrent generation for the same key is rejected
/// before any state changes.
pub struct WorkflowStateMachine {
    sessions: DashMap<String, SessionState>,
    store: Arc<dyn DiagramStore>,
    config: WorkflowConfig,
}

impl std::fmt::Debug for WorkflowStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStateMachine")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkflowStateMachine {
    /// Build a state machine over a diagram store.
    pub fn new(config: WorkflowConfig, store: Arc<dyn DiagramStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            config,
        }
    }

    /// Start (or re-attach to) a session, resuming at the first stage
    /// without a confirmed selection.
    ///
    /// When the supplied diagram data is `null`, the persisted diagram from
    /// the store is consulted instead.
    ///
    /// # Errors
    ///
    /// [`StateError::MissingTopic`] when neither source yields a usable
    /// center topic.
    pub async fn start(
        &self,
        session: &SessionId,
        diagram_type: &str,
        diagram: &Value,
    ) -> Result<SessionSnapshot, StateError> {
        if let Some(mut existing) = self.sessions.get_mut(session.as_str()) {
            existing.touch();
            return Ok(existing.snapshot(session.as_str(), false));
        }

        let stored;
        let effective = if diagram.is_null() {
            stored = self.store.load(session).await.unwrap_or(Value::Null);
            &stored
        } else {
            diagram
        };
        let content = parse_diagram(diagram_type, effective)?;

        let mut stages = HashMap::new();
        let mut tabs = Vec::new();
        let dimensions_confirmed = content.dimension.is_some() || !content.parts.is_empty();

        if dimensions_confirmed {
            let texts = content.dimension.clone().into_iter().collect();
            stages.insert(StageKey::Dimensions, StageState::confirmed(texts));
        } else {
            stages.insert(StageKey::Dimensions, StageState::default());
        }

        if !content.parts.is_empty() {
            let names: Vec<String> = content.parts.iter().map(|(n, _)| n.clone()).collect();
            stages.insert(StageKey::Parts, StageState::confirmed(names.clone()));
            for (name, confirmed) in &content.parts {
                let state = if *confirmed {
                    StageState::confirmed(Vec::new())
                } else {
                    StageState::default()
                };
                stages.insert(StageKey::subparts(name.as_str()), state);
            }
            tabs = names;
        } else if dimensions_confirmed {
            stages.insert(StageKey::Parts, StageState::default());
        }

        let resumed = dimensions_confirmed;
        let mut state = SessionState {
            diagram_type: diagram_type.to_string(),
            topic: content.topic,
            stages,
            tabs,
            current: None,
            resumed,
            last_touched: Instant::now(),
        };
        state.current = state.next_unconfirmed();

        tracing::info!(
            target: "orchestrator::workflow",
            session = %session,
            diagram_type,
            resumed,
            current = state.current.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "complete".into()),
            "session started"
        );

        let snapshot = state.snapshot(session.as_str(), false);
        self.sessions.insert(session.as_str().to_string(), state);
        Ok(snapshot)
    }

    /// Admit one batch for a stage: gate, count it, and produce the plan
    /// (prompt, batch number, accumulated dedup seeds).
    ///
    /// Makes the stage the session's current stage, which is how subpart
    /// tab switching works.
    ///
    /// # Errors
    ///
    /// [`StateError`] variants for gating violations;
    /// [`OrchestratorError::BatchInProgress`] while an earlier batch for
    /// the same stage has not reached `batch_complete`.
    pub fn begin_batch(
        &self,
        session: &SessionId,
        stage: &StageKey,
        count: u32,
    ) -> Result<BatchPlan, OrchestratorError> {
        let mut entry = self
            .sessions
            .get_mut(session.as_str())
            .ok_or_else(|| StateError::UnknownSession(session.as_str().to_string()))?;
        entry.gate(stage)?;

        let dimension = entry
            .stages
            .get(&StageKey::Dimensions)
            .and_then(|s| s.selected_texts.first())
            .cloned();
        let topic = entry.topic.clone();

        let state = entry.stages.entry(stage.clone()).or_default();
        if state.locked {
            return Err(StateError::StageLocked {
                stage: stage.to_string(),
            }
            .into());
        }
        if state.generating {
            return Err(OrchestratorError::BatchInProgress {
                session: session.as_str().to_string(),
                stage: stage.to_string(),
            });
        }

        state.generating = true;
        state.batches += 1;
        let batch = state.batches;
        let seed_keys: Vec<String> = state.seen_keys.iter().cloned().collect();

        entry.current = Some(stage.clone());
        entry.touch();

        tracing::info!(
            target: "orchestrator::workflow",
            session = %session,
            stage = %stage,
            batch,
            seeds = seed_keys.len(),
            "batch admitted"
        );

        Ok(BatchPlan {
            stage: stage.clone(),
            batch,
            seed_keys,
            prompt: build_prompt(stage, &topic, dimension.as_deref(), count, batch),
            system: Some(system_message(&topic).to_string()),
        })
    }

    /// Record one accepted candidate into its stage.
    ///
    /// # Errors
    ///
    /// [`StateError::UnknownSession`] when the session disappeared (for
    /// example, reaped mid-batch).
    pub fn record_candidate(
        &self,
        session: &SessionId,
        candidate: &Candidate,
    ) -> Result<(), StateError> {
        let mut entry = self
            .sessions
            .get_mut(session.as_str())
            .ok_or_else(|| StateError::UnknownSession(session.as_str().to_string()))?;
        let state = entry.stages.entry(candidate.stage.clone()).or_default();
        state.seen_keys.insert(candidate.dedup_key.clone());
        state.candidates.push(candidate.clone());
        entry.touch();
        Ok(())
    }

    /// Mark a stage's running batch as fully recorded.
    ///
    /// Idempotent; unknown sessions are ignored (the batch outlived them).
    pub fn finish_batch(&self, session: &SessionId, stage: &StageKey) {
        if let Some(mut entry) = self.sessions.get_mut(session.as_str()) {
            if let Some(state) = entry.stages.get_mut(stage) {
                state.generating = false;
            }
            entry.touch();
        }
    }

    /// Confirm a selection: lock the stage and seed the next one.
    ///
    /// Dimensions accept exactly one id; parts and subparts accept a
    /// non-empty set. The confirmed texts are written through to the
    /// diagram store after the lock commits.
    ///
    /// # Errors
    ///
    /// [`StateError`] for gating violations, unknown ids, wrong selection
    /// arity, or a still-running batch.
    pub async fn select(
        &self,
        session: &SessionId,
        stage: &StageKey,
        candidate_ids: &[String],
    ) -> Result<SessionSnapshot, StateError> {
        let (snapshot, texts) = {
            let mut entry = self
                .sessions
                .get_mut(session.as_str())
                .ok_or_else(|| StateError::UnknownSession(session.as_str().to_string()))?;
            entry.gate(stage)?;

            let state = entry.stages.entry(stage.clone()).or_default();
            if state.locked {
                return Err(StateError::StageLocked {
                    stage: stage.to_string(),
                });
            }
            if state.generating {
                return Err(StateError::GenerationInProgress {
                    stage: stage.to_string(),
                });
            }
            if candidate_ids.is_empty() {
                return Err(StateError::EmptySelection {
                    stage: stage.to_string(),
                });
            }

            let mut ids = Vec::new();
            let mut seen = HashSet::new();
            for id in candidate_ids {
                if seen.insert(id.as_str()) {
                    ids.push(id.clone());
                }
            }
            if matches!(stage, StageKey::Dimensions) && ids.len() != 1 {
                return Err(StateError::SingleSelectionRequired {
                    stage: stage.to_string(),
                    got: ids.len(),
                });
            }

            let mut texts = Vec::new();
            for id in &ids {
                let candidate = state
                    .candidates
                    .iter()
                    .find(|c| &c.id == id)
                    .ok_or_else(|| StateError::UnknownCandidate {
                        id: id.clone(),
                        stage: stage.to_string(),
                    })?;
                texts.push(candidate.text.clone());
            }

            state.locked = true;
            state.selected_ids = ids;
            state.selected_texts = texts.clone();

            match stage {
                StageKey::Dimensions => {
                    entry.stages.entry(StageKey::Parts).or_default();
                }
                StageKey::Parts => {
                    entry.tabs = texts.clone();
                    for tab in &texts {
                        entry
                            .stages
                            .entry(StageKey::subparts(tab.as_str()))
                            .or_default();
                    }
                }
                StageKey::Subparts { .. } => {}
            }

            entry.current = entry.next_unconfirmed();
            entry.touch();

            tracing::info!(
                target: "orchestrator::workflow",
                session = %session,
                stage = %stage,
                selected = texts.len(),
                next = entry.current.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "complete".into()),
                "stage locked"
            );

            (entry.snapshot(session.as_str(), false), texts)
        };

        self.store.save_selection(session, stage, &texts).await;
        Ok(snapshot)
    }

    /// Current state of a session.
    ///
    /// # Errors
    ///
    /// [`StateError::UnknownSession`] when no such session exists.
    pub fn snapshot(&self, session: &SessionId) -> Result<SessionSnapshot, StateError> {
        let entry = self
            .sessions
            .get(session.as_str())
            .ok_or_else(|| StateError::UnknownSession(session.as_str().to_string()))?;
        Ok(entry.snapshot(session.as_str(), false))
    }

    /// Terminate a session normally and release its state.
    ///
    /// # Errors
    ///
    /// [`StateError::UnknownSession`] when no such session exists.
    pub fn finish(&self, session: &SessionId) -> Result<SessionSnapshot, StateError> {
        let (key, state) = self
            .sessions
            .remove(session.as_str())
            .ok_or_else(|| StateError::UnknownSession(session.as_str().to_string()))?;
        tracing::info!(
            target: "orchestrator::workflow",
            session = %key,
            "session finished"
        );
        Ok(state.snapshot(&key, true))
    }

    /// Discard a session's uncommitted state. Idempotent.
    ///
    /// Locked selections were written through at lock time and are never
    /// retracted here. Returns the final snapshot when a session existed.
    pub fn cancel(&self, session: &SessionId) -> Option<SessionSnapshot> {
        let (key, state) = self.sessions.remove(session.as_str())?;
        tracing::info!(
            target: "orchestrator::workflow",
            session = %key,
            "session cancelled"
        );
        Some(state.snapshot(&key, true))
    }

    /// Remove sessions idle longer than the configured timeout.
    ///
    /// Returns the number of sessions reaped.
    pub fn sweep_idle(&self) -> usize {
        let timeout = Duration::from_secs(self.config.session_idle_timeout_s);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, state| state.last_touched.elapsed() <= timeout);
        let reaped = before - self.sessions.len();
        if reaped > 0 {
            tracing::info!(
                target: "orchestrator::workflow",
                reaped,
                remaining = self.sessions.len(),
                "idle sessions reaped"
            );
        }
        reaped
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Configured interval between idle sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_s)
    }
}

// ── Stage prompts ────────────────────────────────────────────────────────

fn has_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

fn system_message(topic: &str) -> &'static str {
    if has_cjk(topic) {
        "你是一个有帮助的K12教育助手。"
    } else {
        "You are a helpful K12 education assistant."
    }
}

/// Stage-specific generation prompt in the topic's language.
///
/// Models are asked for plain newline-separated items; later batches carry
/// a diversity note so repeated fan-outs explore new ground.
fn build_prompt(
    stage: &StageKey,
    topic: &str,
    dimension: Option<&str>,
    count: u32,
    batch: u32,
) -> String {
    let zh = has_cjk(topic);
    let mut prompt = match stage {
        StageKey::Dimensions => {
            if zh {
                format!(
                    "为主题“{topic}”生成{count}个可能的拆解维度。\n\n\
                     括号图可以使用不同的维度来拆解整体，例如物理部件、功能模块、\
                     时间阶段、空间区域、类型分类。\n\n\
                     要求：\n\
                     1. 每个维度要简洁明了，2-6个字\n\
                     2. 维度要互不重叠、各具特色\n\
                     3. 只输出维度名称，每行一个，不要编号\n\n\
                     生成{count}个拆解维度："
                )
            } else {
                format!(
                    "Generate {count} possible decomposition dimensions for: {topic}\n\n\
                     A brace map can decompose a whole using different dimensions, \
                     such as physical components, functional modules, time stages, \
                     spatial regions, or type classification.\n\n\
                     Requirements:\n\
                     1. Each dimension should be concise, 2-6 words\n\
                     2. Dimensions should be distinct and non-overlapping\n\
                     3. Output only dimension names, one per line, no numbering\n\n\
                     Generate {count} dimensions:"
                )
            }
        }
        StageKey::Parts => match (zh, dimension) {
            (true, Some(dimension)) => format!(
                "为以下整体生成{count}个组成部分：{topic}\n\n\
                 必须按照“{dimension}”这个维度进行拆解。\n\
                 部分要清晰、互不重叠、完全穷尽，使用名词或名词短语。\n\
                 只输出部分文本，每行一个，不要编号。\n\n\
                 按照“{dimension}”维度生成{count}个组成部分："
            ),
            (true, None) => format!(
                "为以下整体生成{count}个组成部分：{topic}\n\n\
                 从同一个拆解维度进行拆解，部分要清晰、互不重叠、完全穷尽，\
                 使用名词或名词短语。\n\
                 只输出部分文本，每行一个，不要编号。\n\n\
                 生成{count}个组成部分："
            ),
            (false, Some(dimension)) => format!(
                "Generate {count} parts/components for: {topic}\n\n\
                 Decompose strictly along the \"{dimension}\" dimension.\n\
                 Parts should be clear, mutually exclusive, and collectively \
                 exhaustive. Use nouns or short noun phrases.\n\
                 Output only the part text, one per line, no numbering.\n\n\
                 Generate {count} parts using \"{dimension}\":"
            ),
            (false, None) => format!(
                "Generate {count} parts/components for: {topic}\n\n\
                 Decompose along one consistent dimension. Parts should be \
                 clear, mutually exclusive, and collectively exhaustive. Use \
                 nouns or short noun phrases.\n\
                 Output only the part text, one per line, no numbering.\n\n\
                 Generate {count} parts:"
            ),
        },
        StageKey::Subparts { part } => {
            if zh {
                format!(
                    "为整体“{topic}”的部分“{part}”生成{count}个子部件。\n\n\
                     要求：\n\
                     1. 所有子部件必须属于“{part}”这个部分\n\
                     2. 使用名词或名词短语，2-8个字\n\
                     3. 只输出子部件名称，每行一个，不要编号\n\n\
                     为“{part}”生成{count}个子部件："
                )
            } else {
                format!(
                    "Generate {count} sub-components for part \"{part}\" of: {topic}\n\n\
                     Requirements:\n\
                     1. Every sub-component must belong to the part \"{part}\"\n\
                     2. Use nouns or noun phrases, 2-8 words\n\
                     3. Output only sub-component names, one per line, no numbering\n\n\
                     Generate {count} sub-components for \"{part}\":"
                )
            }
        }
    };

    if batch > 1 {
        if zh {
            prompt.push_str(&format!(
                "\n\n注意：这是第{batch}批。确保最大程度的多样性，避免与之前批次重复。"
            ));
        } else {
            prompt.push_str(&format!(
                "\n\nNote: This is batch {batch}. Ensure maximum diversity, avoid \
                 repetition from previous batches."
            ));
        }
    }

    prompt
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> WorkflowStateMachine {
        WorkflowStateMachine::new(
            WorkflowConfig::default(),
            Arc::new(InMemoryDiagramStore::new()),
        )
    }

    fn machine_with_store() -> (WorkflowStateMachine, Arc<InMemoryDiagramStore>) {
        let store = Arc::new(InMemoryDiagramStore::new());
        let machine = WorkflowStateMachine::new(WorkflowConfig::default(), store.clone());
        (machine, store)
    }

    fn session() -> SessionId {
        SessionId::new("s1")
    }

    fn fresh_diagram() -> Value {
        json!({ "whole": "car" })
    }

    fn candidate(id: &str, text: &str, stage: StageKey) -> Candidate {
        Candidate {
            id: id.to_string(),
            text: text.to_string(),
            model: "qwen".to_string(),
            stage,
            batch: 1,
            dedup_key: text.to_lowercase(),
        }
    }

    /// Run a full generate-and-record cycle so a stage has candidates.
    fn seed_candidates(
        machine: &WorkflowStateMachine,
        session: &SessionId,
        stage: &StageKey,
        texts: &[&str],
    ) -> Vec<String> {
        let plan = machine
            .begin_batch(session, stage, 5)
            .expect("test: batch admitted");
        let mut ids = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let id = format!("s1_qwen_{}_{i}", plan.batch);
            machine
                .record_candidate(session, &candidate(&id, text, stage.clone()))
                .expect("test: candidate recorded");
            ids.push(id);
        }
        machine.finish_batch(session, stage);
        ids
    }

    // -- start and resume ------------------------------------------------

    #[tokio::test]
    async fn test_fresh_start_begins_at_dimensions() {
        let machine = machine();
        let snapshot = machine
            .start(&session(), "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        assert_eq!(snapshot.current, Some(StageKey::Dimensions));
        assert_eq!(snapshot.topic, "car");
        assert!(!snapshot.resumed);
        assert_eq!(snapshot.stages.len(), 1, "only dimensions exists yet");
    }

    #[tokio::test]
    async fn test_start_without_topic_is_rejected() {
        let machine = machine();
        let result = machine.start(&session(), "brace_map", &json!({})).await;
        assert!(matches!(result, Err(StateError::MissingTopic { .. })));
    }

    #[tokio::test]
    async fn test_resume_with_dimension_skips_to_parts() {
        let machine = machine();
        let diagram = json!({ "whole": "car", "dimension": "physical components" });
        let snapshot = machine
            .start(&session(), "brace_map", &diagram)
            .await
            .expect("test: start");
        assert_eq!(snapshot.current, Some(StageKey::Parts));
        assert!(snapshot.resumed);
        let dimensions = &snapshot.stages[0];
        assert!(dimensions.locked);
        assert_eq!(dimensions.selected, vec!["physical components"]);
    }

    #[tokio::test]
    async fn test_resume_with_parts_skips_to_first_open_tab() {
        let machine = machine();
        let diagram = json!({
            "whole": "car",
            "dimension": "physical components",
            "parts": [
                { "name": "engine", "subparts": [{ "name": "piston" }] },
                { "name": "wheels", "subparts": [] },
            ],
        });
        let snapshot = machine
            .start(&session(), "brace_map", &diagram)
            .await
            .expect("test: start");
        assert_eq!(snapshot.current, Some(StageKey::subparts("wheels")));
        assert!(snapshot.resumed);

        // Engine's subparts are already confirmed.
        let engine = snapshot
            .stages
            .iter()
            .find(|v| v.stage == StageKey::subparts("engine"))
            .expect("test: engine tab present");
        assert!(engine.locked);
    }

    #[tokio::test]
    async fn test_resume_with_parts_but_no_dimension_confirms_dimensions() {
        let machine = machine();
        let diagram = json!({
            "whole": "car",
            "parts": [{ "name": "engine", "subparts": [] }],
        });
        let snapshot = machine
            .start(&session(), "brace_map", &diagram)
            .await
            .expect("test: start");
        assert_eq!(snapshot.current, Some(StageKey::subparts("engine")));
        assert!(snapshot.stages[0].locked, "dimensions implicitly confirmed");
        assert!(snapshot.stages[0].selected.is_empty());
    }

    #[tokio::test]
    async fn test_resume_fully_confirmed_has_no_current_stage() {
        let machine = machine();
        let diagram = json!({
            "whole": "car",
            "dimension": "physical components",
            "parts": [{ "name": "engine", "subparts": [{ "name": "piston" }] }],
        });
        let snapshot = machine
            .start(&session(), "brace_map", &diagram)
            .await
            .expect("test: start");
        assert_eq!(snapshot.current, None);
    }

    #[tokio::test]
    async fn test_start_consults_store_when_diagram_is_null() {
        let (machine, store) = machine_with_store();
        store.seed(&session(), json!({ "whole": "car", "dimension": "functions" }));
        let snapshot = machine
            .start(&session(), "brace_map", &Value::Null)
            .await
            .expect("test: start from store");
        assert_eq!(snapshot.current, Some(StageKey::Parts));
    }

    #[tokio::test]
    async fn test_start_twice_reattaches_without_reset() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: first start");
        seed_candidates(&machine, &sid, &StageKey::Dimensions, &["by function"]);

        let again = machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: second start");
        assert_eq!(again.stages[0].candidates, 1, "state survives re-attach");
    }

    // -- batch admission -------------------------------------------------

    #[tokio::test]
    async fn test_begin_batch_numbers_batches_and_accumulates_seeds() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");

        let first = machine
            .begin_batch(&sid, &StageKey::Dimensions, 5)
            .expect("test: first batch");
        assert_eq!(first.batch, 1);
        assert!(first.seed_keys.is_empty());
        assert!(first.prompt.contains("car"));
        assert!(first.prompt.contains('5'));

        machine
            .record_candidate(
                &sid,
                &candidate("s1_qwen_1_0", "By Function", StageKey::Dimensions),
            )
            .expect("test: record");
        machine.finish_batch(&sid, &StageKey::Dimensions);

        let second = machine
            .begin_batch(&sid, &StageKey::Dimensions, 5)
            .expect("test: second batch");
        assert_eq!(second.batch, 2);
        assert_eq!(second.seed_keys, vec!["by function"]);
        assert!(second.prompt.contains("batch 2"), "diversity note present");
    }

    #[tokio::test]
    async fn test_begin_batch_rejected_while_generating() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        machine
            .begin_batch(&sid, &StageKey::Dimensions, 5)
            .expect("test: first batch");

        let second = machine.begin_batch(&sid, &StageKey::Dimensions, 5);
        assert!(matches!(
            second,
            Err(OrchestratorError::BatchInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn test_parts_require_confirmed_dimension() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");

        let result = machine.begin_batch(&sid, &StageKey::Parts, 5);
        assert!(matches!(
            result,
            Err(OrchestratorError::State(
                StateError::PrerequisiteUnlocked { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let machine = machine();
        let result = machine.begin_batch(&SessionId::new("ghost"), &StageKey::Dimensions, 5);
        assert!(matches!(
            result,
            Err(OrchestratorError::State(StateError::UnknownSession(_)))
        ));
    }

    // -- selection and locking -------------------------------------------

    #[tokio::test]
    async fn test_select_dimension_locks_and_seeds_parts() {
        let (machine, store) = machine_with_store();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        let ids = seed_candidates(&machine, &sid, &StageKey::Dimensions, &["by function"]);

        let snapshot = machine
            .select(&sid, &StageKey::Dimensions, &ids)
            .await
            .expect("test: select");
        assert!(snapshot.stages[0].locked);
        assert_eq!(snapshot.current, Some(StageKey::Parts));

        let diagram = store.load(&sid).await.expect("test: diagram persisted");
        assert_eq!(diagram["dimension"], "by function");
    }

    #[tokio::test]
    async fn test_dimensions_accept_exactly_one_selection() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        let ids = seed_candidates(
            &machine,
            &sid,
            &StageKey::Dimensions,
            &["by function", "by material"],
        );

        let result = machine.select(&sid, &StageKey::Dimensions, &ids).await;
        assert!(matches!(
            result,
            Err(StateError::SingleSelectionRequired { got: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_select_on_locked_stage_is_rejected() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        let ids = seed_candidates(&machine, &sid, &StageKey::Dimensions, &["by function"]);
        machine
            .select(&sid, &StageKey::Dimensions, &ids)
            .await
            .expect("test: first select");

        let again = machine.select(&sid, &StageKey::Dimensions, &ids).await;
        assert!(matches!(again, Err(StateError::StageLocked { .. })));

        let generate = machine.begin_batch(&sid, &StageKey::Dimensions, 5);
        assert!(matches!(
            generate,
            Err(OrchestratorError::State(StateError::StageLocked { .. }))
        ));
    }

    #[tokio::test]
    async fn test_select_with_unknown_id_is_rejected() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        seed_candidates(&machine, &sid, &StageKey::Dimensions, &["by function"]);

        let result = machine
            .select(&sid, &StageKey::Dimensions, &["nope".to_string()])
            .await;
        assert!(matches!(result, Err(StateError::UnknownCandidate { .. })));
    }

    #[tokio::test]
    async fn test_select_while_generating_is_rejected() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        machine
            .begin_batch(&sid, &StageKey::Dimensions, 5)
            .expect("test: batch admitted");
        machine
            .record_candidate(
                &sid,
                &candidate("s1_qwen_1_0", "by function", StageKey::Dimensions),
            )
            .expect("test: record");

        let result = machine
            .select(&sid, &StageKey::Dimensions, &["s1_qwen_1_0".to_string()])
            .await;
        assert!(matches!(
            result,
            Err(StateError::GenerationInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_parts_creates_tabs_in_selection_order() {
        let (machine, store) = machine_with_store();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        let dim_ids = seed_candidates(&machine, &sid, &StageKey::Dimensions, &["by function"]);
        machine
            .select(&sid, &StageKey::Dimensions, &dim_ids)
            .await
            .expect("test: select dimension");

        let part_ids = seed_candidates(&machine, &sid, &StageKey::Parts, &["engine", "wheels"]);
        let snapshot = machine
            .select(&sid, &StageKey::Parts, &part_ids)
            .await
            .expect("test: select parts");

        assert_eq!(snapshot.current, Some(StageKey::subparts("engine")));
        let tabs: Vec<_> = snapshot
            .stages
            .iter()
            .filter(|v| matches!(v.stage, StageKey::Subparts { .. }))
            .collect();
        assert_eq!(tabs.len(), 2);

        let diagram = store.load(&sid).await.expect("test: diagram persisted");
        assert_eq!(diagram["parts"][0]["name"], "engine");
        assert_eq!(diagram["parts"][1]["name"], "wheels");
    }

    #[tokio::test]
    async fn test_subparts_tab_outside_selection_is_rejected() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        let dim_ids = seed_candidates(&machine, &sid, &StageKey::Dimensions, &["by function"]);
        machine
            .select(&sid, &StageKey::Dimensions, &dim_ids)
            .await
            .expect("test: select dimension");
        let part_ids = seed_candidates(&machine, &sid, &StageKey::Parts, &["engine"]);
        machine
            .select(&sid, &StageKey::Parts, &part_ids)
            .await
            .expect("test: select parts");

        let result = machine.begin_batch(&sid, &StageKey::subparts("doors"), 5);
        assert!(matches!(
            result,
            Err(OrchestratorError::State(StateError::UnknownPart { .. }))
        ));
    }

    #[tokio::test]
    async fn test_tab_switching_preserves_other_tab_candidates() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        let dim_ids = seed_candidates(&machine, &sid, &StageKey::Dimensions, &["by function"]);
        machine
            .select(&sid, &StageKey::Dimensions, &dim_ids)
            .await
            .expect("test: select dimension");
        let part_ids = seed_candidates(&machine, &sid, &StageKey::Parts, &["engine", "wheels"]);
        machine
            .select(&sid, &StageKey::Parts, &part_ids)
            .await
            .expect("test: select parts");

        seed_candidates(&machine, &sid, &StageKey::subparts("engine"), &["piston"]);
        seed_candidates(&machine, &sid, &StageKey::subparts("wheels"), &["tire"]);

        let snapshot = machine.snapshot(&sid).expect("test: snapshot");
        assert_eq!(snapshot.current, Some(StageKey::subparts("wheels")));
        let engine = snapshot
            .stages
            .iter()
            .find(|v| v.stage == StageKey::subparts("engine"))
            .expect("test: engine tab");
        assert_eq!(engine.candidates, 1, "engine tab kept its candidates");

        let subpart_ids = vec!["s1_qwen_1_0".to_string()];
        let locked = machine
            .select(&sid, &StageKey::subparts("engine"), &subpart_ids)
            .await
            .expect("test: select engine subparts");
        assert_eq!(locked.current, Some(StageKey::subparts("wheels")));
    }

    // -- terminal operations ---------------------------------------------

    #[tokio::test]
    async fn test_finish_removes_session() {
        let machine = machine();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        let snapshot = machine.finish(&sid).expect("test: finish");
        assert!(snapshot.finished);
        assert_eq!(machine.session_count(), 0);
        assert!(machine.snapshot(&sid).is_err());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_keeps_persisted_selections() {
        let (machine, store) = machine_with_store();
        let sid = session();
        machine
            .start(&sid, "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        let ids = seed_candidates(&machine, &sid, &StageKey::Dimensions, &["by function"]);
        machine
            .select(&sid, &StageKey::Dimensions, &ids)
            .await
            .expect("test: select");

        assert!(machine.cancel(&sid).is_some());
        assert!(machine.cancel(&sid).is_none(), "second cancel is a no-op");

        let diagram = store.load(&sid).await.expect("test: diagram persisted");
        assert_eq!(
            diagram["dimension"], "by function",
            "cancel never retracts a locked selection"
        );
    }

    #[tokio::test]
    async fn test_idle_sessions_are_reaped() {
        let config = WorkflowConfig {
            session_idle_timeout_s: 0,
            sweep_interval_s: 1,
        };
        let machine =
            WorkflowStateMachine::new(config, Arc::new(InMemoryDiagramStore::new()));
        machine
            .start(&session(), "brace_map", &fresh_diagram())
            .await
            .expect("test: start");

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(machine.sweep_idle(), 1);
        assert_eq!(machine.session_count(), 0);
    }

    #[tokio::test]
    async fn test_active_sessions_survive_sweep() {
        let machine = machine();
        machine
            .start(&session(), "brace_map", &fresh_diagram())
            .await
            .expect("test: start");
        assert_eq!(machine.sweep_idle(), 0);
        assert_eq!(machine.session_count(), 1);
    }

    // -- store writes ----------------------------------------------------

    #[tokio::test]
    async fn test_store_fills_subparts_of_matching_part() {
        let store = InMemoryDiagramStore::new();
        let sid = session();
        store.seed(
            &sid,
            json!({ "whole": "car", "parts": [{ "name": "engine", "subparts": [] }] }),
        );

        store
            .save_selection(
                &sid,
                &StageKey::subparts("engine"),
                &["piston".to_string(), "crankshaft".to_string()],
            )
            .await;

        let diagram = store.load(&sid).await.expect("test: load");
        assert_eq!(diagram["parts"][0]["subparts"][0]["name"], "piston");
        assert_eq!(diagram["parts"][0]["subparts"][1]["name"], "crankshaft");
    }

    // -- prompts ---------------------------------------------------------

    #[test]
    fn test_prompts_follow_topic_language() {
        let en = build_prompt(&StageKey::Dimensions, "car", None, 5, 1);
        assert!(en.contains("one per line"));
        assert!(!has_cjk(&en));

        let zh = build_prompt(&StageKey::Dimensions, "汽车", None, 5, 1);
        assert!(zh.contains("每行一个"));
    }

    #[test]
    fn test_parts_prompt_carries_selected_dimension() {
        let prompt = build_prompt(&StageKey::Parts, "car", Some("by function"), 8, 1);
        assert!(prompt.contains("by function"));
        assert!(prompt.contains('8'));
    }

    #[test]
    fn test_subparts_prompt_names_the_part() {
        let prompt = build_prompt(&StageKey::subparts("engine"), "car", None, 5, 1);
        assert!(prompt.contains("engine"));
    }

    #[test]
    fn test_later_batches_carry_diversity_note() {
        let first = build_prompt(&StageKey::Dimensions, "car", None, 5, 1);
        let third = build_prompt(&StageKey::Dimensions, "car", None, 5, 3);
        assert!(!first.contains("batch"));
        assert!(third.contains("batch 3"));
    }
}
