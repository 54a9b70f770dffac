//! # Staged Session Flow Integration Tests
//!
//! ## Responsibility
//! Drive the full orchestration stack (workflow gating, fan-out,
//! dedup seeding, relay ordering, diagram persistence) through the public
//! facade and validate the cross-module guarantees: selections survive
//! cancellation through the store, repeat batches suppress previously
//! seen candidates, `batch_complete` readmits the next batch immediately,
//! and one failing model never poisons the rest of its batch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use candidate_orchestrator::client::{
    ChatResponse, DeltaStream, ProviderClient, ProviderSet,
};
use candidate_orchestrator::config::OrchestratorConfig;
use candidate_orchestrator::workflow::{DiagramStore, InMemoryDiagramStore};
use candidate_orchestrator::{
    BatchEvent, Candidate, ChatRequest, EchoClient, ErrorKind, Orchestrator, ProviderError,
    SessionEvent, SessionId, StageKey,
};

const FLOW_TOML: &str = r#"
[orchestrator]
name = "flow-test"
worker_processes = 1

[routing]
strategy = "weighted"
default_route = "main"

[[routing.routes]]
name = "main"
weight = 100
default_provider = "dashscope"

[[models]]
logical = "qwen"
route = "main"
provider = "dashscope"
physical = "qwen-plus"

[[models]]
logical = "deepseek"
route = "main"
provider = "deepseek"
physical = "deepseek-chat"

[[providers]]
name = "dashscope"
kind = "echo"

[[providers]]
name = "deepseek"
kind = "echo"

[aggregator]
retry_attempts = 2
retry_base_ms = 1
retry_max_ms = 5
model_deadline_s = 5
candidates_per_model = 5
max_tokens = 200
channel_capacity = 64

[workflow]
session_idle_timeout_s = 1800
sweep_interval_s = 300

[observability]
log_format = "pretty"
"#;

// ── Scripted providers ─────────────────────────────────────────────────

/// Provider that rejects every call with a fixed error kind.
struct RefusingClient {
    kind: ErrorKind,
}

#[async_trait]
impl ProviderClient for RefusingClient {
    fn name(&self) -> &str {
        "refusing"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::new(self.kind, "refusing", "scripted refusal"))
    }

    async fn stream_chat(&self, _request: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        Err(ProviderError::new(self.kind, "refusing", "scripted refusal"))
    }
}

/// Provider that fails the first `failures` calls with a retryable 500,
/// then behaves like an echo provider.
struct FlakyClient {
    inner: EchoClient,
    failures: AtomicU32,
}

impl FlakyClient {
    fn new(failures: u32) -> Self {
        Self {
            inner: EchoClient::default(),
            failures: AtomicU32::new(failures),
        }
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl ProviderClient for FlakyClient {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        if self.should_fail() {
            return Err(ProviderError::new(
                ErrorKind::ServerError,
                "flaky",
                "scripted 500",
            ));
        }
        self.inner.chat(request).await
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        if self.should_fail() {
            return Err(ProviderError::new(
                ErrorKind::ServerError,
                "flaky",
                "scripted 500",
            ));
        }
        self.inner.stream_chat(request).await
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

fn flow_config() -> OrchestratorConfig {
    toml::from_str(FLOW_TOML).expect("test: config parses")
}

fn echo_providers() -> ProviderSet {
    let mut providers = ProviderSet::default();
    providers.insert("dashscope", Arc::new(EchoClient::default()));
    providers.insert("deepseek", Arc::new(EchoClient::default()));
    providers
}

fn orchestrator_with(providers: ProviderSet) -> (Orchestrator, Arc<InMemoryDiagramStore>) {
    let store = Arc::new(InMemoryDiagramStore::new());
    let orchestrator = Orchestrator::from_parts(flow_config(), providers, store.clone());
    (orchestrator, store)
}

async fn recv_within(rx: &mut mpsc::Receiver<SessionEvent>) -> Option<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("test: event arrives within deadline")
}

async fn drain(mut rx: mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = recv_within(&mut rx).await {
        events.push(event);
    }
    events
}

fn candidates(events: &[SessionEvent]) -> Vec<&Candidate> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Batch(BatchEvent::Candidate { candidate }) => Some(candidate),
            _ => None,
        })
        .collect()
}

fn batch_complete(events: &[SessionEvent]) -> &BatchEvent {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Batch(complete @ BatchEvent::BatchComplete { .. }) => Some(complete),
            _ => None,
        })
        .next_back()
        .expect("test: stream carries a terminal batch_complete")
}

// ── Full walk with persistence ─────────────────────────────────────────

#[tokio::test]
async fn test_full_walk_persists_every_selection_into_the_diagram() {
    let (orchestrator, store) = orchestrator_with(echo_providers());
    let session = SessionId::new("walk");
    store.seed(&session, json!({"whole": "Bicycle"}));

    // Dimensions: generate, pick exactly one.
    let rx = orchestrator
        .start(&session, "brace_map", &Value::Null)
        .await
        .expect("test: session starts");
    let events = drain(rx).await;
    let dims = candidates(&events);
    assert!(dims.len() >= 2, "expected dimension candidates, got {}", dims.len());
    let dimension_text = dims[0].text.clone();
    let snapshot = orchestrator
        .select(&session, &StageKey::Dimensions, &[dims[0].id.clone()])
        .await
        .expect("test: dimension selection");
    assert_eq!(snapshot.current, Some(StageKey::Parts));

    // Parts: generate, pick a set of two.
    let rx = orchestrator
        .next_batch(&session, &StageKey::Parts, None)
        .expect("test: parts batch starts");
    let events = drain(rx).await;
    let parts = candidates(&events);
    assert!(parts.len() >= 2, "expected part candidates, got {}", parts.len());
    let chosen_parts: Vec<String> = parts[..2].iter().map(|c| c.text.clone()).collect();
    let picked: Vec<String> = parts[..2].iter().map(|c| c.id.clone()).collect();
    let snapshot = orchestrator
        .select(&session, &StageKey::Parts, &picked)
        .await
        .expect("test: parts selection");
    assert_eq!(
        snapshot.current,
        Some(StageKey::subparts(chosen_parts[0].as_str())),
        "first selected part should open as the current tab"
    );

    // Subparts: one tab per selected part, in selection order.
    let mut snapshot = snapshot;
    for part in &chosen_parts {
        let stage = StageKey::subparts(part.as_str());
        let rx = orchestrator
            .next_batch(&session, &stage, None)
            .expect("test: subparts batch starts");
        let events = drain(rx).await;
        let tab = candidates(&events);
        let pick = vec![tab.first().expect("test: subpart candidate").id.clone()];
        snapshot = orchestrator
            .select(&session, &stage, &pick)
            .await
            .expect("test: subparts selection");
    }
    assert!(snapshot.current.is_none(), "all stages should be confirmed");

    let final_snapshot = orchestrator.finish(&session).expect("test: finish");
    assert!(final_snapshot.finished);
    assert_eq!(orchestrator.workflow().session_count(), 0);

    // The persisted diagram carries the whole walk.
    let diagram = store.load(&session).await.expect("test: diagram persisted");
    assert_eq!(diagram["whole"], "Bicycle");
    assert_eq!(diagram["dimension"], dimension_text.as_str());
    let persisted = diagram["parts"].as_array().expect("test: parts array");
    assert_eq!(persisted.len(), 2);
    for (entry, chosen) in persisted.iter().zip(&chosen_parts) {
        assert_eq!(entry["name"], chosen.as_str());
        let subparts = entry["subparts"].as_array().expect("test: subparts array");
        assert_eq!(
            subparts.len(),
            1,
            "one subpart was selected for part {chosen}"
        );
        assert!(subparts[0]["name"].is_string());
    }
}

// ── Repeat batches and seeds ───────────────────────────────────────────

#[tokio::test]
async fn test_second_batch_suppresses_previously_seen_candidates() {
    let (orchestrator, _) = orchestrator_with(echo_providers());
    let session = SessionId::new("repeat");

    let rx = orchestrator
        .start(&session, "brace_map", &json!({"whole": "Car"}))
        .await
        .expect("test: session starts");
    let first = drain(rx).await;
    assert_eq!(candidates(&first).len(), 10, "5 lines from each of 2 models");

    // The echo provider regenerates identical lines; the seeds from batch 1
    // must suppress every one of them.
    let rx = orchestrator
        .next_batch(&session, &StageKey::Dimensions, None)
        .expect("test: repeat batch admitted");
    let second = drain(rx).await;

    assert!(candidates(&second).is_empty(), "no line is new in batch 2");
    if let BatchEvent::BatchComplete {
        batch,
        new_unique,
        stage_total,
        ..
    } = batch_complete(&second)
    {
        assert_eq!(*batch, 2);
        assert_eq!(*new_unique, 0, "all batch-2 lines repeat batch 1");
        assert_eq!(*stage_total, 10, "stage total counts seeds, not repeats");
    }

    for event in &second {
        if let SessionEvent::Batch(BatchEvent::ModelComplete {
            unique, duplicates, ..
        }) = event
        {
            assert_eq!(*unique, 0);
            assert_eq!(*duplicates, 5);
        }
    }
}

#[tokio::test]
async fn test_batch_complete_readmits_the_next_batch_immediately() {
    let (orchestrator, _) = orchestrator_with(echo_providers());
    let session = SessionId::new("readmit");

    let rx = orchestrator
        .start(&session, "brace_map", &json!({"whole": "Car"}))
        .await
        .expect("test: session starts");
    drain(rx).await;

    // The generation guard is released before batch_complete is forwarded,
    // so a consumer that drained the stream never sees BatchInProgress.
    let rx = orchestrator
        .next_batch(&session, &StageKey::Dimensions, None)
        .expect("test: next batch admitted without waiting");
    let events = drain(rx).await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::Batch(BatchEvent::BatchStart { batch: 2, .. }))),
        "second batch should run as batch 2"
    );
}

// ── Relay ordering ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_candidate_is_recorded_before_its_event_is_observable() {
    let mut providers = ProviderSet::default();
    providers.insert("dashscope", Arc::new(EchoClient::new(3).with_delay(30)));
    providers.insert("deepseek", Arc::new(EchoClient::new(3).with_delay(30)));
    let (orchestrator, _) = orchestrator_with(providers);
    let session = SessionId::new("ordering");

    let mut rx = orchestrator
        .start(&session, "brace_map", &json!({"whole": "Car"}))
        .await
        .expect("test: session starts");

    let mut observed = 0usize;
    while let Some(event) = recv_within(&mut rx).await {
        if let SessionEvent::Batch(BatchEvent::Candidate { .. }) = &event {
            observed += 1;
            let snapshot = orchestrator.snapshot(&session).expect("test: snapshot");
            let view = snapshot
                .stages
                .iter()
                .find(|v| v.stage == StageKey::Dimensions)
                .expect("test: dimensions view");
            assert!(
                view.candidates >= observed,
                "event {observed} arrived but the workflow only counts {}",
                view.candidates
            );
        }
    }
    assert_eq!(observed, 6, "3 lines from each of 2 delayed models");
}

// ── Failure containment ────────────────────────────────────────────────

#[tokio::test]
async fn test_failing_model_is_contained_to_one_error_event() {
    let mut providers = ProviderSet::default();
    providers.insert("dashscope", Arc::new(EchoClient::default()));
    providers.insert(
        "deepseek",
        Arc::new(RefusingClient {
            kind: ErrorKind::ContentFilter,
        }),
    );
    let (orchestrator, _) = orchestrator_with(providers);
    let session = SessionId::new("contain");

    let rx = orchestrator
        .start(&session, "brace_map", &json!({"whole": "Car"}))
        .await
        .expect("test: session starts");
    let events = drain(rx).await;

    let errors: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Batch(BatchEvent::Error {
                model,
                kind,
                message_key,
                retryable,
            }) => Some((model.as_str(), *kind, *message_key, *retryable)),
            _ => None,
        })
        .collect();
    assert_eq!(
        errors,
        vec![("deepseek", ErrorKind::ContentFilter, "content_filtered", false)],
        "exactly one terminal error, attributed to the failing logical model"
    );

    let survivors = candidates(&events);
    assert_eq!(survivors.len(), 5, "the healthy model still delivers");
    assert!(survivors.iter().all(|c| c.model == "qwen"));

    if let BatchEvent::BatchComplete {
        new_unique,
        failed_models,
        cancelled,
        ..
    } = batch_complete(&events)
    {
        assert_eq!(*new_unique, 5);
        assert_eq!(*failed_models, 1);
        assert!(!cancelled);
    }

    // Selection over the surviving candidates proceeds normally.
    let snapshot = orchestrator
        .select(&session, &StageKey::Dimensions, &[survivors[0].id.clone()])
        .await
        .expect("test: selection after partial failure");
    assert_eq!(snapshot.current, Some(StageKey::Parts));
}

#[tokio::test]
async fn test_retryable_failure_recovers_inside_the_batch() {
    let mut providers = ProviderSet::default();
    providers.insert("dashscope", Arc::new(EchoClient::default()));
    providers.insert("deepseek", Arc::new(FlakyClient::new(1)));
    let (orchestrator, _) = orchestrator_with(providers);
    let session = SessionId::new("recover");

    let rx = orchestrator
        .start(&session, "brace_map", &json!({"whole": "Car"}))
        .await
        .expect("test: session starts");
    let events = drain(rx).await;

    assert!(
        !events
            .iter()
            .any(|e| matches!(e, SessionEvent::Batch(BatchEvent::Error { .. }))),
        "a recovered retry must not surface an error event"
    );
    assert_eq!(candidates(&events).len(), 10, "both models deliver after retry");
    if let BatchEvent::BatchComplete { failed_models, .. } = batch_complete(&events) {
        assert_eq!(*failed_models, 0);
    }
}

// ── Cancellation and resume ────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_keeps_persisted_selections_and_resume_continues() {
    let (orchestrator, store) = orchestrator_with(echo_providers());
    let session = SessionId::new("resume");
    store.seed(&session, json!({"whole": "Bicycle"}));

    let rx = orchestrator
        .start(&session, "brace_map", &Value::Null)
        .await
        .expect("test: session starts");
    let events = drain(rx).await;
    let dims = candidates(&events);
    let dimension_text = dims[0].text.clone();
    orchestrator
        .select(&session, &StageKey::Dimensions, &[dims[0].id.clone()])
        .await
        .expect("test: dimension selection");

    assert!(orchestrator.cancel(&session).is_some());
    assert_eq!(orchestrator.workflow().session_count(), 0);

    // A fresh start with no diagram data resumes from the store: the
    // dimension survives the cancel, and generation picks up at parts.
    let mut rx = orchestrator
        .start(&session, "brace_map", &Value::Null)
        .await
        .expect("test: session resumes");
    let first = recv_within(&mut rx).await.expect("test: opening event");
    assert!(
        matches!(
            &first,
            SessionEvent::StateChanged(state)
                if state.snapshot.resumed && state.snapshot.current == Some(StageKey::Parts)
        ),
        "first event must be a resumed state_changed at parts, got {first:?}"
    );
    let snapshot = orchestrator.snapshot(&session).expect("test: snapshot");
    let dims_view = snapshot
        .stages
        .iter()
        .find(|v| v.stage == StageKey::Dimensions)
        .expect("test: dimensions view");
    assert!(dims_view.locked);
    assert_eq!(dims_view.selected, vec![dimension_text]);

    let mut rest = Vec::new();
    while let Some(event) = recv_within(&mut rx).await {
        rest.push(event);
    }
    assert!(
        rest.iter()
            .any(|e| matches!(e, SessionEvent::Batch(BatchEvent::BatchStart { batch: 1, .. }))),
        "resume at parts should auto-generate its first batch"
    );
    assert!(!candidates(&rest).is_empty(), "parts candidates stream in");
}
