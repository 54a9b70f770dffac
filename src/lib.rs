//! # candidate-orchestrator
//!
//! LLM-request orchestration for staged diagram-candidate generation.
//!
//! ## Architecture
//!
//! A single logical request fans out to several provider streams at once:
//! ```text
//! caller → workflow (stage gate) → route selection → registry resolve
//!        → fan-out (N provider streams, rate-limited) → merge + dedup
//!        → candidate events → selection → stage lock → next stage
//! ```
//!
//! Route selection is stateless so the surrounding web tier can run any
//! number of OS processes without shared memory; per-provider budgets are
//! split across those processes at startup.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod aggregator;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod routing;
pub mod sse;
pub mod workflow;

// Re-exports for convenience
pub use aggregator::{BatchEvent, StreamAggregator};
pub use client::{AnthropicClient, ChatRequest, EchoClient, OpenAiCompatClient, ProviderClient};
pub use error::{ErrorKind, ProviderError};
pub use orchestrator::{Orchestrator, SessionEvent};
pub use registry::{ModelRegistry, RouteId};
pub use routing::RouteSelector;
pub use workflow::{StateError, WorkflowStateMachine};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///   for local development
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Every error surface in the orchestration layer is mapped to a variant
/// here. All variants implement `std::error::Error` via [`thiserror`].
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// An event channel closed unexpectedly, indicating consumer shutdown.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// A provider call failed; carries the classified error, never raw text.
    #[error(transparent)]
    Provider(#[from] error::ProviderError),

    /// A workflow rule was violated by the caller (non-retryable).
    #[error(transparent)]
    State(#[from] workflow::StateError),

    /// A second batch was requested while one is already running for the
    /// same (session, stage) key. The caller must wait for `batch_complete`.
    #[error("batch in progress for session {session} stage {stage}")]
    BatchInProgress {
        /// Session holding the running batch.
        session: String,
        /// Stage key of the running batch.
        stage: String,
    },

    /// A configuration value is missing or invalid.
    ///
    /// This is returned at construction time so that misconfiguration
    /// surfaces immediately rather than at the first provider call.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Unique session identifier for request tracking and workflow affinity.
///
/// Sessions group the staged candidate workflow of one diagram; the
/// surrounding web tier supplies them opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(
    /// The raw string ID, typically a UUID or user-provided token.
    pub String,
);

impl SessionId {
    /// Create a new [`SessionId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the session ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One phase of the staged candidate workflow.
///
/// The subparts stage is keyed per selected part ("tab"), so every part
/// carries an independent candidate list and lock flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum StageKey {
    /// Pick exactly one decomposition dimension.
    Dimensions,
    /// Pick a set of parts under the chosen dimension.
    Parts,
    /// Pick subparts for one selected part.
    Subparts {
        /// The part (STAGE_2 selection) these subparts belong to.
        part: String,
    },
}

impl StageKey {
    /// Stage key for the subparts of `part`.
    pub fn subparts(part: impl Into<String>) -> Self {
        Self::Subparts { part: part.into() }
    }
}

impl std::fmt::Display for StageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dimensions => f.write_str("dimensions"),
            Self::Parts => f.write_str("parts"),
            Self::Subparts { part } => write!(f, "subparts:{part}"),
        }
    }
}

impl From<StageKey> for String {
    fn from(key: StageKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for StageKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "dimensions" => Ok(Self::Dimensions),
            "parts" => Ok(Self::Parts),
            other => match other.strip_prefix("subparts:") {
                Some(part) if !part.is_empty() => Ok(Self::subparts(part)),
                _ => Err(format!("unknown stage key: {other}")),
            },
        }
    }
}

/// One generated text unit offered for selection within a stage.
///
/// Immutable once emitted. The `model` field always carries the logical
/// model name; physical provider identifiers never leak past the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    /// Stable id in the form `{session}_{model}_{batch}_{seq}`.
    pub id: String,
    /// The candidate text as produced by the model, after list-prefix trim.
    pub text: String,
    /// Logical model that produced this candidate.
    pub model: String,
    /// Stage this candidate belongs to.
    pub stage: StageKey,
    /// 1-based batch number within the stage.
    pub batch: u32,
    /// Normalized text used for duplicate suppression.
    #[serde(skip)]
    pub dedup_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_as_str_round_trips() {
        let session = SessionId::new("my-session");
        assert_eq!(session.as_str(), "my-session");
    }

    #[test]
    fn test_stage_key_display_forms() {
        assert_eq!(StageKey::Dimensions.to_string(), "dimensions");
        assert_eq!(StageKey::Parts.to_string(), "parts");
        assert_eq!(StageKey::subparts("engine").to_string(), "subparts:engine");
    }

    #[test]
    fn test_stage_key_parse_round_trips() {
        for key in [
            StageKey::Dimensions,
            StageKey::Parts,
            StageKey::subparts("车轮"),
        ] {
            let parsed = StageKey::try_from(key.to_string());
            assert_eq!(parsed.as_ref(), Ok(&key), "round trip failed for {key}");
        }
    }

    #[test]
    fn test_stage_key_parse_rejects_unknown() {
        assert!(StageKey::try_from("stage_4".to_string()).is_err());
        assert!(StageKey::try_from("subparts:".to_string()).is_err());
    }

    #[test]
    fn test_batch_in_progress_display_names_both_keys() {
        let err = OrchestratorError::BatchInProgress {
            session: "s1".into(),
            stage: "dimensions".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("s1") && msg.contains("dimensions"));
    }

    #[test]
    fn test_config_error_display_includes_message() {
        let err = OrchestratorError::ConfigError("QWEN_API_KEY not set".to_string());
        assert!(err.to_string().contains("QWEN_API_KEY not set"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order
        // (another test may have already installed a subscriber).
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
