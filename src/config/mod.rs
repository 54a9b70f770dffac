//! # Declarative Orchestrator Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML configuration that fixes routes, model
//! bindings, provider endpoints, rate budgets, and workflow settings at
//! process startup. Routes and budgets are immutable once loaded — the
//! multi-process deployment model depends on every process reading the same
//! file and deriving the same tables.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Type-safe: invalid field combinations are caught at parse time via serde
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the runtime registry from config (that belongs to `registry`)
//! - Creating provider clients (that belongs to `client`)
//! - Splitting budgets across processes (that belongs to `limiter`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

/// Default worker-process count: 1 (single-process deployment).
fn default_worker_processes() -> u32 {
    1
}

/// Default rate-limit window: 60 seconds.
fn default_window_s() -> u64 {
    60
}

/// Default limiter policy when the window is exhausted.
fn default_limit_policy() -> LimitPolicy {
    LimitPolicy::Wait
}

/// Default retry attempts per model task.
fn default_retry_attempts() -> u32 {
    3
}

/// Default retry base delay: 1000ms.
fn default_retry_base_ms() -> u64 {
    1000
}

/// Default retry maximum delay: 10 000ms.
fn default_retry_max_ms() -> u64 {
    10_000
}

/// Default absolute deadline per provider call: 20 seconds.
fn default_model_deadline_s() -> u64 {
    20
}

/// Default candidates requested from each model per batch.
fn default_candidates_per_model() -> u32 {
    15
}

/// Default maximum tokens per provider call.
fn default_max_tokens() -> u32 {
    500
}

/// Default event channel capacity for a running batch.
fn default_channel_capacity() -> usize {
    256
}

/// Default base sampling temperature for the first batch.
fn default_temperature_base() -> f32 {
    0.7
}

/// Default temperature increase per additional batch.
fn default_temperature_step() -> f32 {
    0.1
}

/// Default temperature ceiling across batches.
fn default_temperature_max() -> f32 {
    1.0
}

/// Default session idle timeout: 30 minutes.
fn default_idle_timeout_s() -> u64 {
    1800
}

/// Default idle-session sweep interval: 5 minutes.
fn default_sweep_interval_s() -> u64 {
    300
}

/// Default provider call timeout: 30 seconds.
fn default_provider_timeout_s() -> u64 {
    30
}

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an orchestrator instance.
///
/// Deserialized from a TOML file and validated before use.
/// Every field has either a required value or a documented default.
///
/// # Example
///
/// ```toml
/// [orchestrator]
/// name = "production"
/// worker_processes = 4
///
/// [routing]
/// strategy = "weighted"
/// default_route = "dashscope"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// Instance identity and deployment shape.
    pub orchestrator: OrchestratorSection,
    /// Route table and selection strategy.
    pub routing: RoutingConfig,
    /// Logical → physical model bindings, one entry per (logical, route).
    #[serde(default)]
    pub models: Vec<BindingConfig>,
    /// Provider endpoint definitions.
    pub providers: Vec<ProviderConfig>,
    /// Per-provider rate budgets. Providers without an entry are unlimited.
    #[serde(default)]
    pub limits: Vec<LimitConfig>,
    /// Fan-out, retry, and batch settings.
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Staged-workflow settings.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Observability: logging and metrics.
    pub observability: ObservabilityConfig,
}

// ── Instance identity ────────────────────────────────────────────────────

/// Instance identity and deployment shape.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorSection {
    /// Human-readable instance name (e.g., "production", "staging").
    pub name: String,
    /// Optional description for documentation purposes.
    pub description: Option<String>,
    /// Number of OS worker processes in the deployment. Per-provider budgets
    /// are divided by this count at startup; it comes from deployment
    /// configuration, never from runtime discovery.
    #[serde(default = "default_worker_processes")]
    pub worker_processes: u32,
}

// ── Routing ──────────────────────────────────────────────────────────────

/// Route table and selection strategy.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// Whether probabilistic routing is enabled. When disabled, every
    /// request uses `default_route`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Selection strategy across routes.
    pub strategy: SelectionStrategy,
    /// Route used when routing is disabled or a draw is not applicable.
    pub default_route: String,
    /// The fixed route set. Weights are percentages; they are normalized to
    /// sum to 100 when the registry is built.
    pub routes: Vec<RouteConfig>,
}

/// One named route: a weight plus a default provider for identity fallbacks.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouteConfig {
    /// Route name (e.g., "dashscope", "volcengine").
    pub name: String,
    /// Selection weight in percent, 0–100.
    pub weight: u8,
    /// Provider used when a logical model has no binding on this route.
    pub default_provider: String,
}

/// Route selection strategies.
///
/// `round_robin` keeps an independent counter per process, so the real
/// traffic split skews under multi-process deployment. It is implemented for
/// completeness but excluded from recommended strategies; prefer `weighted`.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Stateless weighted draw — correct under any number of processes.
    Weighted,
    /// Uniform random choice among routes.
    Random,
    /// Per-process rotating counter. Unsafe under multi-process deployment.
    RoundRobin,
}

// ── Model bindings ───────────────────────────────────────────────────────

/// One logical → physical model binding on a route.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BindingConfig {
    /// Caller-facing logical model name (e.g., "deepseek").
    pub logical: String,
    /// Route this binding belongs to.
    pub route: String,
    /// Provider that serves the physical model.
    pub provider: String,
    /// Concrete provider-side model identifier (e.g., "ark-deepseek").
    pub physical: String,
    /// Rate-limit class; bindings sharing a class share a budget. Defaults
    /// to the provider name.
    pub limit_class: Option<String>,
}

// ── Providers ────────────────────────────────────────────────────────────

/// One provider endpoint definition.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProviderConfig {
    /// Provider name referenced by bindings and limits.
    pub name: String,
    /// Wire protocol spoken by the endpoint.
    pub kind: ProviderKind,
    /// Base URL of the API (unused by the echo provider).
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Connect/request timeout in seconds.
    #[serde(default = "default_provider_timeout_s")]
    pub timeout_s: u64,
}

/// Supported provider wire protocols.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions (dashscope, volcengine, deepseek,
    /// moonshot all speak this dialect).
    OpenaiCompat,
    /// Anthropic messages API.
    Anthropic,
    /// Echo provider for demos and tests — streams the prompt back.
    Echo,
}

// ── Rate limits ──────────────────────────────────────────────────────────

/// Per-provider request budget for one fixed window.
///
/// `requests_per_window` is the TOTAL budget for the whole deployment; the
/// limiter divides it by `worker_processes` at startup.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LimitConfig {
    /// Provider (or limit class) this budget applies to.
    pub provider: String,
    /// Total requests allowed per window across all worker processes.
    pub requests_per_window: u32,
    /// Window length in seconds.
    #[serde(default = "default_window_s")]
    pub window_s: u64,
    /// What `acquire` does once the per-process budget is exhausted.
    #[serde(default = "default_limit_policy")]
    pub policy: LimitPolicy,
    /// Whether this limit is enforced. Disabled limits grant immediately.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Behavior of `acquire` on an exhausted window.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitPolicy {
    /// Sleep until the window resets, bounded by the caller's timeout.
    Wait,
    /// Fail immediately with a rate-limit error.
    Reject,
}

// ── Aggregator ───────────────────────────────────────────────────────────

/// Fan-out, retry, and batch settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AggregatorConfig {
    /// Maximum attempts per model task (first try + retries).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay (ms) for exponential backoff. Must be ≤ `retry_max_ms`.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Maximum delay (ms) cap for exponential backoff.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Absolute deadline (seconds) per provider call, retries excluded.
    #[serde(default = "default_model_deadline_s")]
    pub model_deadline_s: u64,
    /// Candidates requested from each model per batch.
    #[serde(default = "default_candidates_per_model")]
    pub candidates_per_model: u32,
    /// Maximum tokens per provider call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Event channel capacity for a running batch.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Sampling temperature for the first batch of a stage.
    #[serde(default = "default_temperature_base")]
    pub temperature_base: f32,
    /// Temperature increase per additional batch (diversity ramp).
    #[serde(default = "default_temperature_step")]
    pub temperature_step: f32,
    /// Temperature ceiling across batches.
    #[serde(default = "default_temperature_max")]
    pub temperature_max: f32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            model_deadline_s: default_model_deadline_s(),
            candidates_per_model: default_candidates_per_model(),
            max_tokens: default_max_tokens(),
            channel_capacity: default_channel_capacity(),
            temperature_base: default_temperature_base(),
            temperature_step: default_temperature_step(),
            temperature_max: default_temperature_max(),
        }
    }
}

// ── Workflow ─────────────────────────────────────────────────────────────

/// Staged-workflow settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WorkflowConfig {
    /// Seconds of inactivity after which a session is reaped.
    #[serde(default = "default_idle_timeout_s")]
    pub session_idle_timeout_s: u64,
    /// Interval between idle-session sweeps.
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout_s: default_idle_timeout_s(),
            sweep_interval_s: default_sweep_interval_s(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration: logging and the metrics endpoint.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,
    /// Port where the embedding web tier serves the Prometheus text
    /// exposition (the output of `metrics::gather_metrics`). `None` disables
    /// scraping.
    pub metrics_port: Option<u16>,
}

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

/// Export the JSON Schema for `OrchestratorConfig`.
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}
