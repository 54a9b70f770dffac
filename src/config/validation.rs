//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that
//! cannot be expressed through the type system alone (e.g., range checks,
//! cross-table references, binding ambiguity).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)
//! - Weight normalization (that belongs to `registry`; weights that do not
//!   sum to 100 are legal here as long as the total is non-zero)

use std::collections::HashSet;

use super::{OrchestratorConfig, ProviderKind};

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "aggregator.retry_base_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Arguments
///
/// * `config` — The parsed config to validate.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Instance identity ────────────────────────────────────────────
    if config.orchestrator.name.trim().is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "orchestrator.name".into(),
            value: String::new(),
            reason: "instance name must not be empty".into(),
        });
    }

    if config.orchestrator.worker_processes == 0 {
        errors.push(ConfigError::InvalidField {
            field: "orchestrator.worker_processes".into(),
            value: "0".into(),
            reason: "deployment must declare at least 1 worker process".into(),
        });
    }

    // ── Route table ──────────────────────────────────────────────────
    if config.routing.routes.is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "routing.routes".into(),
            value: "[]".into(),
            reason: "at least one route must be defined".into(),
        });
    }

    let route_names: HashSet<&str> = config
        .routing
        .routes
        .iter()
        .map(|r| r.name.as_str())
        .collect();

    if route_names.len() != config.routing.routes.len() {
        errors.push(ConfigError::InvalidField {
            field: "routing.routes".into(),
            value: format!("{} entries", config.routing.routes.len()),
            reason: "route names must be unique".into(),
        });
    }

    if !config.routing.routes.is_empty()
        && !route_names.contains(config.routing.default_route.as_str())
    {
        errors.push(ConfigError::InvalidField {
            field: "routing.default_route".into(),
            value: config.routing.default_route.clone(),
            reason: "must name a defined route".into(),
        });
    }

    let total_weight: u32 = config
        .routing
        .routes
        .iter()
        .map(|r| u32::from(r.weight.min(100)))
        .sum();
    if !config.routing.routes.is_empty() && total_weight == 0 {
        errors.push(ConfigError::InvalidField {
            field: "routing.routes".into(),
            value: "0".into(),
            reason: "total route weight must be greater than zero".into(),
        });
    }

    // ── Providers ────────────────────────────────────────────────────
    let provider_names: HashSet<&str> =
        config.providers.iter().map(|p| p.name.as_str()).collect();

    if provider_names.len() != config.providers.len() {
        errors.push(ConfigError::InvalidField {
            field: "providers".into(),
            value: format!("{} entries", config.providers.len()),
            reason: "provider names must be unique".into(),
        });
    }

    for provider in &config.providers {
        if provider.name.trim().is_empty() {
            errors.push(ConfigError::InvalidField {
                field: "providers.name".into(),
                value: String::new(),
                reason: "provider name must not be empty".into(),
            });
        }

        if provider.kind != ProviderKind::Echo
            && provider
                .base_url
                .as_deref()
                .map_or(true, |u| u.trim().is_empty())
        {
            errors.push(ConfigError::InvalidField {
                field: format!("providers.{}.base_url", provider.name),
                value: String::new(),
                reason: "base_url is required for network providers".into(),
            });
        }

        if provider.timeout_s == 0 {
            errors.push(ConfigError::InvalidField {
                field: format!("providers.{}.timeout_s", provider.name),
                value: "0".into(),
                reason: "timeout must be at least 1 second".into(),
            });
        }
    }

    for route in &config.routing.routes {
        if !provider_names.contains(route.default_provider.as_str()) {
            errors.push(ConfigError::InvalidField {
                field: format!("routing.routes.{}.default_provider", route.name),
                value: route.default_provider.clone(),
                reason: "must name a defined provider".into(),
            });
        }
    }

    // ── Model bindings ───────────────────────────────────────────────
    let mut binding_keys = HashSet::new();
    let mut inverse_keys = HashSet::new();
    for binding in &config.models {
        if !route_names.contains(binding.route.as_str()) {
            errors.push(ConfigError::InvalidField {
                field: format!("models.{}.route", binding.logical),
                value: binding.route.clone(),
                reason: "must name a defined route".into(),
            });
        }

        if !provider_names.contains(binding.provider.as_str()) {
            errors.push(ConfigError::InvalidField {
                field: format!("models.{}.provider", binding.logical),
                value: binding.provider.clone(),
                reason: "must name a defined provider".into(),
            });
        }

        if !binding_keys.insert((binding.logical.as_str(), binding.route.as_str())) {
            errors.push(ConfigError::InvalidField {
                field: format!("models.{}", binding.logical),
                value: binding.route.clone(),
                reason: "duplicate (logical, route) binding".into(),
            });
        }

        // Two logical names mapping to the same physical on one route would
        // make the reverse lookup ambiguous.
        if !inverse_keys.insert((binding.route.as_str(), binding.physical.as_str())) {
            errors.push(ConfigError::InvalidField {
                field: format!("models.{}.physical", binding.logical),
                value: binding.physical.clone(),
                reason: "physical name already bound on this route".into(),
            });
        }
    }

    // ── Rate limits ──────────────────────────────────────────────────
    let limit_classes: HashSet<&str> = config
        .models
        .iter()
        .filter_map(|b| b.limit_class.as_deref())
        .collect();

    let mut limit_targets = HashSet::new();
    for limit in &config.limits {
        if !provider_names.contains(limit.provider.as_str())
            && !limit_classes.contains(limit.provider.as_str())
        {
            errors.push(ConfigError::InvalidField {
                field: format!("limits.{}", limit.provider),
                value: limit.provider.clone(),
                reason: "must name a defined provider or limit class".into(),
            });
        }

        if !limit_targets.insert(limit.provider.as_str()) {
            errors.push(ConfigError::InvalidField {
                field: format!("limits.{}", limit.provider),
                value: limit.provider.clone(),
                reason: "duplicate limit entry".into(),
            });
        }

        if limit.window_s == 0 {
            errors.push(ConfigError::InvalidField {
                field: format!("limits.{}.window_s", limit.provider),
                value: "0".into(),
                reason: "window must be at least 1 second".into(),
            });
        }
    }

    // ── Aggregator settings ──────────────────────────────────────────
    if config.aggregator.retry_base_ms > config.aggregator.retry_max_ms {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.retry_base_ms".into(),
            value: config.aggregator.retry_base_ms.to_string(),
            reason: "must be \u{2264} retry_max_ms".into(),
        });
    }

    if config.aggregator.retry_attempts == 0 {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.retry_attempts".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if config.aggregator.model_deadline_s == 0 {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.model_deadline_s".into(),
            value: "0".into(),
            reason: "deadline must be at least 1 second".into(),
        });
    }

    if config.aggregator.candidates_per_model == 0 {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.candidates_per_model".into(),
            value: "0".into(),
            reason: "must request at least 1 candidate per model".into(),
        });
    }

    if config.aggregator.max_tokens == 0 {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.max_tokens".into(),
            value: "0".into(),
            reason: "must allow at least 1 token".into(),
        });
    }

    if config.aggregator.channel_capacity == 0 {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.channel_capacity".into(),
            value: "0".into(),
            reason: "channel capacity must be at least 1".into(),
        });
    }

    // ── Temperature ramp ─────────────────────────────────────────────
    if !(0.0..=2.0).contains(&config.aggregator.temperature_base) {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.temperature_base".into(),
            value: config.aggregator.temperature_base.to_string(),
            reason: "must be between 0.0 and 2.0".into(),
        });
    }

    if !(0.0..=2.0).contains(&config.aggregator.temperature_max) {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.temperature_max".into(),
            value: config.aggregator.temperature_max.to_string(),
            reason: "must be between 0.0 and 2.0".into(),
        });
    }

    if config.aggregator.temperature_max < config.aggregator.temperature_base {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.temperature_max".into(),
            value: config.aggregator.temperature_max.to_string(),
            reason: "must be \u{2265} temperature_base".into(),
        });
    }

    if config.aggregator.temperature_step < 0.0 {
        errors.push(ConfigError::InvalidField {
            field: "aggregator.temperature_step".into(),
            value: config.aggregator.temperature_step.to_string(),
            reason: "must not be negative".into(),
        });
    }

    // ── Workflow ─────────────────────────────────────────────────────
    if config.workflow.session_idle_timeout_s == 0 {
        errors.push(ConfigError::InvalidField {
            field: "workflow.session_idle_timeout_s".into(),
            value: "0".into(),
            reason: "idle timeout must be at least 1 second".into(),
        });
    }

    if config.workflow.sweep_interval_s == 0 {
        errors.push(ConfigError::InvalidField {
            field: "workflow.sweep_interval_s".into(),
            value: "0".into(),
            reason: "sweep interval must be at least 1 second".into(),
        });
    }

    // ── Metrics port ────────────────────────────────────────────────
    if let Some(port) = config.observability.metrics_port {
        if port == 0 {
            errors.push(ConfigError::InvalidField {
                field: "observability.metrics_port".into(),
                value: "0".into(),
                reason: "metrics port must be at least 1".into(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
