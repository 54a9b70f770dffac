//! # Route and Model Registry
//!
//! ## Responsibility
//! Own the immutable routing tables built from configuration at startup: the
//! weighted route set, the logical → physical model bindings per route, and
//! the reverse physical → logical mapping. Every worker process loads the
//! same config and therefore derives identical tables.
//!
//! ## Guarantees
//! - Deterministic: the same config always produces the same tables
//! - Normalized: route weights are rescaled so they sum to exactly 100
//! - Total: `resolve` never fails — unmapped logical names fall back to an
//!   identity binding on the route's default provider
//! - Invertible: `logical_for(resolve(l, r).physical, r) == l` for every
//!   logical name, including identity fallbacks
//!
//! ## NOT Responsible For
//! - Choosing a route for a request (that belongs to `routing::selector`)
//! - Validating cross-references (that belongs to `config::validation`)

use std::collections::HashMap;

use serde::Serialize;

use crate::config::{OrchestratorConfig, SelectionStrategy};

/// Identifier of one configured route.
///
/// Routes name an upstream account or region (e.g., "dashscope",
/// "volcengine"); one is chosen per batch and every model task in that batch
/// resolves against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RouteId(
    /// The raw route name as written in config.
    pub String,
);

impl RouteId {
    /// Create a new [`RouteId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the route name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One route with its normalized selection weight.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    /// Route identifier.
    pub id: RouteId,
    /// Normalized weight in percent. All entries sum to exactly 100.
    pub weight: u8,
    /// Provider used for identity fallback bindings on this route.
    pub default_provider: String,
}

/// A fully resolved model binding: what to call, where, and under which
/// rate-limit key.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBinding {
    /// Caller-facing logical model name.
    pub logical: String,
    /// Provider-side model identifier sent on the wire.
    pub physical: String,
    /// Provider that serves the call.
    pub provider: String,
    /// Key the rate limiter buckets this binding under.
    pub limit_key: String,
}

/// Immutable registry of routes and model bindings.
///
/// Built once from a validated [`OrchestratorConfig`]; never mutated after.
#[derive(Debug)]
pub struct ModelRegistry {
    routes: Vec<RouteEntry>,
    default_ix: usize,
    strategy: SelectionStrategy,
    routing_enabled: bool,
    /// (route, logical) → binding.
    bindings: HashMap<(String, String), ModelBinding>,
    /// (route, physical) → logical, for mapping wire responses back.
    reverse: HashMap<(String, String), String>,
}

impl ModelRegistry {
    /// Build the registry from a validated configuration.
    ///
    /// Weights are clamped to 100 and rescaled so the route table sums to
    /// exactly 100; a warning is logged whenever rescaling changes a
    /// configured value.
    ///
    /// # Panics
    ///
    /// This function never panics on configs accepted by
    /// [`config::validation::validate`](crate::config::validation::validate).
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let mut routes = normalize_weights(&config.routing.routes);
        if routes.is_empty() {
            // An unvalidated config can carry an empty route table.
            // Synthesize the configured default so `default_route` stays
            // total; identity fallbacks on it carry an empty provider and
            // fail at dispatch instead of here.
            tracing::warn!(
                target: "orchestrator::registry",
                route = %config.routing.default_route,
                "empty route table; synthesizing the default route"
            );
            routes.push(RouteEntry {
                id: RouteId::new(&config.routing.default_route),
                weight: 100,
                default_provider: String::new(),
            });
        }

        let default_ix = routes
            .iter()
            .position(|r| r.id.as_str() == config.routing.default_route)
            .unwrap_or(0);

        let mut bindings = HashMap::new();
        let mut reverse = HashMap::new();
        for binding in &config.models {
            let limit_key = binding
                .limit_class
                .clone()
                .unwrap_or_else(|| binding.provider.clone());
            bindings.insert(
                (binding.route.clone(), binding.logical.clone()),
                ModelBinding {
                    logical: binding.logical.clone(),
                    physical: binding.physical.clone(),
                    provider: binding.provider.clone(),
                    limit_key,
                },
            );
            reverse.insert(
                (binding.route.clone(), binding.physical.clone()),
                binding.logical.clone(),
            );
        }

        tracing::debug!(
            target: "orchestrator::registry",
            routes = routes.len(),
            bindings = bindings.len(),
            strategy = ?config.routing.strategy,
            "registry built"
        );

        Self {
            routes,
            default_ix,
            strategy: config.routing.strategy,
            routing_enabled: config.routing.enabled,
            bindings,
            reverse,
        }
    }

    /// All routes with normalized weights, in config order.
    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    /// Look up a route by name.
    pub fn route(&self, name: &str) -> Option<&RouteEntry> {
        self.routes.iter().find(|r| r.id.as_str() == name)
    }

    /// The route used when routing is disabled.
    ///
    /// Total: the registry always holds at least one route, even when built
    /// from a config with an empty route table.
    pub fn default_route(&self) -> &RouteEntry {
        &self.routes[self.default_ix]
    }

    /// The configured selection strategy.
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Whether probabilistic routing is enabled.
    pub fn routing_enabled(&self) -> bool {
        self.routing_enabled
    }

    /// Resolve a logical model name against a route.
    ///
    /// Unmapped names fall back to an identity binding: the logical name is
    /// sent as the physical identifier, served by the route's default
    /// provider. The fallback is logged because it usually means a missing
    /// config entry rather than an intentional passthrough.
    pub fn resolve(&self, logical: &str, route: &RouteEntry) -> ModelBinding {
        if let Some(binding) = self
            .bindings
            .get(&(route.id.as_str().to_string(), logical.to_string()))
        {
            return binding.clone();
        }

        tracing::warn!(
            target: "orchestrator::registry",
            logical,
            route = %route.id,
            provider = %route.default_provider,
            "no binding for model on route; using identity fallback"
        );

        ModelBinding {
            logical: logical.to_string(),
            physical: logical.to_string(),
            provider: route.default_provider.clone(),
            limit_key: route.default_provider.clone(),
        }
    }

    /// Map a physical model identifier back to its logical name on a route.
    ///
    /// Identity fallbacks reverse to themselves, so this is a total inverse
    /// of [`resolve`](Self::resolve).
    pub fn logical_for(&self, physical: &str, route: &str) -> String {
        self.reverse
            .get(&(route.to_string(), physical.to_string()))
            .cloned()
            .unwrap_or_else(|| physical.to_string())
    }

    /// Distinct logical model names across all routes, sorted.
    ///
    /// This is the default fan-out set when the caller does not name models
    /// explicitly.
    pub fn logical_models(&self) -> Vec<String> {
        let names: std::collections::BTreeSet<&str> = self
            .bindings
            .keys()
            .map(|(_, logical)| logical.as_str())
            .collect();
        names.into_iter().map(str::to_string).collect()
    }
}

/// Clamp weights to 100 and rescale so the table sums to exactly 100.
///
/// Uses cumulative rounding: each route's share is the difference between
/// consecutive rounded cumulative boundaries, so no rounding drift can push
/// the total off 100.
fn normalize_weights(routes: &[crate::config::RouteConfig]) -> Vec<RouteEntry> {
    let clamped: Vec<u32> = routes
        .iter()
        .map(|r| {
            if r.weight > 100 {
                tracing::warn!(
                    target: "orchestrator::registry",
                    route = %r.name,
                    weight = r.weight,
                    "route weight above 100; clamping"
                );
            }
            u32::from(r.weight.min(100))
        })
        .collect();

    let total: u32 = clamped.iter().sum();
    if total == 0 {
        // Validation rejects this for non-empty tables; for an empty one
        // the caller synthesizes the default route.
        return Vec::new();
    }

    if total != 100 {
        tracing::warn!(
            target: "orchestrator::registry",
            total,
            "route weights do not sum to 100; rescaling"
        );
    }

    let mut entries = Vec::with_capacity(routes.len());
    let mut acc = 0u32;
    let mut prev_boundary = 0u32;
    for (route, weight) in routes.iter().zip(&clamped) {
        acc += weight;
        let boundary = (acc * 100 + total / 2) / total;
        let share = boundary - prev_boundary;
        prev_boundary = boundary;
        entries.push(RouteEntry {
            id: RouteId::new(&route.name),
            weight: share as u8,
            default_provider: route.default_provider.clone(),
        });
    }
    entries
}

// ── Tests ──────────────────────────────────────────────────────────────
