//! Weighted route selection.
//!
//! The [`RouteSelector`] draws one route per batch from the registry's
//! normalized route table. The weighted strategy draws an integer in
//! `[1, 100]` and walks cumulative weight boundaries, so a route with
//! weight 30 owns draws 1–30 and never sees draw 31.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::config::SelectionStrategy;
use crate::registry::{ModelRegistry, RouteEntry};

/// Picks one route per batch according to the configured strategy.
///
/// Thread-safe: the only mutable state is the round-robin cursor, which is
/// an atomic. Weighted and random selection carry no state at all.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct RouteSelector {
    registry: Arc<ModelRegistry>,
    /// Round-robin cursor. Per-process only; see [`SelectionStrategy::RoundRobin`].
    cursor: AtomicUsize,
}

impl std::fmt::Debug for RouteSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSelector")
            .field("strategy", &self.registry.strategy())
            .field("routes", &self.registry.routes().len())
            .finish()
    }
}

impl RouteSelector {
    /// Create a selector over the registry's route table.
    ///
    /// Logs a warning when the strategy is `round_robin`: its cursor lives
    /// in this process only, so the real traffic split skews as soon as more
    /// than one worker process is deployed.
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        if registry.strategy() == SelectionStrategy::RoundRobin {
            tracing::warn!(
                target: "orchestrator::routing",
                "round_robin cursor is per-process; weighted is the safe choice \
                 under multi-process deployment"
            );
        }

        Self {
            registry,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Select a route for the next batch.
    pub fn select(&self) -> &RouteEntry {
        self.select_with_rng(&mut rand::thread_rng())
    }

    /// Select a route using a caller-supplied RNG.
    ///
    /// Seeded tests use this to replay exact draw sequences; production code
    /// goes through [`select`](Self::select).
    pub fn select_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> &RouteEntry {
        let routes = self.registry.routes();

        if !self.registry.routing_enabled() || routes.len() <= 1 {
            return self.registry.default_route();
        }

        let chosen = match self.registry.strategy() {
            SelectionStrategy::Weighted => {
                let draw: u32 = rng.gen_range(1..=100);
                route_for_draw(routes, draw)
            }
            SelectionStrategy::Random => routes.get(rng.gen_range(0..routes.len())),
            SelectionStrategy::RoundRobin => {
                let ix = self.cursor.fetch_add(1, Ordering::Relaxed) % routes.len();
                routes.get(ix)
            }
        };

        let route = chosen.unwrap_or_else(|| self.registry.default_route());
        tracing::debug!(
            target: "orchestrator::routing",
            route = %route.id,
            strategy = ?self.registry.strategy(),
            "route selected"
        );
        route
    }
}

/// Map a draw in `[1, 100]` onto cumulative weight boundaries.
///
/// Weights sum to 100 (the registry normalizes them), so every draw in range
/// lands on exactly one route and zero-weight routes are never hit.
fn route_for_draw(routes: &[RouteEntry], draw: u32) -> Option<&RouteEntry> {
    let mut boundary = 0u32;
    for route in routes {
        boundary += u32::from(route.weight);
        if draw <= boundary {
            return Some(route);
        }
    }
    routes.last()
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn registry_with(strategy: &str, enabled: bool, weights: &[(&str, u8)]) -> Arc<ModelRegistry> {
        let mut toml_str = format!(
            r#"
[orchestrator]
name = "test"

[routing]
enabled = {enabled}
strategy = "{strategy}"
default_route = "{default}"
"#,
            default = weights[0].0,
        );
        for (name, weight) in weights {
            toml_str.push_str(&format!(
                r#"
[[routing.routes]]
name = "{name}"
weight = {weight}
default_provider = "p"
"#
            ));
        }
        toml_str.push_str(
            r#"
[[providers]]
name = "p"
kind = "echo"

[observability]
log_format = "pretty"
"#,
        );
        let config: OrchestratorConfig = toml::from_str(&toml_str).expect("test: config parses");
        Arc::new(ModelRegistry::from_config(&config))
    }

    // -- draw boundaries -------------------------------------------------

    #[test]
    fn test_draw_1_hits_first_route() {
        let registry = registry_with("weighted", true, &[("a", 30), ("b", 70)]);
        let route = route_for_draw(registry.routes(), 1).expect("test: route");
        assert_eq!(route.id.as_str(), "a");
    }

    #[test]
    fn test_draw_on_boundary_stays_with_earlier_route() {
        let registry = registry_with("weighted", true, &[("a", 30), ("b", 70)]);
        let route = route_for_draw(registry.routes(), 30).expect("test: route");
        assert_eq!(route.id.as_str(), "a");
    }

    #[test]
    fn test_draw_past_boundary_moves_to_next_route() {
        let registry = registry_with("weighted", true, &[("a", 30), ("b", 70)]);
        let route = route_for_draw(registry.routes(), 31).expect("test: route");
        assert_eq!(route.id.as_str(), "b");
    }

    #[test]
    fn test_draw_100_hits_last_route() {
        let registry = registry_with("weighted", true, &[("a", 30), ("b", 70)]);
        let route = route_for_draw(registry.routes(), 100).expect("test: route");
        assert_eq!(route.id.as_str(), "b");
    }

    #[test]
    fn test_zero_weight_route_is_never_drawn() {
        let registry = registry_with("weighted", true, &[("a", 0), ("b", 100)]);
        for draw in 1..=100 {
            let route = route_for_draw(registry.routes(), draw).expect("test: route");
            assert_eq!(route.id.as_str(), "b", "draw {draw} hit zero-weight route");
        }
    }

    // -- strategies ------------------------------------------------------

    #[test]
    fn test_weighted_seeded_draws_follow_configured_split() {
        let registry = registry_with("weighted", true, &[("a", 30), ("b", 70)]);
        let selector = RouteSelector::new(registry);
        let mut rng = StdRng::seed_from_u64(7);

        let mut hits_a = 0u32;
        for _ in 0..1000 {
            if selector.select_with_rng(&mut rng).id.as_str() == "a" {
                hits_a += 1;
            }
        }
        // 30% of 1000 with generous slack for a fixed seed.
        assert!(
            (250..=350).contains(&hits_a),
            "expected ~300 hits on route a, got {hits_a}"
        );
    }

    #[test]
    fn test_random_returns_routes_from_table() {
        let registry = registry_with("random", true, &[("a", 50), ("b", 50)]);
        let selector = RouteSelector::new(registry);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let name = selector.select_with_rng(&mut rng).id.as_str().to_string();
            assert!(name == "a" || name == "b");
        }
    }

    #[test]
    fn test_round_robin_rotates_in_order() {
        let registry = registry_with("round_robin", true, &[("a", 50), ("b", 50)]);
        let selector = RouteSelector::new(registry);
        let mut rng = StdRng::seed_from_u64(7);
        let picks: Vec<String> = (0..4)
            .map(|_| selector.select_with_rng(&mut rng).id.as_str().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    // -- disabled routing ------------------------------------------------

    #[test]
    fn test_disabled_routing_always_returns_default() {
        let registry = registry_with("weighted", false, &[("a", 1), ("b", 99)]);
        let selector = RouteSelector::new(registry);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert_eq!(selector.select_with_rng(&mut rng).id.as_str(), "a");
        }
    }

    #[test]
    fn test_single_route_table_skips_the_draw() {
        let registry = registry_with("weighted", true, &[("only", 100)]);
        let selector = RouteSelector::new(registry);
        assert_eq!(selector.select().id.as_str(), "only");
    }
}
