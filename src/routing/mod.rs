//! # Stage: Route Selection
//!
//! ## Responsibility
//! Pick one upstream route per batch from the weighted route table. The
//! chosen route applies to every model task in that batch, so a batch never
//! mixes upstream accounts.
//!
//! ## Guarantees
//! - Stateless under `weighted`: each draw is independent, so any number of
//!   worker processes converge on the configured split without coordination.
//! - Deterministic given a seeded RNG: `select_with_rng` exists so tests can
//!   replay exact draw sequences.
//! - Total: selection always returns a route; a disabled router returns the
//!   configured default.
//!
//! ## NOT Responsible For
//! - Resolving models against the chosen route (that belongs to `registry`)
//! - Rate limiting the providers behind a route (that belongs to `limiter`)

pub mod selector;

pub use selector::RouteSelector;
