//! # Provider Rate Limiting
//!
//! ## Responsibility
//! Enforce per-provider request budgets over fixed windows. Budgets in
//! config are deployment totals; each process gets `total / worker_processes`
//! at startup, so processes never coordinate at request time.
//!
//! ## Guarantees
//! - A granted permit always consumed exactly one slot of the current window
//! - `acquire` never sleeps past the caller's `max_wait`
//! - Providers without a configured limit are never throttled
//! - Wall-clock monotonic: windows use `Instant`, immune to clock steps
//!
//! ## NOT Responsible For
//! - Retrying after a rejection (that belongs to the aggregator's retry loop)
//! - Reading provider `Retry-After` headers (upstream 429s are classified by
//!   `error` and handled by the same retry loop)
//!
//! ## Usage
//!
//! ```no_run
//! use candidate_orchestrator::limiter::RateLimiter;
//! use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let limiter = RateLimiter::unlimited();
//!
//! match limiter.acquire("dashscope", Duration::from_secs(5)).await {
//!     Ok(_) => { /* budget slot held for this attempt */ }
//!     Err(rejected) => { /* budget exhausted, retry_in says when */ }
//! }
//! # }
//! ```

#[cfg(feature = "rate-limiting")]
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
#[cfg(feature = "rate-limiting")]
use std::num::NonZeroU32;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::{LimitPolicy, OrchestratorConfig};

/// Outcome of a successful `acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// A slot was free in the current window.
    Immediate,
    /// The window was exhausted; the call slept until a slot opened.
    AfterWait(Duration),
}

/// A request was refused because the per-process budget is exhausted.
#[derive(Debug, thiserror::Error)]
#[error("rate limit exhausted for {key}; window resets in {retry_in:?}")]
pub struct RateLimited {
    /// The provider or limit class that ran out of budget.
    pub key: String,
    /// Time until the current window resets.
    pub retry_in: Duration,
}

/// Per-provider rate limiter with fixed windows.
#[derive(Clone)]
pub struct RateLimiter {
    backend: LimiterBackend,
}

#[derive(Clone)]
enum LimiterBackend {
    /// No limits configured; every acquire is granted.
    Disabled,
    Windows(Arc<WindowLimiter>),
    #[cfg(feature = "rate-limiting")]
    Governor(Arc<GovernorBackend>),
}

/// Fixed-window counters, one slot per provider key.
struct WindowLimiter {
    specs: HashMap<String, LimitSpec>,
    slots: DashMap<String, WindowSlot>,
}

#[derive(Debug, Clone)]
struct LimitSpec {
    per_process: u32,
    window: Duration,
    policy: LimitPolicy,
}

struct WindowSlot {
    count: u32,
    reset_at: Instant,
}

#[cfg(feature = "rate-limiting")]
struct GovernorBackend {
    limiters: DashMap<String, GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    quotas: HashMap<String, (Quota, LimitPolicy)>,
}

impl RateLimiter {
    /// Build the limiter from config.
    ///
    /// Each enabled limit's total budget is divided by
    /// `orchestrator.worker_processes`. A non-zero budget smaller than the
    /// process count clamps to 1 per process (and logs, because the real
    /// aggregate rate then exceeds the configured total). A zero budget
    /// blocks its provider entirely.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let specs = per_process_specs(config);
        if specs.is_empty() {
            debug!(target: "orchestrator::limiter", "no limits configured; limiter disabled");
            return Self::unlimited();
        }

        Self {
            backend: LimiterBackend::Windows(Arc::new(WindowLimiter {
                specs,
                slots: DashMap::new(),
            })),
        }
    }

    /// A limiter that grants everything immediately.
    ///
    /// Used when no limits are configured, and by tests and demos.
    pub fn unlimited() -> Self {
        Self {
            backend: LimiterBackend::Disabled,
        }
    }

    /// Build a governor-backed limiter from config.
    ///
    /// Governor smooths each per-process budget across the window instead of
    /// enforcing hard window edges; bursts up to the full budget are allowed.
    ///
    /// # Errors
    ///
    /// Returns `Err` with the offending provider name if a budget or window
    /// produces an unrepresentable quota.
    #[cfg(feature = "rate-limiting")]
    pub fn with_governor(config: &OrchestratorConfig) -> Result<Self, String> {
        let mut quotas = HashMap::new();
        for (key, spec) in per_process_specs(config) {
            let per_process = NonZeroU32::new(spec.per_process)
                .ok_or_else(|| format!("{key}: zero budgets need the windows backend"))?;
            let period = spec.window / spec.per_process;
            let quota = Quota::with_period(period)
                .ok_or_else(|| format!("{key}: window too small for budget"))?
                .allow_burst(per_process);
            quotas.insert(key, (quota, spec.policy));
        }

        Ok(Self {
            backend: LimiterBackend::Governor(Arc::new(GovernorBackend {
                limiters: DashMap::new(),
                quotas,
            })),
        })
    }

    /// Acquire one request slot for `key`, sleeping at most `max_wait`.
    ///
    /// Providers without a configured limit are granted immediately. With
    /// the `wait` policy an exhausted window sleeps until reset, bounded by
    /// `max_wait`; with `reject` the call fails at once.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimited`] when the budget is exhausted and waiting is
    /// not allowed (or would exceed `max_wait`).
    pub async fn acquire(&self, key: &str, max_wait: Duration) -> Result<Acquired, RateLimited> {
        match &self.backend {
            LimiterBackend::Disabled => Ok(Acquired::Immediate),
            LimiterBackend::Windows(limiter) => limiter.acquire(key, max_wait).await,
            #[cfg(feature = "rate-limiting")]
            LimiterBackend::Governor(limiter) => limiter.acquire(key, max_wait).await,
        }
    }

    /// Current usage for a provider key, if it has consumed any budget.
    pub fn usage(&self, key: &str) -> Option<RateLimitInfo> {
        match &self.backend {
            LimiterBackend::Disabled => None,
            LimiterBackend::Windows(limiter) => {
                let spec = limiter.specs.get(key)?;
                limiter.slots.get(key).map(|slot| {
                    let now = Instant::now();
                    let (used, reset_in) = if slot.reset_at <= now {
                        (0, Duration::ZERO)
                    } else {
                        (slot.count, slot.reset_at - now)
                    };
                    RateLimitInfo {
                        used,
                        remaining: spec.per_process.saturating_sub(used),
                        reset_in_secs: reset_in.as_secs(),
                    }
                })
            }
            #[cfg(feature = "rate-limiting")]
            LimiterBackend::Governor(_) => {
                // Governor doesn't expose usage stats easily.
                None
            }
        }
    }

    /// Reset the window for a provider key.
    pub fn reset(&self, key: &str) {
        match &self.backend {
            LimiterBackend::Disabled => {}
            LimiterBackend::Windows(limiter) => {
                limiter.slots.remove(key);
                debug!(target: "orchestrator::limiter", key, "window reset");
            }
            #[cfg(feature = "rate-limiting")]
            LimiterBackend::Governor(limiter) => {
                limiter.limiters.remove(key);
                debug!(target: "orchestrator::limiter", key, "window reset");
            }
        }
    }
}

/// Divide each enabled limit's total budget by the worker-process count.
fn per_process_specs(config: &OrchestratorConfig) -> HashMap<String, LimitSpec> {
    let workers = config.orchestrator.worker_processes.max(1);
    let mut specs = HashMap::new();

    for limit in &config.limits {
        if !limit.enabled {
            debug!(
                target: "orchestrator::limiter",
                key = %limit.provider,
                "limit disabled; provider is unthrottled"
            );
            continue;
        }

        let per_process = if limit.requests_per_window == 0 {
            0
        } else {
            let split = limit.requests_per_window / workers;
            if split == 0 {
                warn!(
                    target: "orchestrator::limiter",
                    key = %limit.provider,
                    total = limit.requests_per_window,
                    workers,
                    "budget smaller than process count; clamping to 1 per process"
                );
            }
            split.max(1)
        };

        specs.insert(
            limit.provider.clone(),
            LimitSpec {
                per_process,
                window: Duration::from_secs(limit.window_s),
                policy: limit.policy,
            },
        );
    }

    specs
}

impl WindowLimiter {
    async fn acquire(&self, key: &str, max_wait: Duration) -> Result<Acquired, RateLimited> {
        let Some(spec) = self.specs.get(key) else {
            return Ok(Acquired::Immediate);
        };

        let started = Instant::now();
        let mut waited = false;

        loop {
            // The entry guard must drop before any await below.
            let until_reset = {
                let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| {
                    WindowSlot {
                        count: 0,
                        reset_at: Instant::now() + spec.window,
                    }
                });

                let now = Instant::now();
                if slot.reset_at <= now {
                    slot.count = 0;
                    slot.reset_at = now + spec.window;
                }

                if slot.count < spec.per_process {
                    slot.count += 1;
                    debug!(
                        target: "orchestrator::limiter",
                        key,
                        used = slot.count,
                        limit = spec.per_process,
                        "permit granted"
                    );
                    return Ok(if waited {
                        Acquired::AfterWait(started.elapsed())
                    } else {
                        Acquired::Immediate
                    });
                }

                slot.reset_at - now
            };

            match spec.policy {
                LimitPolicy::Reject => {
                    warn!(
                        target: "orchestrator::limiter",
                        key,
                        retry_in_ms = until_reset.as_millis() as u64,
                        "budget exhausted; rejecting"
                    );
                    return Err(RateLimited {
                        key: key.to_string(),
                        retry_in: until_reset,
                    });
                }
                LimitPolicy::Wait => {
                    if started.elapsed() + until_reset > max_wait {
                        warn!(
                            target: "orchestrator::limiter",
                            key,
                            retry_in_ms = until_reset.as_millis() as u64,
                            "window reset falls past max_wait; rejecting"
                        );
                        return Err(RateLimited {
                            key: key.to_string(),
                            retry_in: until_reset,
                        });
                    }
                    debug!(
                        target: "orchestrator::limiter",
                        key,
                        sleep_ms = until_reset.as_millis() as u64,
                        "budget exhausted; waiting for window reset"
                    );
                    waited = true;
                    tokio::time::sleep(until_reset).await;
                }
            }
        }
    }
}

#[cfg(feature = "rate-limiting")]
impl GovernorBackend {
    async fn acquire(&self, key: &str, max_wait: Duration) -> Result<Acquired, RateLimited> {
        let Some((quota, policy)) = self.quotas.get(key) else {
            return Ok(Acquired::Immediate);
        };

        let limiter = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| GovernorRateLimiter::direct(*quota));

        if limiter.check().is_ok() {
            return Ok(Acquired::Immediate);
        }

        match policy {
            LimitPolicy::Reject => Err(RateLimited {
                key: key.to_string(),
                retry_in: Duration::ZERO,
            }),
            LimitPolicy::Wait => {
                let started = Instant::now();
                match tokio::time::timeout(max_wait, limiter.until_ready()).await {
                    Ok(()) => Ok(Acquired::AfterWait(started.elapsed())),
                    Err(_) => Err(RateLimited {
                        key: key.to_string(),
                        retry_in: Duration::ZERO,
                    }),
                }
            }
        }
    }
}

/// Rate limit usage for one provider key.
#[derive(Debug)]
pub struct RateLimitInfo {
    /// Requests consumed in the current window.
    pub used: u32,
    /// Requests still available in the current window.
    pub remaining: u32,
    /// Seconds until the current window resets.
    pub reset_in_secs: u64,
}
