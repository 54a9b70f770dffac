//! Provider error taxonomy and classification.
//!
//! Every provider-specific failure is mapped onto one closed [`ErrorKind`]
//! with a fixed retryable flag. Raw provider error text never leaves this
//! module — a [`ProviderError`] carries only the kind, a stable message key,
//! and a hash digest of the raw payload for log correlation.

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Closed classification of provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider throttled the request; retry with backoff.
    RateLimit,
    /// The prompt or response tripped the provider's content policy.
    ContentFilter,
    /// The call exceeded its deadline.
    Timeout,
    /// The account's quota or balance is exhausted; operator action needed.
    QuotaExhausted,
    /// The provider returned a 5xx-class failure.
    ServerError,
    /// Anything that could not be classified. Treated as non-retryable.
    Unknown,
}

impl ErrorKind {
    /// Whether a failed attempt of this kind may be retried.
    ///
    /// Content-filter and quota failures never recover by retrying, and an
    /// unclassified error is assumed non-retryable (fail safe).
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::ServerError)
    }

    /// Stable message key forwarded to callers in place of raw provider text.
    pub fn message_key(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limited",
            Self::ContentFilter => "content_filtered",
            Self::Timeout => "timed_out",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ServerError => "provider_server_error",
            Self::Unknown => "provider_unknown_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RateLimit => "rate_limit",
            Self::ContentFilter => "content_filter",
            Self::Timeout => "timeout",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified provider failure.
///
/// The original error payload is reduced to a 16-hex-digit digest; callers
/// see the kind and message key only.
#[derive(Debug, Clone, Error, Serialize)]
#[error("provider {provider}: {kind} ({message_key}, digest {digest})")]
pub struct ProviderError {
    /// Classified failure kind.
    pub kind: ErrorKind,
    /// Provider that produced the failure.
    pub provider: String,
    /// Stable caller-facing message key for this kind.
    pub message_key: &'static str,
    /// Hash digest of the raw provider payload, for log correlation.
    pub digest: String,
}

impl ProviderError {
    /// Build a classified error, digesting (and discarding) the raw payload.
    pub fn new(kind: ErrorKind, provider: impl Into<String>, raw: &str) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message_key: kind.message_key(),
            digest: digest(raw),
        }
    }

    /// Whether this failure may be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Hash a raw payload into a stable 16-hex-digit digest.
fn digest(raw: &str) -> String {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// ── Classification ────────────────────────────────────────────────────────

/// Markers that distinguish an exhausted account from ordinary throttling.
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "insufficient",
    "exhausted",
    "arrearage",
    "balance",
];

/// Markers used by the providers' inspection layers for policy rejections.
const CONTENT_MARKERS: &[&str] = &[
    "content_filter",
    "data_inspection_failed",
    "inappropriate",
    "content management policy",
];

/// Classify an HTTP error response from a provider.
///
/// The body is scanned case-insensitively for quota and content-policy
/// markers because several providers overload 400/429 for both meanings.
pub fn classify_http(provider: &str, status: u16, body: &str) -> ProviderError {
    let lowered = body.to_lowercase();
    let kind = match status {
        429 => {
            if QUOTA_MARKERS.iter().any(|m| lowered.contains(m)) {
                ErrorKind::QuotaExhausted
            } else {
                ErrorKind::RateLimit
            }
        }
        402 => ErrorKind::QuotaExhausted,
        400 | 403 => {
            if CONTENT_MARKERS.iter().any(|m| lowered.contains(m)) {
                ErrorKind::ContentFilter
            } else if QUOTA_MARKERS.iter().any(|m| lowered.contains(m)) {
                ErrorKind::QuotaExhausted
            } else {
                ErrorKind::Unknown
            }
        }
        408 => ErrorKind::Timeout,
        s if (500..600).contains(&s) => ErrorKind::ServerError,
        _ => ErrorKind::Unknown,
    };

    tracing::debug!(
        target: "orchestrator::classify",
        provider = provider,
        status = status,
        kind = %kind,
        body_len = body.len(),
        "classified provider http error"
    );

    ProviderError::new(kind, provider, body)
}

/// Classify a transport-level failure from the HTTP client.
pub fn classify_transport(provider: &str, err: &reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        // Connection refused/reset reads as a server-side outage: retryable.
        ErrorKind::ServerError
    } else {
        ErrorKind::Unknown
    };

    ProviderError::new(kind, provider, &err.to_string())
}

/// Classify an elapsed per-call deadline.
pub fn classify_deadline(provider: &str, deadline_secs: u64) -> ProviderError {
    ProviderError::new(
        ErrorKind::Timeout,
        provider,
        &format!("deadline of {deadline_secs}s elapsed"),
    )
}
