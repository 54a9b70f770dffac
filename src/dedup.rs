//! # Candidate Extraction and Deduplication
//!
//! ## Responsibility
//! Turn raw streamed model output into candidate units: assemble deltas into
//! complete lines, strip list markers, reject degenerate lines, and suppress
//! duplicates on a normalized key.
//!
//! ## Guarantees
//! - Normalization is stable: equal inputs always produce equal keys
//! - `DedupSet` is first-wins; a key admitted once is never admitted again,
//!   including keys seeded from earlier batches
//! - Line assembly never drops text: every character of every delta ends up
//!   in a returned line or in the final leftover
//!
//! ## NOT Responsible For
//! - Fuzzy or semantic similarity matching
//! - Deciding when a batch starts or ends (that belongs to the aggregator)

use std::collections::HashSet;

// ── Normalization ────────────────────────────────────────────────────────

/// Compute the dedup key for a candidate text.
///
/// Trims, lowercases (full Unicode), and collapses every internal whitespace
/// run to a single space. CJK text passes through unchanged apart from
/// whitespace handling.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Strip the leading list marker from a line.
///
/// Models return candidates as numbered or bulleted lists in both ASCII and
/// CJK punctuation (`1.`, `-`, `3、`, `）`, `12)`). The marker alphabet is
/// digits plus `.`, `-`, `、`, `）`, `)`, and space; stripping is greedy, so
/// a line starting with bare digits loses them too.
pub fn strip_list_prefix(line: &str) -> &str {
    line.trim_start_matches(|c: char| {
        c.is_ascii_digit() || matches!(c, '.' | '-' | '、' | '）' | ')' | ' ')
    })
    .trim()
}

/// Clean one raw line into candidate text.
///
/// Returns `None` for lines that are empty or shorter than two characters
/// after the list marker is removed.
pub fn clean_line(line: &str) -> Option<&str> {
    let text = strip_list_prefix(line.trim());
    if text.chars().count() < 2 {
        return None;
    }
    Some(text)
}

// ── Dedup set ────────────────────────────────────────────────────────────

/// First-wins set of normalized candidate keys.
///
/// One instance is owned by the aggregation run for a single batch, seeded
/// with the keys of every candidate the stage has already produced, and
/// handed back when the batch ends.
#[derive(Debug, Default, Clone)]
pub struct DedupSet {
    seen: HashSet<String>,
}

impl DedupSet {
    /// Empty set for the first batch of a stage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pre-populated with keys from earlier batches of the same stage.
    pub fn seeded<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            seen: keys.into_iter().collect(),
        }
    }

    /// Admit a candidate text, returning its dedup key if it is the first
    /// occurrence. Duplicates (same key from any model) return `None`.
    pub fn admit(&mut self, text: &str) -> Option<String> {
        let key = normalize(text);
        if self.seen.insert(key.clone()) {
            Some(key)
        } else {
            None
        }
    }

    /// Number of distinct keys seen so far, seeds included.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when no key has been admitted or seeded.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ── Line assembly ────────────────────────────────────────────────────────

/// Accumulates stream deltas and emits complete lines.
///
/// Deltas arrive at arbitrary boundaries; a candidate line may span several
/// deltas or one delta may carry several lines. The unterminated tail stays
/// buffered until the next newline or [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct LineAssembler {
    tail: String,
}

impl LineAssembler {
    /// Fresh assembler with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return every newly completed line, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.tail.push_str(delta);
        if !self.tail.contains('\n') {
            return Vec::new();
        }
        let mut lines: Vec<String> = self.tail.split('\n').map(str::to_string).collect();
        // The final element is the unterminated remainder, possibly empty.
        let remainder = lines.pop().unwrap_or_default();
        self.tail = remainder;
        lines
    }

    /// Flush the buffered tail when the stream ends.
    ///
    /// A model's last candidate often arrives without a trailing newline;
    /// it is returned here. Whitespace-only leftovers are dropped.
    pub fn finish(self) -> Option<String> {
        if self.tail.trim().is_empty() {
            None
        } else {
            Some(self.tail)
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
