//! Per-run mutable state, made explicit.
//!
//! Everything that varies over one run — the sent-image set, the step
//! counter, the cancellation flag, the rolling memory — lives in one
//! [`RunContext`] value passed through every call. Nothing run-scoped hangs
//! off a long-lived object, so cancellation and step limits are testable in
//! isolation and runs cannot alias each other's state.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ── Cancellation ───────────────────────────────────────────────────

/// Cooperative cancellation flag, cloneable across threads.
///
/// The orchestrator polls the token at the top of each step and before every
/// blocking call. Once observed, no further blocking calls are issued;
/// already-persisted partial results are retained, never rolled back.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Rolling memory ─────────────────────────────────────────────────

/// Maximum characters taken from each side of a Q/A pair when absorbing.
const ABSORB_SNIPPET_CHARS: usize = 280;

/// A bounded rolling summary of past question/answer exchanges, injected
/// into the system message of later steps and runs.
#[derive(Debug, Clone)]
pub struct RollingMemory {
    summary: String,
    max_chars: usize,
}

impl RollingMemory {
    pub fn new(max_chars: usize) -> Self {
        Self {
            summary: String::new(),
            max_chars,
        }
    }

    /// The current summary, or `None` while empty.
    pub fn as_deref(&self) -> Option<&str> {
        if self.summary.is_empty() {
            None
        } else {
            Some(&self.summary)
        }
    }

    /// Fold a completed exchange into the summary, trimming the oldest
    /// content once the character bound is exceeded.
    pub fn absorb(&mut self, question: &str, answer: &str) {
        if !self.summary.is_empty() {
            self.summary.push('\n');
        }
        self.summary.push_str(&format!(
            "Q: {}\nA: {}",
            condense(question),
            condense(answer)
        ));

        while self.summary.len() > self.max_chars {
            if let Some(idx) = self.summary.find('\n') {
                self.summary.drain(..=idx);
            } else {
                self.summary.clear();
            }
        }
    }
}

/// Collapse whitespace and truncate at a char boundary.
fn condense(text: &str) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= ABSORB_SNIPPET_CHARS {
        collapsed
    } else {
        let truncated: String = collapsed.chars().take(ABSORB_SNIPPET_CHARS).collect();
        format!("{truncated}…")
    }
}

// ── Run context ────────────────────────────────────────────────────

/// Explicit per-run state threaded through the orchestrator loop.
#[derive(Debug)]
pub struct RunContext {
    /// Image ids already shown to the model in this run. Grows
    /// monotonically; gates whether a zoom may be honored directly.
    pub sent_images: HashSet<String>,
    /// Steps consumed so far.
    pub steps_used: u32,
    /// Cooperative cancellation flag shared with the caller.
    pub cancel: CancelToken,
    /// Rolling memory carried across runs.
    pub memory: RollingMemory,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            sent_images: HashSet::new(),
            steps_used: 0,
            cancel: CancelToken::new(),
            memory: RollingMemory::new(2000),
        }
    }

    /// Use an externally shared cancellation token (e.g. wired to a UI
    /// stop button).
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Carry memory over from a previous run.
    pub fn with_memory(mut self, memory: RollingMemory) -> Self {
        self.memory = memory;
        self
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
