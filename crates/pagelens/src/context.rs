//! Context-budget negotiation: fit a growing conversation into a finite
//! token budget, deterministically.
//!
//! The negotiator assembles a candidate conversation — system instructions,
//! optional rolling memory, retrieved context, and the most recent `N` turns
//! of history — estimates its token cost, and shrinks `N` in fixed steps
//! until the estimate fits the model's context limit minus reserves. When
//! full-document mode cannot fit even with zero history, it falls back to
//! retrieval mode and restarts the shrink loop; retrieval mode with zero
//! history that still overflows is the hard context-overflow condition.
//!
//! Token estimation is `chars / 3.5` (a conservative chars-per-token ratio
//! for English text) plus a flat per-image cost. The estimator is part of the
//! observable contract: it alone determines shrink-loop behavior.

use crate::{Message, MessageRole, encode_image_data_url};
use std::path::PathBuf;
use tracing::debug;

/// Characters per token used by the estimator. Most tokenizers average
/// 3-4 chars per token; 3.5 is a middle ground.
pub const CHARS_PER_TOKEN: f64 = 3.5;

/// Flat token cost charged per inline image attachment.
pub const IMAGE_TOKEN_COST: usize = 1100;

/// Default number of recent turns included before shrinking.
pub const DEFAULT_HISTORY_TURNS: usize = 12;

/// Fixed step by which the history length shrinks per attempt.
pub const HISTORY_SHRINK_STEP: usize = 3;

// ── Conversation state ─────────────────────────────────────────────

/// An image delivered during the conversation, referenced by its cached file.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub id: String,
    pub path: PathBuf,
    /// The size-relationship description shown alongside the image.
    pub note: String,
}

/// One role-tagged turn of the conversation. The turn list is append-only;
/// the negotiator rebuilds the API message sequence from it on every attempt.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: MessageRole,
    pub text: String,
    pub images: Vec<ImageAttachment>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<ImageAttachment>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            images,
        }
    }
}

// ── Negotiation ────────────────────────────────────────────────────

/// Operating mode for the always-included context block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// The full stripped document text rides along in every prompt.
    FullDocument,
    /// Only retrieved snippets ride along (smaller, lossier).
    Retrieval,
}

impl std::fmt::Display for ContextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextMode::FullDocument => write!(f, "full-document"),
            ContextMode::Retrieval => write!(f, "retrieval"),
        }
    }
}

/// Budget parameters for negotiation.
#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    /// Model context window in tokens.
    pub context_limit: usize,
    /// Tokens reserved for the model's response.
    pub output_reserve: usize,
    /// Safety margin against estimator error.
    pub safety_margin: usize,
    /// History length the shrink loop starts from.
    pub default_history: usize,
    /// Step by which the history length decreases.
    pub shrink_step: usize,
    /// Mode the negotiation starts in.
    pub start_mode: ContextMode,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            context_limit: 200_000,
            output_reserve: 4096,
            safety_margin: 2048,
            default_history: DEFAULT_HISTORY_TURNS,
            shrink_step: HISTORY_SHRINK_STEP,
            start_mode: ContextMode::FullDocument,
        }
    }
}

/// Everything the negotiator assembles a prompt from. The caller prepares
/// both context blocks up front; the accepted mode picks one.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationInputs<'a> {
    pub system: &'a str,
    pub memory: Option<&'a str>,
    pub history: &'a [Turn],
    /// Context block for full-document mode.
    pub document_body: &'a str,
    /// Context block for retrieval mode.
    pub retrieval_context: &'a str,
}

/// One probe of the shrink loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationAttempt {
    pub mode: ContextMode,
    pub history_len: usize,
    pub estimated_tokens: usize,
    pub fits: bool,
}

/// The accepted prompt shape. Repeated negotiation over the same inputs
/// always converges to the same `(mode, history_len)` pair.
#[derive(Debug, Clone)]
pub struct PromptPlan {
    pub mode: ContextMode,
    pub history_len: usize,
    pub estimated_tokens: usize,
    /// Probe trace, in order, ending with the accepted attempt.
    pub attempts: Vec<NegotiationAttempt>,
}

/// Shrink the candidate conversation until it fits the budget.
///
/// Returns an error only for the hard context-overflow condition: retrieval
/// mode with zero history still exceeding the budget.
pub fn negotiate(
    inputs: &NegotiationInputs<'_>,
    settings: &NegotiationSettings,
) -> Result<PromptPlan, String> {
    let budget = settings
        .context_limit
        .saturating_sub(settings.output_reserve)
        .saturating_sub(settings.safety_margin);

    let modes: &[ContextMode] = match settings.start_mode {
        ContextMode::FullDocument => &[ContextMode::FullDocument, ContextMode::Retrieval],
        ContextMode::Retrieval => &[ContextMode::Retrieval],
    };

    let mut attempts = Vec::new();
    for &mode in modes {
        let mut n = settings.default_history;
        loop {
            let estimated = estimate_tokens(inputs, mode, n);
            let fits = estimated <= budget;
            attempts.push(NegotiationAttempt {
                mode,
                history_len: n,
                estimated_tokens: estimated,
                fits,
            });
            debug!("Negotiation probe: mode={mode}, history={n}, est={estimated}, budget={budget}");
            if fits {
                return Ok(PromptPlan {
                    mode,
                    history_len: n,
                    estimated_tokens: estimated,
                    attempts,
                });
            }
            if n == 0 {
                break;
            }
            n = n.saturating_sub(settings.shrink_step);
        }
    }

    Err(format!(
        "hard context overflow: even {} mode with no history needs ~{} tokens against a budget of {budget}",
        ContextMode::Retrieval,
        attempts.last().map_or(0, |a| a.estimated_tokens),
    ))
}

/// Estimate the token cost of the candidate conversation at a given mode and
/// history length.
fn estimate_tokens(inputs: &NegotiationInputs<'_>, mode: ContextMode, history_len: usize) -> usize {
    let mut chars = inputs.system.len();
    if let Some(memory) = inputs.memory {
        chars += memory.len();
    }
    chars += match mode {
        ContextMode::FullDocument => inputs.document_body.len(),
        ContextMode::Retrieval => inputs.retrieval_context.len(),
    };

    let mut images = 0usize;
    for turn in history_tail(inputs.history, history_len) {
        chars += turn.text.len();
        images += turn.images.len();
    }

    (chars as f64 / CHARS_PER_TOKEN) as usize + images * IMAGE_TOKEN_COST
}

/// The last `n` turns of history.
fn history_tail(history: &[Turn], n: usize) -> &[Turn] {
    let start = history.len().saturating_sub(n);
    history.get(start..).unwrap_or(&[])
}

/// Assemble the API message sequence for an accepted plan, inlining image
/// attachments as base64 data URLs.
pub fn build_messages(
    inputs: &NegotiationInputs<'_>,
    plan: &PromptPlan,
) -> Result<Vec<Message>, String> {
    let mut system_text = inputs.system.to_string();
    if let Some(memory) = inputs.memory {
        system_text.push_str("\n\n## Session memory\n\n");
        system_text.push_str(memory);
    }

    let mut messages = vec![Message::system(system_text)];

    let context_block = match plan.mode {
        ContextMode::FullDocument => format!("## Document\n\n{}", inputs.document_body),
        ContextMode::Retrieval => format!("## Retrieved context\n\n{}", inputs.retrieval_context),
    };
    messages.push(Message::user(context_block));

    for turn in history_tail(inputs.history, plan.history_len) {
        if turn.images.is_empty() {
            messages.push(match turn.role {
                MessageRole::Assistant => Message::assistant(turn.text.clone()),
                _ => Message::user(turn.text.clone()),
            });
        } else {
            let urls: Vec<String> = turn
                .images
                .iter()
                .map(|img| encode_image_data_url(&img.path))
                .collect::<Result<_, _>>()?;
            messages.push(Message::user_with_images(turn.text.clone(), urls));
        }
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(limit: usize) -> NegotiationSettings {
        NegotiationSettings {
            context_limit: limit,
            output_reserve: 0,
            safety_margin: 0,
            ..Default::default()
        }
    }

    fn turns(n: usize, chars_each: usize) -> Vec<Turn> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user("u".repeat(chars_each))
                } else {
                    Turn::assistant("a".repeat(chars_each))
                }
            })
            .collect()
    }

    #[test]
    fn everything_fits_at_default_history() {
        let history = turns(20, 10);
        let inputs = NegotiationInputs {
            system: "system",
            memory: None,
            history: &history,
            document_body: "short document",
            retrieval_context: "snippet",
        };
        let plan = negotiate(&inputs, &settings(100_000)).unwrap();
        assert_eq!(plan.mode, ContextMode::FullDocument);
        assert_eq!(plan.history_len, DEFAULT_HISTORY_TURNS);
        assert_eq!(plan.attempts.len(), 1);
    }

    #[test]
    fn history_shrinks_in_steps_of_three() {
        // Each turn is ~1000 tokens; the budget only admits a few.
        let history = turns(20, 3500);
        let inputs = NegotiationInputs {
            system: "system",
            memory: None,
            history: &history,
            document_body: "doc",
            retrieval_context: "snippet",
        };
        let plan = negotiate(&inputs, &settings(7_000)).unwrap();
        assert_eq!(plan.mode, ContextMode::FullDocument);
        assert_eq!(plan.history_len, 6);
        let probed: Vec<usize> = plan.attempts.iter().map(|a| a.history_len).collect();
        assert_eq!(probed, vec![12, 9, 6]);
    }

    #[test]
    fn full_document_falls_back_to_retrieval_and_restarts() {
        // The document body alone blows the budget, so no history length in
        // full-document mode can fit; retrieval fits immediately at the
        // default history length.
        let history = turns(14, 10);
        let body = "d".repeat(400_000);
        let inputs = NegotiationInputs {
            system: "system",
            memory: None,
            history: &history,
            document_body: &body,
            retrieval_context: "small snippet",
        };
        let plan = negotiate(&inputs, &settings(50_000)).unwrap();
        assert_eq!(plan.mode, ContextMode::Retrieval);
        assert_eq!(plan.history_len, DEFAULT_HISTORY_TURNS);

        let probed: Vec<(ContextMode, usize)> = plan
            .attempts
            .iter()
            .map(|a| (a.mode, a.history_len))
            .collect();
        assert_eq!(
            probed,
            vec![
                (ContextMode::FullDocument, 12),
                (ContextMode::FullDocument, 9),
                (ContextMode::FullDocument, 6),
                (ContextMode::FullDocument, 3),
                (ContextMode::FullDocument, 0),
                (ContextMode::Retrieval, 12),
            ]
        );
    }

    #[test]
    fn hard_overflow_when_retrieval_cannot_fit() {
        let history = turns(4, 10);
        let body = "d".repeat(400_000);
        let snippets = "s".repeat(400_000);
        let inputs = NegotiationInputs {
            system: "system",
            memory: None,
            history: &history,
            document_body: &body,
            retrieval_context: &snippets,
        };
        let err = negotiate(&inputs, &settings(10_000)).unwrap_err();
        assert!(err.contains("hard context overflow"));
    }

    #[test]
    fn negotiation_is_deterministic() {
        let history = turns(20, 3500);
        let inputs = NegotiationInputs {
            system: "system",
            memory: Some("memory"),
            history: &history,
            document_body: "doc",
            retrieval_context: "snippet",
        };
        let a = negotiate(&inputs, &settings(7_000)).unwrap();
        let b = negotiate(&inputs, &settings(7_000)).unwrap();
        assert_eq!((a.mode, a.history_len), (b.mode, b.history_len));
        assert_eq!(a.attempts, b.attempts);
    }

    #[test]
    fn images_charge_a_flat_token_cost() {
        let with_image = vec![Turn::user_with_images(
            "look",
            vec![ImageAttachment {
                id: "img_1".into(),
                path: PathBuf::from("/tmp/none.png"),
                note: "full resolution".into(),
            }],
        )];
        let without_image = vec![Turn::user("look")];
        let base = NegotiationInputs {
            system: "s",
            memory: None,
            history: &without_image,
            document_body: "",
            retrieval_context: "",
        };
        let with = NegotiationInputs {
            history: &with_image,
            ..base
        };
        let plain = estimate_tokens(&base, ContextMode::FullDocument, 12);
        let imaged = estimate_tokens(&with, ContextMode::FullDocument, 12);
        assert_eq!(imaged, plain + IMAGE_TOKEN_COST);
    }

    #[test]
    fn retrieval_start_mode_never_probes_full_document() {
        let history = turns(4, 10);
        let inputs = NegotiationInputs {
            system: "system",
            memory: None,
            history: &history,
            document_body: "irrelevant",
            retrieval_context: "snippet",
        };
        let s = NegotiationSettings {
            start_mode: ContextMode::Retrieval,
            ..settings(100_000)
        };
        let plan = negotiate(&inputs, &s).unwrap();
        assert_eq!(plan.mode, ContextMode::Retrieval);
        assert!(plan.attempts.iter().all(|a| a.mode == ContextMode::Retrieval));
    }

    #[test]
    fn build_messages_orders_system_context_history() {
        let history = vec![
            Turn::user("what is the riser size?"),
            Turn::assistant("Let me check."),
        ];
        let inputs = NegotiationInputs {
            system: "You answer questions about documents.",
            memory: Some("Previously discussed page 3."),
            history: &history,
            document_body: "body text",
            retrieval_context: "snippets",
        };
        let plan = negotiate(&inputs, &settings(100_000)).unwrap();
        let messages = build_messages(&inputs, &plan).unwrap();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[0].content.text_len(), {
            let sys = "You answer questions about documents.\n\n## Session memory\n\nPreviously discussed page 3.";
            sys.len()
        });
        assert_eq!(messages[1].role, MessageRole::User);
        assert_eq!(messages[3].role, MessageRole::Assistant);
    }

    #[test]
    fn build_messages_respects_history_cut() {
        let history = turns(20, 10);
        let inputs = NegotiationInputs {
            system: "s",
            memory: None,
            history: &history,
            document_body: "doc",
            retrieval_context: "snip",
        };
        let plan = negotiate(&inputs, &settings(100_000)).unwrap();
        let messages = build_messages(&inputs, &plan).unwrap();
        // system + context + 12-turn tail.
        assert_eq!(messages.len(), 2 + DEFAULT_HISTORY_TURNS);
    }
}
