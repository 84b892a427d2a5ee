//! Configuration for an orchestrator run.

use crate::cache::DEFAULT_MAX_PREVIEW_SIDE;
use crate::context::NegotiationSettings;

/// Default instructions teaching the model the command protocol.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You answer questions about scanned technical documents.

You are given the document text (or retrieved excerpts) and an image catalog
listing the page images available by id. You may inspect images before
answering.

To use a tool, reply with command lines:

- SHOW_IMAGES: id1, id2 — deliver the listed catalog images.
- ZOOM: id [x1, y1, x2, y2] | reason — crop a region of an image you have
  already been shown. Coordinates are normalized to 0-1 (pixel coordinates
  also work). Pick a tight region around the detail you need; requests
  covering the whole frame are rejected.
- REQUEST_DOCUMENTS: name1, name2 | reason — ask for documents that are not
  part of this run.

Image descriptions state whether you are looking at a scaled preview; zoom in
when fine detail might be lost. When you have enough information, reply with
the final answer as plain prose and no command lines.";

/// Configuration for a run. Construct with [`RunConfig::new`] and adjust
/// fields or chain builder methods for the settings callers routinely touch.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Model identifier (e.g. `"anthropic/claude-sonnet-4"`).
    pub model: String,
    /// Maximum orchestration steps before the run aborts.
    pub max_steps: u32,
    /// Maximum tokens per model response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// System instructions (includes the command protocol).
    pub system_prompt: String,
    /// Budget parameters for prompt negotiation.
    pub negotiation: NegotiationSettings,
    /// Longest side for base-image previews.
    pub max_preview_side: u32,
    /// Text chunks included in retrieval mode.
    pub text_top_k: usize,
    /// Image catalog candidates highlighted in retrieval mode.
    pub image_top_k: usize,
    /// Consecutive context-overflow renegotiations tolerated before the
    /// run aborts.
    pub max_overflow_retries: u32,
}

impl RunConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_steps: 10,
            max_tokens: 1024,
            temperature: 0.3,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            negotiation: NegotiationSettings::default(),
            max_preview_side: DEFAULT_MAX_PREVIEW_SIDE,
            text_top_k: 6,
            image_top_k: 4,
            max_overflow_retries: 3,
        }
    }

    /// Set the maximum number of orchestration steps.
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Override the system instructions.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Override the negotiation settings.
    pub fn with_negotiation(mut self, negotiation: NegotiationSettings) -> Self {
        self.negotiation = negotiation;
        self
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MODEL)
    }
}
