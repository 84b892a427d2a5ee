//! Events and handlers for the [`Orchestrator`](super::orchestrator::Orchestrator).
//!
//! The loop communicates with its caller through [`RunEvent`] variants
//! covering the run lifecycle — step starts, assistant prose, delivered
//! images and zoom crops, inline warnings, token usage, completion, and
//! errors. Callers implement [`EventHandler`] to drive a UI, collect
//! metrics, or log.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |

use crate::context::ContextMode;
use std::path::Path;
use tracing::{debug, info, warn};

/// Events emitted during a run.
#[derive(Debug)]
pub enum RunEvent<'a> {
    /// A new step is starting with the negotiated prompt shape.
    StepStart {
        step: u32,
        max_steps: u32,
        mode: ContextMode,
        history_len: usize,
    },
    /// Assistant prose intended for the user (cleaned of command lines).
    AssistantMessage(&'a str),
    /// A base image was delivered to the model.
    BaseImageDelivered {
        id: &'a str,
        description: &'a str,
        path: &'a Path,
    },
    /// A zoom crop was delivered to the model.
    ZoomDelivered {
        id: &'a str,
        region_px: [u32; 4],
        description: &'a str,
        path: &'a Path,
    },
    /// The model asked for documents outside this run.
    DocumentsRequested {
        names: &'a [String],
        reason: Option<&'a str>,
    },
    /// A recoverable problem, also surfaced to the model inline.
    Warning(&'a str),
    /// Token usage reported by the endpoint for one step.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// The run produced a final answer.
    Finished { steps_used: u32 },
    /// The run aborted with a descriptive error.
    Errored(&'a str),
}

/// Handler for run events.
///
/// All events are informational; implementations react with side effects
/// (UI updates, metrics, persistence) and return nothing.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &RunEvent<'_>) {
        let _ = event;
    }
}

/// A no-op event handler.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let RunEvent::AssistantMessage(text) = event {
///         println!("{text}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&RunEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&RunEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&RunEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent<'_>) {
        (self.0)(event)
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &RunEvent<'_>) {
        match event {
            RunEvent::StepStart {
                step,
                max_steps,
                mode,
                history_len,
            } => {
                info!("[step {step}/{max_steps}] mode={mode}, history={history_len}");
            }
            RunEvent::AssistantMessage(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "Assistant: {preview}{}",
                    if text.len() > 200 { "..." } else { "" }
                );
            }
            RunEvent::BaseImageDelivered {
                id, description, ..
            } => {
                info!("Delivered base image {id} ({description})");
            }
            RunEvent::ZoomDelivered {
                id,
                region_px,
                description,
                ..
            } => {
                info!(
                    "Delivered zoom of {id} [{},{},{},{}] ({description})",
                    region_px[0], region_px[1], region_px[2], region_px[3]
                );
            }
            RunEvent::DocumentsRequested { names, reason } => {
                info!(
                    "Model requested documents: {} (reason: {})",
                    names.join(", "),
                    reason.unwrap_or("none given")
                );
            }
            RunEvent::Warning(text) => {
                warn!("{text}");
            }
            RunEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            RunEvent::Finished { steps_used } => {
                info!("Run finished after {steps_used} step(s)");
            }
            RunEvent::Errored(message) => {
                warn!("Run errored: {message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fn_handler_receives_events() {
        let count = std::sync::Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handler = FnEventHandler::new(move |_event| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        handler.on_event(&RunEvent::Finished { steps_used: 2 });
        handler.on_event(&RunEvent::AssistantMessage("hello"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn noop_and_logging_handlers_accept_all_variants() {
        for handler in [&NoopHandler as &dyn EventHandler, &LoggingHandler] {
            handler.on_event(&RunEvent::StepStart {
                step: 1,
                max_steps: 10,
                mode: ContextMode::FullDocument,
                history_len: 12,
            });
            handler.on_event(&RunEvent::Warning("missing id"));
            handler.on_event(&RunEvent::TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            });
            handler.on_event(&RunEvent::Errored("step limit"));
        }
    }
}
