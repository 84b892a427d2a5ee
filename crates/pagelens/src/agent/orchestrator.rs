//! The top-level orchestration state machine.
//!
//! Each step negotiates a budget-fitting prompt, sends it to the model,
//! parses the response for tool calls, resolves them against the retrieval
//! index and the page cache, and appends the resolved artifacts as a new
//! turn. The loop ends with a final answer (`Done`), a cancellation, a hard
//! context overflow, or the step limit (`Aborted` — surfaced, never
//! swallowed).
//!
//! Guard policy enforced here, not in the cache: a zoom whose region covers
//! the whole frame (or carries no coordinates) is rejected with an inline
//! warning, and a zoom for an id the model has not yet seen first triggers a
//! base-image delivery so visual context precedes detail.

use super::config::RunConfig;
use super::events::{EventHandler, NoopHandler, RunEvent};
use super::run_context::RunContext;
use crate::api::retry::is_context_overflow_error;
use crate::cache::PageCache;
use crate::context::{
    self, ImageAttachment, NegotiationInputs, NegotiationSettings, Turn,
};
use crate::index::DocumentIndex;
use crate::protocol::{self, ToolCall};
use crate::store::{ObjectStore, PersistedTurn, TranscriptStore};
use crate::{ChatRequest, ModelEndpoint};
use std::path::Path;
use tracing::{debug, info, warn};

// ── States and outcomes ────────────────────────────────────────────

/// Loop states. `Done` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Negotiating,
    AwaitingModel,
    ResolvingTools,
    Done,
    Aborted,
}

/// The result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    /// The final answer, when the run reached `Done`.
    pub answer: Option<String>,
    /// Descriptive reason, when the run reached `Aborted`.
    pub abort_reason: Option<String>,
    pub steps_used: u32,
    pub total_prompt_tokens: u32,
    pub total_completion_tokens: u32,
}

#[derive(Default)]
struct UsageTotals {
    prompt: u32,
    completion: u32,
}

// ── Orchestrator ───────────────────────────────────────────────────

/// The orchestrator borrows its collaborators by reference; bind them to
/// `let` bindings before building it, and keep them alive across `.run()`.
pub struct Orchestrator<'a> {
    model: &'a dyn ModelEndpoint,
    index: &'a DocumentIndex,
    cache: &'a PageCache,
    store: &'a dyn TranscriptStore,
    objects: Option<&'a dyn ObjectStore>,
    config: RunConfig,
    events: &'a dyn EventHandler,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        model: &'a dyn ModelEndpoint,
        index: &'a DocumentIndex,
        cache: &'a PageCache,
        store: &'a dyn TranscriptStore,
        config: RunConfig,
    ) -> Self {
        Self {
            model,
            index,
            cache,
            store,
            objects: None,
            config,
            events: &NoopHandler,
        }
    }

    /// Attach an event handler.
    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.events = handler;
        self
    }

    /// Attach an object store for uploading produced images.
    pub fn with_object_store(mut self, objects: &'a dyn ObjectStore) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Run one query through to a final answer or an abort.
    ///
    /// `ctx` carries the per-run mutable state; reuse it across runs only to
    /// carry the rolling memory forward via
    /// [`RunContext::with_memory`](super::run_context::RunContext::with_memory).
    pub async fn run(&self, query: &str, ctx: &mut RunContext) -> Result<RunOutcome, String> {
        let mut totals = UsageTotals::default();

        if self.index.is_empty() {
            return Ok(self.abort(
                "empty document set at run start",
                ctx,
                &totals,
            ));
        }

        let catalog_listing = self.catalog_listing();
        let document_body = format!(
            "{}\n\n### Image catalog\n{}",
            self.index.body().trim(),
            catalog_listing
        );
        let retrieval_context = self.retrieval_context(query, &catalog_listing);

        let mut turns: Vec<Turn> = Vec::new();
        let opening = Turn::user(query);
        self.persist(&opening);
        turns.push(opening);

        let mut working_limit = self.config.negotiation.context_limit;
        let mut overflow_retries = 0u32;

        info!(
            "Run started: model={}, max_steps={}, {} image(s), {} chunk(s)",
            self.config.model,
            self.config.max_steps,
            self.index.images().len(),
            self.index.chunks().len()
        );

        while ctx.steps_used < self.config.max_steps {
            if ctx.cancel.is_cancelled() {
                return Ok(self.abort("cancelled by caller", ctx, &totals));
            }
            ctx.steps_used += 1;
            let step = ctx.steps_used;
            let mut state = RunState::Negotiating;
            debug!("Step {step}: {state:?}");

            let settings = NegotiationSettings {
                context_limit: working_limit,
                ..self.config.negotiation.clone()
            };
            let inputs = NegotiationInputs {
                system: &self.config.system_prompt,
                memory: ctx.memory.as_deref(),
                history: &turns,
                document_body: &document_body,
                retrieval_context: &retrieval_context,
            };

            let plan = match context::negotiate(&inputs, &settings) {
                Ok(plan) => plan,
                Err(e) => return Ok(self.abort(&e, ctx, &totals)),
            };
            self.events.on_event(&RunEvent::StepStart {
                step,
                max_steps: self.config.max_steps,
                mode: plan.mode,
                history_len: plan.history_len,
            });

            let messages = match context::build_messages(&inputs, &plan) {
                Ok(messages) => messages,
                Err(e) => {
                    let msg = format!("failed to assemble prompt: {e}");
                    self.events.on_event(&RunEvent::Errored(&msg));
                    return Err(msg);
                }
            };

            state = RunState::AwaitingModel;
            debug!("Step {step}: {state:?}");
            if ctx.cancel.is_cancelled() {
                return Ok(self.abort("cancelled by caller", ctx, &totals));
            }

            let request = ChatRequest {
                model: Some(self.config.model.clone()),
                messages,
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };
            let completion = match self.model.complete(&request).await {
                Ok(completion) => completion,
                Err(e) if is_context_overflow_error(&e) => {
                    overflow_retries += 1;
                    if overflow_retries > self.config.max_overflow_retries {
                        return Ok(self.abort(
                            &format!("context overflow persisted after renegotiation: {e}"),
                            ctx,
                            &totals,
                        ));
                    }
                    // The endpoint disagrees with our estimate; shrink the
                    // working window and renegotiate without burning a step.
                    working_limit = working_limit * 4 / 5;
                    self.events.on_event(&RunEvent::Warning(&format!(
                        "model reported context overflow; renegotiating with a {working_limit}-token window"
                    )));
                    ctx.steps_used -= 1;
                    continue;
                }
                Err(e) => {
                    return Ok(self.abort(&format!("model call failed: {e}"), ctx, &totals));
                }
            };
            overflow_retries = 0;

            if let Some(ref usage) = completion.usage {
                let prompt_tokens = usage.prompt_tokens.unwrap_or(0);
                let completion_tokens = usage.completion_tokens.unwrap_or(0);
                totals.prompt += prompt_tokens;
                totals.completion += completion_tokens;
                self.events.on_event(&RunEvent::TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                });
            }

            let raw = completion.content.unwrap_or_default();
            if raw.trim().is_empty() {
                self.events
                    .on_event(&RunEvent::Warning("model returned an empty response"));
                let nudge = Turn::user(
                    "(The previous response was empty. Request images with SHOW_IMAGES, \
                     zoom with ZOOM, or give the final answer.)",
                );
                self.persist(&nudge);
                turns.push(nudge);
                continue;
            }

            state = RunState::ResolvingTools;
            debug!("Step {step}: {state:?}");
            let parsed = protocol::parse(&raw);

            if parsed.is_final() {
                let answer = parsed.visible_text;
                let assistant = Turn::assistant(answer.clone());
                self.persist(&assistant);
                turns.push(assistant);
                ctx.memory.absorb(query, &answer);
                self.events.on_event(&RunEvent::AssistantMessage(&answer));
                self.events.on_event(&RunEvent::Finished {
                    steps_used: ctx.steps_used,
                });
                return Ok(RunOutcome {
                    state: RunState::Done,
                    answer: Some(answer),
                    abort_reason: None,
                    steps_used: ctx.steps_used,
                    total_prompt_tokens: totals.prompt,
                    total_completion_tokens: totals.completion,
                });
            }

            // Tool-call step: surface any leading prose, record the
            // assistant turn, then resolve.
            if !parsed.visible_text.is_empty() {
                self.events
                    .on_event(&RunEvent::AssistantMessage(&parsed.visible_text));
            }
            let note = action_note(&parsed.calls);
            let assistant = Turn::assistant(if parsed.visible_text.is_empty() {
                note.clone()
            } else {
                format!("{}\n\n{note}", parsed.visible_text)
            });
            self.persist(&assistant);
            turns.push(assistant);

            let (result_turn, cancelled) = match parsed.calls.first() {
                Some(ToolCall::RequestDocuments { names, reason }) => {
                    self.events.on_event(&RunEvent::DocumentsRequested {
                        names,
                        reason: reason.as_deref(),
                    });
                    let turn = Turn::user(format!(
                        "The requested documents ({}) are not available in this run. \
                         Continue with the document and images already provided.",
                        names.join(", ")
                    ));
                    (turn, false)
                }
                Some(ToolCall::RequestImages { ids }) => self.resolve_images(ids, ctx).await,
                Some(ToolCall::Zoom { .. }) => self.resolve_zooms(&parsed.calls, ctx).await,
                Some(ToolCall::FinalAnswer { .. }) | None => {
                    unreachable!("final answers return above; the parser never yields no calls")
                }
            };

            self.persist(&result_turn);
            turns.push(result_turn);
            if cancelled {
                return Ok(self.abort("cancelled by caller", ctx, &totals));
            }
        }

        Ok(self.abort(
            &format!(
                "step limit of {} exceeded without a final answer",
                self.config.max_steps
            ),
            ctx,
            &totals,
        ))
    }

    // ── Tool resolution ────────────────────────────────────────────

    /// Fetch and attach the base images for the requested ids. Missing ids
    /// become inline warnings, never aborts. Returns the result turn and
    /// whether cancellation interrupted resolution.
    async fn resolve_images(&self, ids: &[String], ctx: &mut RunContext) -> (Turn, bool) {
        let mut lines = vec!["Requested images:".to_string()];
        let mut attachments: Vec<ImageAttachment> = Vec::new();
        let mut cancelled = false;

        for id in ids {
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match self.deliver_base(id, ctx).await {
                Ok((line, attachment)) => {
                    lines.push(line);
                    attachments.push(attachment);
                }
                Err(warning) => self.warn_inline(&warning, &mut lines),
            }
        }

        (Turn::user_with_images(lines.join("\n"), attachments), cancelled)
    }

    /// Resolve zoom requests in order of appearance, each independently.
    async fn resolve_zooms(&self, calls: &[ToolCall], ctx: &mut RunContext) -> (Turn, bool) {
        let mut lines = vec!["Zoom results:".to_string()];
        let mut attachments: Vec<ImageAttachment> = Vec::new();
        let mut cancelled = false;

        for call in calls {
            let ToolCall::Zoom {
                image_id,
                region,
                reason,
            } = call
            else {
                continue;
            };
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // Visual context precedes detail: an id the model has not seen
            // yet gets its base image delivered first.
            if !ctx.sent_images.contains(image_id) {
                match self.deliver_base(image_id, ctx).await {
                    Ok((line, attachment)) => {
                        lines.push(line);
                        attachments.push(attachment);
                    }
                    Err(warning) => {
                        self.warn_inline(&warning, &mut lines);
                        continue;
                    }
                }
            }

            let Some(region) = region else {
                self.warn_inline(
                    &format!(
                        "zoom for '{image_id}' carried no usable coordinates; \
                         supply [x1, y1, x2, y2]"
                    ),
                    &mut lines,
                );
                continue;
            };

            let Some(entry) = self.cache.entry(image_id) else {
                self.warn_inline(
                    &format!("zoom for '{image_id}' has no cached base image"),
                    &mut lines,
                );
                continue;
            };
            if region.is_full_frame(entry.width, entry.height) {
                self.warn_inline(
                    &format!(
                        "zoom for '{image_id}' covers the whole image; the base image is \
                         already shown — request a tighter region"
                    ),
                    &mut lines,
                );
                continue;
            }

            match self.cache.zoom(image_id, *region) {
                Ok(crop) => {
                    self.events.on_event(&RunEvent::ZoomDelivered {
                        id: image_id,
                        region_px: crop.region_px,
                        description: &crop.description,
                        path: &crop.path,
                    });
                    self.upload_artifact(&crop.path);
                    let reason_suffix = reason
                        .as_deref()
                        .map(|r| format!(" — {r}"))
                        .unwrap_or_default();
                    lines.push(format!(
                        "- zoom of {image_id} [{},{},{},{}]: {}{reason_suffix}",
                        crop.region_px[0],
                        crop.region_px[1],
                        crop.region_px[2],
                        crop.region_px[3],
                        crop.description
                    ));
                    attachments.push(ImageAttachment {
                        id: image_id.clone(),
                        path: crop.path,
                        note: crop.description,
                    });
                }
                Err(e) => self.warn_inline(&format!("zoom of '{image_id}' failed: {e}"), &mut lines),
            }
        }

        (Turn::user_with_images(lines.join("\n"), attachments), cancelled)
    }

    /// Fetch one base image, record it as sent, and emit the delivery event.
    /// Returns the result line and attachment, or a warning message.
    async fn deliver_base(
        &self,
        id: &str,
        ctx: &mut RunContext,
    ) -> Result<(String, ImageAttachment), String> {
        let entry = self
            .index
            .image(id)
            .ok_or_else(|| format!("image id '{id}' is not in the catalog"))?;
        let base = self
            .cache
            .fetch_base(id, &entry.source_locator, self.config.max_preview_side)
            .await
            .map_err(|e| format!("image '{id}' could not be fetched: {e}"))?;

        ctx.sent_images.insert(id.to_string());
        self.events.on_event(&RunEvent::BaseImageDelivered {
            id,
            description: &base.description,
            path: &base.path,
        });
        self.upload_artifact(&base.path);

        let page = entry
            .page
            .map(|p| format!(" (page {p})"))
            .unwrap_or_default();
        let line = format!("- {id}{page}: {} [{}]", entry.summary, base.description);
        let attachment = ImageAttachment {
            id: id.to_string(),
            path: base.path,
            note: base.description,
        };
        Ok((line, attachment))
    }

    // ── Context assembly ───────────────────────────────────────────

    fn catalog_listing(&self) -> String {
        if self.index.images().is_empty() {
            return "(no page images catalogued)".to_string();
        }
        self.index
            .images()
            .iter()
            .map(|entry| entry.listing_line())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The always-included block for retrieval mode: the full image catalog
    /// plus the best-scoring chunks and image candidates for this query.
    fn retrieval_context(&self, query: &str, catalog_listing: &str) -> String {
        let mut out = format!("### Image catalog\n{catalog_listing}\n");

        let candidates = self
            .index
            .retrieve_image_candidates(query, self.config.image_top_k);
        if !candidates.is_empty() {
            out.push_str("\n### Most relevant images\n");
            for entry in candidates {
                out.push_str(&entry.listing_line());
                out.push('\n');
            }
        }

        let chunks = self
            .index
            .retrieve_text_chunks(query, self.config.text_top_k);
        if !chunks.is_empty() {
            out.push_str("\n### Passages\n");
            for chunk in chunks {
                out.push_str(&format!("[{}] {}\n\n", chunk.id, chunk.text));
            }
        }

        out
    }

    // ── Plumbing ───────────────────────────────────────────────────

    /// Emit a warning event and mirror it into the model-visible result.
    fn warn_inline(&self, warning: &str, lines: &mut Vec<String>) {
        self.events.on_event(&RunEvent::Warning(warning));
        lines.push(format!("- warning: {warning}"));
    }

    /// Persist a turn; failures are logged and never block the loop.
    fn persist(&self, turn: &Turn) {
        if let Err(e) = self.store.persist_turn(&PersistedTurn::from_turn(turn)) {
            warn!("Transcript persistence failed: {e}. Continuing.");
        }
    }

    /// Upload a produced image when an object store is attached; display
    /// plumbing only, failures are logged.
    fn upload_artifact(&self, path: &Path) {
        if let Some(objects) = self.objects {
            match objects.upload(path) {
                Ok(stored) => debug!("Uploaded {} -> {}", path.display(), stored.url),
                Err(e) => warn!("Object upload failed for {}: {e}", path.display()),
            }
        }
    }

    /// Emit the terminal error event and build an `Aborted` outcome.
    fn abort(&self, reason: &str, ctx: &RunContext, totals: &UsageTotals) -> RunOutcome {
        let message = format!("run aborted: {reason}");
        self.events.on_event(&RunEvent::Errored(&message));
        RunOutcome {
            state: RunState::Aborted,
            answer: None,
            abort_reason: Some(message),
            steps_used: ctx.steps_used,
            total_prompt_tokens: totals.prompt,
            total_completion_tokens: totals.completion,
        }
    }
}

/// A compact record of the actions the assistant took, kept in its history
/// turn so the model remembers what it already asked for.
fn action_note(calls: &[ToolCall]) -> String {
    match calls.first() {
        Some(ToolCall::RequestImages { ids }) => {
            format!("[requested images: {}]", ids.join(", "))
        }
        Some(ToolCall::RequestDocuments { names, .. }) => {
            format!("[requested documents: {}]", names.join(", "))
        }
        Some(ToolCall::Zoom { .. }) => {
            let described: Vec<String> = calls
                .iter()
                .filter_map(|call| match call {
                    ToolCall::Zoom {
                        image_id, region, ..
                    } => Some(match region {
                        Some(r) => format!("{image_id} {r:?}"),
                        None => format!("{image_id} (no coordinates)"),
                    }),
                    _ => None,
                })
                .collect();
            format!("[requested zooms: {}]", described.join("; "))
        }
        Some(ToolCall::FinalAnswer { .. }) | None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ZoomRegion;

    #[test]
    fn action_note_formats_each_kind() {
        let note = action_note(&[ToolCall::RequestImages {
            ids: vec!["img_1".into(), "img_2".into()],
        }]);
        assert_eq!(note, "[requested images: img_1, img_2]");

        let note = action_note(&[ToolCall::RequestDocuments {
            names: vec!["schedule".into()],
            reason: None,
        }]);
        assert_eq!(note, "[requested documents: schedule]");

        let note = action_note(&[
            ToolCall::Zoom {
                image_id: "img_1".into(),
                region: Some(ZoomRegion::Normalized([0.1, 0.1, 0.5, 0.5])),
                reason: None,
            },
            ToolCall::Zoom {
                image_id: "img_2".into(),
                region: None,
                reason: None,
            },
        ]);
        assert!(note.starts_with("[requested zooms: img_1"));
        assert!(note.contains("img_2 (no coordinates)"));
    }

    #[test]
    fn run_states_have_two_terminals() {
        assert_ne!(RunState::Done, RunState::Aborted);
        assert_eq!(RunState::Negotiating, RunState::Negotiating);
    }
}
