//! Convenience re-exports for common `pagelens` types.
//!
//! Meant to be glob-imported when embedding the orchestrator:
//!
//! ```ignore
//! use pagelens::prelude::*;
//! ```
//!
//! This pulls in the types needed for the vast majority of callers: the
//! [`ModelClient`], the [`Orchestrator`] + config + run context, the
//! [`DocumentIndex`], the [`PageCache`] with its fetcher seam, event
//! handlers, and the store traits. Specialized types (negotiation attempt
//! traces, protocol internals, retry policy) are intentionally excluded —
//! import those from their modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ChatCompletion, ChatRequest, Message, MessageRole, ModelClient, ModelEndpoint, ModelFuture,
    UsageInfo, encode_image_data_url,
};

// ── Orchestrator runtime ────────────────────────────────────────────
pub use crate::agent::{
    CancelToken, EventHandler, FnEventHandler, LoggingHandler, NoopHandler, Orchestrator,
    RollingMemory, RunConfig, RunContext, RunEvent, RunOutcome, RunState,
};

// ── Retrieval and context ───────────────────────────────────────────
pub use crate::context::{ContextMode, ImageAttachment, NegotiationSettings, Turn};
pub use crate::index::{DocumentIndex, ImageCatalogEntry, TextChunk};

// ── Image cache ─────────────────────────────────────────────────────
pub use crate::cache::{
    BaseImage, DirectoryFetcher, FetchFuture, PageCache, SourceFetcher, ZoomCrop, ZoomRegion,
};

// ── Protocol ────────────────────────────────────────────────────────
pub use crate::protocol::{ParsedResponse, ToolCall, parse};

// ── Stores ──────────────────────────────────────────────────────────
pub use crate::store::{
    JsonlStore, LocalObjectStore, NoopStore, ObjectStore, StoredObject, TranscriptStore,
};
