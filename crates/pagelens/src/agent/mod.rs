//! Orchestrator runtime: the bounded tool-resolution loop and its supporting
//! modules.
//!
//! - [`orchestrator::Orchestrator`] — the top-level state machine. Start here.
//! - [`config::RunConfig`] — model, step limit, budgets, retrieval depth.
//! - [`run_context::RunContext`] — per-run mutable state (sent-image set,
//!   step counter, cancellation token, rolling memory) passed explicitly
//!   through every call.
//! - [`events`] — [`EventHandler`](events::EventHandler) trait and
//!   [`RunEvent`](events::RunEvent) enum for observing the loop.

pub mod config;
pub mod events;
pub mod orchestrator;
pub mod run_context;

pub use config::RunConfig;
pub use events::{EventHandler, FnEventHandler, LoggingHandler, NoopHandler, RunEvent};
pub use orchestrator::{Orchestrator, RunOutcome, RunState};
pub use run_context::{CancelToken, RollingMemory, RunContext};
