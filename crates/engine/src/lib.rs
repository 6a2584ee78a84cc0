//! # promptloom engine
//!
//! Renders a [`CompiledTemplate`](promptloom_template::CompiledTemplate) into
//! an ordered list of chat messages under a hard token budget.
//!
//! ```text
//! compiled template ─┬─▶ plan executor (per slot) ─▶ layout assembler
//!                    │                                   │ messages + anchors
//!                    └────────── lanes ──────────▶ injection pass ─▶ Vec<ChatMessage>
//! ```
//!
//! All per-render state (budget counters, message list, anchor map) lives in
//! one call and is never shared. Compiled templates and registries are
//! read-only and may be reused across concurrent renders.

pub mod anchors;
mod assembler;
pub mod budget;
pub mod executor;
mod injection;
pub mod registry;
pub mod render;
pub mod report;

pub use anchors::AnchorMap;
pub use budget::{BudgetManager, BudgetSnapshot, CharEstimator, TokenEstimator};
pub use executor::Fragment;
pub use registry::{Frame, Resolver, ScopeLookup, SourceRegistry, Sources, with_additional_frame};
pub use render::{RenderOptions, RenderOutput, render, render_with_report};
pub use report::{Omission, OmissionReason, RenderReport, Stage};

/// Errors that abort a render. Omissions are not errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// A registered resolver failed.
    #[error("source resolution failed: {0}")]
    Source(#[from] promptloom_core::SourceError),

    /// A caller-supplied lane or request template failed to compile.
    #[error("compile error: {0}")]
    Compile(#[from] promptloom_template::CompileError),
}
