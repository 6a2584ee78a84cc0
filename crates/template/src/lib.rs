//! Declarative prompt templates and their compiler.
//!
//! A template describes a prompt as a top-level **layout** (literal or
//! data-bound messages, slot references, anchors) plus named **slots**, each
//! with an execution **plan** (messages, loops, conditionals). Attachment
//! **lanes** describe content that the render engine injects afterwards at
//! anchor positions.
//!
//! # Pipeline
//!
//! ```text
//! ┌─────────────┐  from_toml   ┌──────────┐  compile  ┌──────────────────┐
//! │ TOML / JSON │─────────────▶│ Template │──────────▶│ CompiledTemplate │
//! └─────────────┘              └──────────┘           └──────────────────┘
//!                                                       (read-only, shared)
//! ```
//!
//! Compilation validates structure and pre-parses every text template,
//! condition and group pattern. Structural problems are [`CompileError`]s;
//! declared-but-unused slots are reported as [`Lint`]s.

pub mod compiler;
pub mod condition;
pub mod model;
pub mod text;

pub use compiler::{
    CompiledForEach, CompiledGroup, CompiledIf, CompiledLane, CompiledLayoutNode, CompiledMessage,
    CompiledPlanNode, CompiledSlot, CompiledSlotRef, CompiledTemplate, Content, Lint, compile,
    compile_lane,
};
pub use condition::{Condition, parse_condition};
pub use model::{
    AnchorSpec, Edge, ForEach, Group, IfNode, Injection, Lane, LayoutNode, MessageSpec,
    Occurrence, Payload, PlanNode, Slot, SlotRef, SortOrder, TargetSpec, Targets, Template,
};
pub use text::{SourceRef, TextTemplate, ValueLookup};

/// Result alias for compilation.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Structural errors found while loading or compiling a template.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("message node {node} declares both literal content and a data reference")]
    ConflictingContent { node: String },

    #[error("message node {node} declares neither literal content nor a data reference")]
    MissingContent { node: String },

    #[error("layout references undeclared slot '{slot}'")]
    UnknownSlot { slot: String },

    #[error("invalid condition at {node}: {detail}")]
    InvalidCondition { node: String, detail: String },

    #[error("invalid text template at {node}: {detail}")]
    InvalidText { node: String, detail: String },

    #[error("invalid group pattern '{pattern}' in lane '{lane}': {detail}")]
    InvalidPattern {
        lane: String,
        pattern: String,
        detail: String,
    },

    #[error("invalid template: {reason}")]
    InvalidTemplate { reason: String },

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}
