//! # promptloom core
//!
//! Domain value types and error definitions shared by the template compiler,
//! the render engine, and the CLI. This crate has no knowledge of templates
//! or budgets; it only defines what a rendered message is and how resolver
//! failures are reported.

pub mod error;
pub mod message;
pub mod value;

// Re-export key types at crate root for ergonomics
pub use error::{SourceError, SourceResult};
pub use message::{ChatMessage, Role};
