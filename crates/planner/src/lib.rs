//! Operator pipeline data model consumed by the transformer.
//!
//! An [`OpPipeline`] is a source-rooted chain of [`OpNode`]s produced by an
//! external planner. This crate owns its shape validation
//! ([`OpPipeline::ordered_nodes`]) and explain rendering; translation into
//! executable units lives in `quiver-execution`.

pub mod explain;
pub mod expr;
pub mod pipeline;

pub use explain::{explain_pipeline, fmt_expr};
pub use expr::*;
pub use pipeline::*;
