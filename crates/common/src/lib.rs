//! Shared configuration, error types, allocator contract and metrics for Quiver crates.
//!
//! Architecture role:
//! - defines codegen/processor configuration passed across layers
//! - provides common [`QuiverError`] / [`Result`] contracts
//! - defines the [`Allocator`] interface every buffer owner receives explicitly
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;

pub use config::{CodegenOptions, EmptyInputPolicy, ProcessorConfig};
pub use error::{QuiverError, Result};
pub use memory::{Allocator, BudgetAllocator, SharedAllocator, SystemAllocator};
pub use metrics::{MetricsRegistry, global_metrics};
