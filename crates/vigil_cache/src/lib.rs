//! # vigil_cache
//!
//! In-memory caches shared by the Vigil scheduler workers.
//!
//! This crate provides:
//! - [`FileCache`]: per-URI contents, diagnostics and aggregate contributions
//! - [`AggregateStore`]: the workspace-wide aggregate snapshot
//! - [`BundleDiffCache`]: change detection for on-disk data bundles
//! - [`EvaluationCache`]: compiled query handles with a hot-reload mode
//!
//! Nothing here is persisted; every cache can be rebuilt from disk.

pub mod aggregate;
pub mod bundle;
mod error;
pub mod evaluation;
pub mod file_cache;

pub use aggregate::AggregateStore;
pub use bundle::{Bundle, BundleDiffCache};
pub use error::CacheError;
pub use evaluation::{DirectoryQuerySource, EvaluationCache, QueryCompiler, QuerySource};
pub use file_cache::{FileCache, FileState};
