//! # vigil_types
//!
//! Types shared by every Vigil crate:
//! - Source spans and editor positions
//! - Diagnostics and severities
//! - Opaque per-file aggregate facts

mod aggregate;
mod diagnostic;
mod span;

pub use aggregate::{Aggregate, AggregateMap};
pub use diagnostic::{Diagnostic, Severity};
pub use span::{LineIndex, Location, Position, Span};

/// Identifier of a file as seen by the editor (a `file://` URI string).
pub type FileUri = String;
