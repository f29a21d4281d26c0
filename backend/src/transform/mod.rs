//! Transformation module.
//!
//! This module turns parsed records into CSV rows:
//! - Flatten: Element subtree to one flat row
//! - Headers: Column union and column plans
//! - Pipeline: Conversion runs, cancellation and progress

pub mod flatten;
pub mod headers;
pub mod pipeline;

pub use flatten::{flatten, flatten_record, ATTRIBUTE_MARKER, PATH_SEPARATOR};
pub use headers::{project, Column, ColumnPlan, HeaderSet};
pub use pipeline::*;
