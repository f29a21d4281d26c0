//! # xml2csv - Streaming XML to CSV conversion
//!
//! xml2csv reads XML documents of any size as a stream, turns each record
//! element into a flat row of `path → value` columns, and writes CSV in
//! batches. Inputs can be local files, uploads, or HTTP URLs (downloaded or
//! parsed while streaming).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  XML Source │────▶│   Parser    │────▶│  Transform  │────▶│  CSV Sink   │
//! │ (file/HTTP) │     │  (records)  │     │  (flatten)  │     │  (batched)  │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use xml2csv::{convert_bytes, ConvertOptions};
//!
//! let xml = b"<Items><Item id=\"1\"><Name>Widget</Name></Item></Items>";
//! let outcome = convert_bytes(xml, ConvertOptions::default()).unwrap();
//! assert_eq!(outcome.output, b"Item_@id,Item_Name\n1,Widget\n");
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Hierarchical error types
//! - [`models`] - Domain models (Element, FlatRow, Mapping, RunState)
//! - [`config`] - Conversion options and environment defaults
//! - [`source`] - Input acquisition (file, upload, HTTP)
//! - [`parser`] - Streaming record reader and preview
//! - [`transform`] - Flattening, header accumulation, and pipeline
//! - [`sink`] - Batched CSV writer
//! - [`validation`] - Column mapping checks
//! - [`api`] - HTTP API server

// Core modules
pub mod config;
pub mod error;
pub mod models;

// Input
pub mod source;

// Parsing
pub mod parser;

// Transformation
pub mod transform;

// Output
pub mod sink;

// Validation
pub mod validation;

// HTTP API
pub mod api;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    ConfigError,
    ConvertError,
    ConvertResult,
    FetchError,
    MappingError,
    ParseError,
    RenderError,
    ServerError,
    SinkError,
};

// =============================================================================
// Re-exports - Models
// =============================================================================

pub use models::{
    Element,
    EmptyLeafPolicy,
    FlatRow,
    HeaderPolicy,
    Mapping,
    MappingEntry,
    Progress,
    RunState,
};

// =============================================================================
// Re-exports - Configuration
// =============================================================================

pub use config::ConvertOptions;

// =============================================================================
// Re-exports - Sources
// =============================================================================

pub use source::{FetchMode, OpenedSource, Replay, XmlSource};

// =============================================================================
// Re-exports - Parsing
// =============================================================================

pub use parser::{preview_reader, Preview, RecordReader, RecordSelector};

// =============================================================================
// Re-exports - Transformation
// =============================================================================

pub use transform::{flatten, flatten_record, Column, ColumnPlan, HeaderSet};

// =============================================================================
// Re-exports - Sink
// =============================================================================

pub use sink::{BatchWriter, SinkSummary};

// =============================================================================
// Re-exports - Pipeline
// =============================================================================

pub use transform::pipeline::{
    convert_bytes,
    convert_opened,
    convert_source,
    open_preview,
    preview_source,
    ConversionOutcome,
    ConversionState,
    Converter,
    LogProgress,
    NeverStop,
    NoProgress,
    ProgressSink,
    RunSummary,
    StopSignal,
};

// =============================================================================
// Re-exports - API
// =============================================================================

pub use api::types::{error_response, PreviewResponse, StopResponse};

// Server
pub mod server {
    pub use crate::api::server::{router, serve, start_server, AppState};
}
