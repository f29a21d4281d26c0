//! Error types for the xml2csv conversion pipeline.
//!
//! This module defines a hierarchy of error types, one per layer:
//!
//! - [`FetchError`] - Acquiring the byte stream (file, upload, HTTP)
//! - [`ParseError`] - Fatal XML parse failures
//! - [`RenderError`] - Rendering a preview record back to XML
//! - [`SinkError`] - Writing CSV output
//! - [`MappingError`] - Non-fatal column mapping diagnostics
//! - [`ConfigError`] - Invalid options
//! - [`ConvertError`] - Top-level run errors
//! - [`ServerError`] - HTTP API errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::RunState;

// =============================================================================
// Fetch Errors
// =============================================================================

/// Errors while acquiring the input document.
///
/// These are raised before any record is parsed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Local file could not be opened.
    #[error("Cannot open '{}': {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTTP request failed (DNS, connection, TLS, body read).
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Server answered with a non-2xx status.
    #[error("Request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// Spill file or other local I/O failure.
    #[error("I/O error while buffering input: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Parse Errors
// =============================================================================

/// Fatal XML parse errors.
///
/// Every variant carries the byte `offset` where the problem was detected and
/// the zero-based index of the `record` being read at that point.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Malformed markup reported by the XML reader.
    #[error("Malformed XML at byte {offset} (record {record}): {message}")]
    Xml {
        offset: u64,
        record: usize,
        message: String,
    },

    /// Closing tag does not match the open element.
    #[error("Mismatched end tag at byte {offset} (record {record}): expected </{expected}>, found </{found}>")]
    MismatchedEndTag {
        offset: u64,
        record: usize,
        expected: String,
        found: String,
    },

    /// Closing tag with no open element.
    #[error("Unexpected end tag </{found}> at byte {offset} (record {record})")]
    UnexpectedEndTag {
        offset: u64,
        record: usize,
        found: String,
    },

    /// Document ended while elements were still open.
    #[error("Unexpected end of document at byte {offset} (record {record}): {open} element(s) still open, innermost <{innermost}>")]
    UnclosedElements {
        offset: u64,
        record: usize,
        open: usize,
        innermost: String,
    },

    /// Document ended inside markup (a tag, comment, CDATA section, DOCTYPE
    /// or processing instruction).
    #[error("Unexpected end of document inside markup at byte {offset} (record {record}): {message}")]
    UnclosedMarkup {
        offset: u64,
        record: usize,
        message: String,
    },

    /// Element nesting deeper than the configured limit.
    #[error("Nesting depth exceeds {max_depth} at byte {offset} (record {record})")]
    DepthExceeded {
        offset: u64,
        record: usize,
        max_depth: usize,
    },

    /// Name or text is not valid UTF-8.
    #[error("Invalid UTF-8 at byte {offset} (record {record})")]
    Utf8 { offset: u64, record: usize },

    /// The byte source failed.
    #[error("Read error at byte {offset} (record {record}): {source}")]
    Io {
        offset: u64,
        record: usize,
        #[source]
        source: std::io::Error,
    },
}

impl ParseError {
    /// Byte offset where the error was detected.
    pub fn offset(&self) -> u64 {
        match self {
            Self::Xml { offset, .. }
            | Self::MismatchedEndTag { offset, .. }
            | Self::UnexpectedEndTag { offset, .. }
            | Self::UnclosedElements { offset, .. }
            | Self::UnclosedMarkup { offset, .. }
            | Self::DepthExceeded { offset, .. }
            | Self::Utf8 { offset, .. }
            | Self::Io { offset, .. } => *offset,
        }
    }

    /// Index of the record being read when the error occurred.
    pub fn record(&self) -> usize {
        match self {
            Self::Xml { record, .. }
            | Self::MismatchedEndTag { record, .. }
            | Self::UnexpectedEndTag { record, .. }
            | Self::UnclosedElements { record, .. }
            | Self::UnclosedMarkup { record, .. }
            | Self::DepthExceeded { record, .. }
            | Self::Utf8 { record, .. }
            | Self::Io { record, .. } => *record,
        }
    }
}

// =============================================================================
// Render Errors
// =============================================================================

/// Errors while rendering a preview sample as XML.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("XML write error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Write error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rendered sample is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

// =============================================================================
// Sink Errors
// =============================================================================

/// Errors while writing CSV output.
#[derive(Debug, Error)]
pub enum SinkError {
    /// CSV encoder error.
    #[error("CSV write error: {0}")]
    Csv(#[from] csv::Error),

    /// Underlying writer failed.
    #[error("Output I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Mapping Errors
// =============================================================================

/// Column mapping diagnostics.
///
/// These never abort a run; missing values are written as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MappingError {
    /// Several sources map to the same destination column.
    #[error("Destination column '{destination}' is used by several sources: {}", .sources.join(", "))]
    DuplicateDestination {
        destination: String,
        sources: Vec<String>,
    },

    /// A mapped source column never appeared in any record.
    #[error("Source column '{source_column}' never appeared in any record")]
    MissingSource { source_column: String },
}

// =============================================================================
// Config Errors
// =============================================================================

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for the options schema.
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Batch size must be at least 1.
    #[error("Batch size must be at least 1, got {0}")]
    InvalidBatchSize(usize),

    /// Unrecognized header policy name.
    #[error("Unknown header policy '{0}' (expected first-record, two-pass or full-buffer)")]
    UnknownHeaderPolicy(String),

    /// Environment variable holds an unusable value.
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

// =============================================================================
// Conversion Errors (top-level)
// =============================================================================

/// Top-level conversion errors.
///
/// This is the main error type returned by [`crate::transform::pipeline`].
/// It wraps all lower-level errors and adds run-specific variants.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Input could not be acquired.
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Document is malformed.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Output could not be written.
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Options are invalid.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Re-reading the source for a second pass failed.
    #[error("Cannot rewind input for another pass: {0}")]
    Rewind(std::io::Error),

    /// Run state machine misuse.
    #[error("Invalid run state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    /// Background conversion task panicked or was cancelled.
    #[error("Conversion task failed: {0}")]
    Task(String),
}

// =============================================================================
// Server Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Conversion error.
    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),

    /// Invalid request.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Unknown job id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Server internal error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Result type for parse operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Result type for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// Result type for conversion operations.
pub type ConvertResult<T> = Result<T, ConvertError>;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_chain() {
        // ParseError -> ConvertError
        let parse_err = ParseError::UnexpectedEndTag {
            offset: 12,
            record: 0,
            found: "Item".into(),
        };
        let convert_err: ConvertError = parse_err.into();
        assert!(convert_err.to_string().contains("</Item>"));
        assert!(convert_err.to_string().contains("byte 12"));

        // FetchError -> ConvertError
        let fetch_err = FetchError::Status {
            url: "http://example.test/feed.xml".into(),
            status: 404,
        };
        let convert_err: ConvertError = fetch_err.into();
        assert!(convert_err.to_string().contains("404"));
    }

    #[test]
    fn test_parse_error_context() {
        let err = ParseError::MismatchedEndTag {
            offset: 40,
            record: 3,
            expected: "Item".into(),
            found: "Itm".into(),
        };
        assert_eq!(err.offset(), 40);
        assert_eq!(err.record(), 3);
        let msg = err.to_string();
        assert!(msg.contains("expected </Item>"));
        assert!(msg.contains("record 3"));
    }

    #[test]
    fn test_mapping_error_format() {
        let err = MappingError::DuplicateDestination {
            destination: "name".into(),
            sources: vec!["A_Name".into(), "B_Name".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'name'"));
        assert!(msg.contains("A_Name, B_Name"));
    }
}
