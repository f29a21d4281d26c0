//! Domain models for the XML flattening pipeline.
//!
//! This module contains the core data structures used throughout the pipeline:
//!
//! - [`Element`] - One materialized XML element subtree (transient)
//! - [`FlatRow`] - Flattened column → value mapping for one record
//! - [`Mapping`] - Ordered (source column → destination column) selection
//! - [`HeaderPolicy`] - How the output header is discovered
//! - [`EmptyLeafPolicy`] - Whether bare leaves contribute an empty column
//! - [`RunState`] - Lifecycle of one conversion run
//! - [`Progress`] - Progress snapshot pushed to observers

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

// =============================================================================
// Element
// =============================================================================

/// An XML element subtree, owned.
///
/// Elements only live while their record is being flattened; the parser
/// driver hands each completed record to the caller by value and keeps no
/// reference to it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    /// Tag name, exactly as written (prefix included).
    pub tag: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    /// Trimmed direct text content, `None` when empty or whitespace-only.
    pub text: Option<String>,
    /// Child elements in document order.
    pub children: Vec<Element>,
}

impl Element {
    /// Create an element with no attributes, text or children.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// Set the text content. Whitespace-only text is stored as `None`.
    pub fn with_text(mut self, text: impl AsRef<str>) -> Self {
        self.text = normalize_text(text.as_ref());
        self
    }

    /// Append a child element.
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// True when the element carries attributes or child elements.
    ///
    /// This is the test used to pick a record element when none is configured.
    pub fn is_structured(&self) -> bool {
        !self.attributes.is_empty() || !self.children.is_empty()
    }

    /// True for a childless, attribute-less element without text.
    pub fn is_bare(&self) -> bool {
        !self.is_structured() && self.text.is_none()
    }
}

/// Trim text content, mapping empty results to `None`.
pub fn normalize_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// =============================================================================
// Flat Row
// =============================================================================

/// One flattened record: column name → string value.
///
/// Columns keep the order in which flattening first produced them. A row is
/// immutable once built; the only way to get one is through the flattener or
/// [`FromIterator`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRow {
    values: IndexMap<String, String>,
}

impl FlatRow {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Last write wins on duplicate column names.
    pub(crate) fn insert(&mut self, column: String, value: String) {
        self.values.insert(column, value);
    }

    /// Value for a column, if the record produced it.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    /// Value for a column, empty string when absent.
    pub fn value_or_empty(&self, column: &str) -> &str {
        self.get(column).unwrap_or("")
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Column names in production order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names sorted lexicographically.
    pub fn sorted_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self.values.keys().cloned().collect();
        columns.sort();
        columns
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FlatRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = FlatRow::new();
        for (column, value) in iter {
            row.insert(column.into(), value.into());
        }
        row
    }
}

// =============================================================================
// Column Mapping
// =============================================================================

/// Destination value meaning "do not export this column".
pub const IGNORE_DESTINATION: &str = "Ignore";

/// One `source → destination` column selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Flattened column name produced by the flattener.
    pub source: String,
    /// Column name written to the CSV header.
    pub destination: String,
}

impl MappingEntry {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    fn is_ignored(&self) -> bool {
        let destination = self.destination.trim();
        destination.is_empty() || destination == IGNORE_DESTINATION
    }
}

/// Ordered column mapping.
///
/// Deserializes from either a list of `{ "source", "destination" }` objects
/// or a JSON object `{ "source": "destination" }` (key order kept). Entries
/// pointing to `"Ignore"` or to an empty destination are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "RawMapping")]
pub struct Mapping {
    entries: Vec<MappingEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMapping {
    List(Vec<MappingEntry>),
    Table(IndexMap<String, String>),
}

impl From<RawMapping> for Mapping {
    fn from(raw: RawMapping) -> Self {
        match raw {
            RawMapping::List(entries) => Mapping::new(entries),
            RawMapping::Table(table) => table.into_iter().collect(),
        }
    }
}

impl Serialize for Mapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl Mapping {
    pub fn new(entries: Vec<MappingEntry>) -> Self {
        Self {
            entries: entries.into_iter().filter(|e| !e.is_ignored()).collect(),
        }
    }

    /// Parse a mapping from JSON text.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    /// Destination columns, in output order.
    pub fn destinations(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.destination.clone()).collect()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.source.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>, D: Into<String>> FromIterator<(S, D)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (S, D)>>(iter: I) -> Self {
        Mapping::new(
            iter.into_iter()
                .map(|(source, destination)| MappingEntry::new(source, destination))
                .collect(),
        )
    }
}

// =============================================================================
// Policies
// =============================================================================

/// How the output header is discovered.
///
/// The header set grows while the document is read, so a single streaming
/// pass cannot know every column before the first batch is written. Each
/// policy trades completeness against memory and reads differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HeaderPolicy {
    /// One pass; header is the first record's columns. Later columns are dropped.
    FirstRecord,
    /// Read the source twice: collect all columns, then write rows.
    #[default]
    TwoPass,
    /// One pass; keep every row in memory and write once at the end.
    FullBuffer,
}

impl HeaderPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstRecord => "first-record",
            Self::TwoPass => "two-pass",
            Self::FullBuffer => "full-buffer",
        }
    }
}

impl FromStr for HeaderPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "firstrecord" | "first" => Ok(Self::FirstRecord),
            "twopass" => Ok(Self::TwoPass),
            "fullbuffer" | "buffer" => Ok(Self::FullBuffer),
            _ => Err(ConfigError::UnknownHeaderPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for HeaderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a childless, attribute-less element with empty text yields a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmptyLeafPolicy {
    /// Contribute nothing.
    #[default]
    Skip,
    /// Contribute the column with an empty value.
    Emit,
}

// =============================================================================
// Run Lifecycle
// =============================================================================

/// State of one conversion run.
///
/// `Idle → Fetching → Previewing? → Mapping? → Streaming → {Completed | Stopped | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Fetching,
    Previewing,
    Mapping,
    Streaming,
    Completed,
    Stopped,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Idle, Fetching) => true,
            (Fetching, Previewing | Mapping | Streaming | Stopped | Completed) => true,
            (Previewing, Mapping | Streaming | Stopped | Completed) => true,
            (Mapping, Streaming | Stopped) => true,
            (Streaming, Completed | Stopped) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Previewing => "previewing",
            Self::Mapping => "mapping",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Records processed so far in the writing pass.
    pub records: u64,
    /// Total records, when known (two-pass runs).
    pub total: Option<u64>,
    /// Monotonic fraction in `[0, 1]`.
    pub fraction: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_text_is_empty() {
        let element = Element::new("A").with_text("  \n\t ");
        assert_eq!(element.text, None);
        assert!(element.is_bare());

        let element = Element::new("A").with_text("  x ");
        assert_eq!(element.text.as_deref(), Some("x"));
    }

    #[test]
    fn test_flat_row_last_write_wins() {
        let row: FlatRow = vec![("a", "1"), ("b", "2"), ("a", "3")].into_iter().collect();
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("a"), Some("3"));
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(row.value_or_empty("missing"), "");
    }

    #[test]
    fn test_mapping_from_list_json() {
        let mapping = Mapping::from_json(
            r#"[{"source": "Item_B", "destination": "b"}, {"source": "Item_A", "destination": "a"}]"#,
        )
        .unwrap();
        assert_eq!(mapping.destinations(), vec!["b", "a"]);
    }

    #[test]
    fn test_mapping_from_object_keeps_order_and_drops_ignored() {
        let mapping = Mapping::from_json(
            r#"{"Item_Z": "zed", "Item_A": "Ignore", "Item_M": "em", "Item_Q": ""}"#,
        )
        .unwrap();
        let sources: Vec<&str> = mapping.sources().collect();
        assert_eq!(sources, vec!["Item_Z", "Item_M"]);
        assert_eq!(mapping.destinations(), vec!["zed", "em"]);
    }

    #[test]
    fn test_mapping_serializes_as_list() {
        let mapping: Mapping = vec![("x", "y")].into_iter().collect();
        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json, serde_json::json!([{"source": "x", "destination": "y"}]));
    }

    #[test]
    fn test_header_policy_parsing() {
        assert_eq!("first-record".parse::<HeaderPolicy>().unwrap(), HeaderPolicy::FirstRecord);
        assert_eq!("twoPass".parse::<HeaderPolicy>().unwrap(), HeaderPolicy::TwoPass);
        assert_eq!("FULL_BUFFER".parse::<HeaderPolicy>().unwrap(), HeaderPolicy::FullBuffer);
        assert!("sideways".parse::<HeaderPolicy>().is_err());
    }

    #[test]
    fn test_run_state_transitions() {
        use RunState::*;
        assert!(Idle.can_transition_to(Fetching));
        assert!(Fetching.can_transition_to(Streaming));
        assert!(Fetching.can_transition_to(Previewing));
        assert!(Previewing.can_transition_to(Mapping));
        assert!(Mapping.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Stopped));
        assert!(Streaming.can_transition_to(Failed));
        assert!(Idle.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Previewing));
    }
}
