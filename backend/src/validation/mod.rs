//! Column mapping checks.
//!
//! A mapping is checked twice during a run:
//!
//! - before streaming, for destination columns claimed by several sources
//!   ([`duplicate_destinations`])
//! - once the header set is known, for sources that never appeared
//!   ([`missing_sources`])
//!
//! Both produce [`MappingError`] warnings. None of them aborts a run: a
//! duplicated destination is written once per entry and a missing source
//! is written as an empty column.
//!
//! # Example
//!
//! ```rust,ignore
//! use xml2csv::{validation::duplicate_destinations, Mapping};
//!
//! let mapping: Mapping = vec![("Item_A", "name"), ("Item_B", "name")].into_iter().collect();
//! let warnings = duplicate_destinations(&mapping);
//! assert_eq!(warnings.len(), 1);
//! ```

use indexmap::IndexMap;

use crate::error::MappingError;
use crate::models::Mapping;
use crate::transform::headers::HeaderSet;

/// Destinations used by more than one source, in first-use order.
pub fn duplicate_destinations(mapping: &Mapping) -> Vec<MappingError> {
    let mut by_destination: IndexMap<&str, Vec<String>> = IndexMap::new();
    for entry in mapping.entries() {
        by_destination
            .entry(entry.destination.as_str())
            .or_default()
            .push(entry.source.clone());
    }

    by_destination
        .into_iter()
        .filter(|(_, sources)| sources.len() > 1)
        .map(|(destination, sources)| MappingError::DuplicateDestination {
            destination: destination.to_string(),
            sources,
        })
        .collect()
}

/// Mapped sources absent from `headers`, in mapping order.
pub fn missing_sources(mapping: &Mapping, headers: &HeaderSet) -> Vec<MappingError> {
    let mut seen = Vec::new();
    mapping
        .sources()
        .filter(|source| !headers.contains(source))
        .filter(|source| {
            if seen.contains(source) {
                false
            } else {
                seen.push(*source);
                true
            }
        })
        .map(|source| MappingError::MissingSource {
            source_column: source.to_string(),
        })
        .collect()
}
