//! Header accumulation and column resolution.
//!
//! [`HeaderSet`] is the run-wide union of every column seen so far. It only
//! grows. [`ColumnPlan`] decides which columns the writer emits, and in which
//! order, once the header is finalized.

use std::collections::BTreeSet;

use crate::models::{FlatRow, Mapping};

/// Monotonically growing set of column names, iterated in lexicographic order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    columns: BTreeSet<String>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union the row's columns into the set. Returns how many were new.
    pub fn extend_from_row(&mut self, row: &FlatRow) -> usize {
        let mut added = 0;
        for column in row.columns() {
            if !self.columns.contains(column) {
                self.columns.insert(column.to_string());
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Sorted column list.
    pub fn columns(&self) -> Vec<String> {
        self.columns.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// One output column: where its value comes from and what the header says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Flattened column read from each row.
    pub source: String,
    /// Header cell.
    pub name: String,
}

impl Column {
    /// Column whose header equals its source.
    pub fn identity(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: name.clone(),
            name,
        }
    }

    pub fn mapped(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }
}

/// How the writer obtains its final column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnPlan {
    /// Columns known up front.
    Fixed(Vec<Column>),
    /// Sorted columns of the first row written; later new columns are dropped.
    FromFirstRow,
}

impl ColumnPlan {
    /// Mapping destinations, in mapping order.
    pub fn from_mapping(mapping: &Mapping) -> Self {
        Self::Fixed(
            mapping
                .entries()
                .iter()
                .map(|e| Column::mapped(e.source.clone(), e.destination.clone()))
                .collect(),
        )
    }

    /// Every accumulated column, sorted.
    pub fn from_headers(headers: &HeaderSet) -> Self {
        Self::Fixed(headers.iter().map(Column::identity).collect())
    }

    /// Resolve the plan: a mapping always wins over discovered headers.
    pub fn resolve(mapping: Option<&Mapping>, headers: &HeaderSet) -> Self {
        match mapping {
            Some(m) => Self::from_mapping(m),
            None => Self::from_headers(headers),
        }
    }
}

/// Project a row onto `columns`, rendering missing values as empty strings.
pub fn project<'r>(row: &'r FlatRow, columns: &[Column]) -> Vec<&'r str> {
    columns
        .iter()
        .map(|column| row.value_or_empty(&column.source))
        .collect()
}
