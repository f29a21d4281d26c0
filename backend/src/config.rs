//! Conversion options and environment defaults.
//!
//! Options come from three layers, later ones winning: built-in defaults,
//! a JSON config file, then CLI flags or API fields. Environment variables
//! (read after `.env` is loaded) replace the built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::models::{EmptyLeafPolicy, HeaderPolicy, Mapping};
use crate::parser::preview::DEFAULT_PREVIEW_BYTES;
use crate::parser::DEFAULT_MAX_DEPTH;
use crate::sink::DEFAULT_BATCH_SIZE;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default record estimate for progress when the total is unknown.
pub const DEFAULT_ESTIMATED_RECORDS: u64 = 10_000;

/// Maximum accepted upload size for the HTTP API (256 MB).
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

pub const ENV_BATCH_SIZE: &str = "XML2CSV_BATCH_SIZE";
pub const ENV_HEADER_POLICY: &str = "XML2CSV_HEADER_POLICY";
pub const ENV_PORT: &str = "XML2CSV_PORT";

/// Options for one conversion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvertOptions {
    /// Record element tag. Inferred by preview when absent.
    pub record_tag: Option<String>,

    /// Column selection and renaming.
    pub mapping: Option<Mapping>,

    /// Rows buffered per write.
    pub batch_size: usize,

    pub header_policy: HeaderPolicy,

    pub empty_leaves: EmptyLeafPolicy,

    /// Progress denominator when the record count is unknown.
    pub estimated_records: u64,

    /// Bytes sampled when inferring the record tag.
    pub preview_bytes: u64,

    pub max_depth: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            record_tag: None,
            mapping: None,
            batch_size: DEFAULT_BATCH_SIZE,
            header_policy: HeaderPolicy::default(),
            empty_leaves: EmptyLeafPolicy::default(),
            estimated_records: DEFAULT_ESTIMATED_RECORDS,
            preview_bytes: DEFAULT_PREVIEW_BYTES,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl ConvertOptions {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();
        options.apply_env(|name| std::env::var(name).ok())?;
        Ok(options)
    }

    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Apply `XML2CSV_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_BATCH_SIZE.to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_HEADER_POLICY) {
            self.header_policy = value.parse()?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }
        Ok(())
    }
}

/// HTTP port from `XML2CSV_PORT`, falling back to [`DEFAULT_PORT`].
pub fn port_from_env() -> Result<u16, ConfigError> {
    match std::env::var(ENV_PORT) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            name: ENV_PORT.to_string(),
            value,
        }),
        Err(_) => Ok(DEFAULT_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let options = ConvertOptions::default();
        assert_eq!(options.batch_size, 500);
        assert_eq!(options.header_policy, HeaderPolicy::TwoPass);
        assert_eq!(options.empty_leaves, EmptyLeafPolicy::Skip);
        assert_eq!(options.estimated_records, 10_000);
        assert_eq!(options.preview_bytes, 40_960);
        assert_eq!(options.max_depth, 512);
    }

    #[test]
    fn test_json_fills_missing_fields() {
        let options = ConvertOptions::from_json(
            r#"{ "recordTag": "Item", "headerPolicy": "firstRecord", "emptyLeaves": "emit" }"#,
        )
        .unwrap();
        assert_eq!(options.record_tag.as_deref(), Some("Item"));
        assert_eq!(options.header_policy, HeaderPolicy::FirstRecord);
        assert_eq!(options.empty_leaves, EmptyLeafPolicy::Emit);
        assert_eq!(options.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_json_with_mapping() {
        let options = ConvertOptions::from_json(
            r#"{ "mapping": { "Item_A": "a", "Item_B": "Ignore" } }"#,
        )
        .unwrap();
        let mapping = options.mapping.as_ref().unwrap();
        assert_eq!(mapping.destinations(), vec!["a"]);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = ConvertOptions::from_json(r#"{ "batchSize": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBatchSize(0)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_BATCH_SIZE, "25"), (ENV_HEADER_POLICY, "full-buffer")].into();
        let mut options = ConvertOptions::default();
        options
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(options.batch_size, 25);
        assert_eq!(options.header_policy, HeaderPolicy::FullBuffer);

        let bad: HashMap<&str, &str> = [(ENV_BATCH_SIZE, "many")].into();
        let err = ConvertOptions::default()
            .apply_env(|name| bad.get(name).map(|v| v.to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
