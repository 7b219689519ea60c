//! Per-collection configuration.
//!
//! ```json
//! {
//!   "name": "products",
//!   "keep_historic": true,
//!   "lock_fields": {
//!     "excluded_fields": ["sku", "externalReferences"],
//!     "array_with_references": { "attributes": "attributeId" },
//!     "removed_fields": "keep"
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use lockdoc_core::{ArrayRules, DiffOptions, ExcludedFields, MergeOptions, RemovedFieldPolicy};

use crate::error::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockFieldsConfig {
    /// Key paths never diffed or locked.
    pub excluded_fields: Vec<String>,
    /// Array key path -> identity field of its elements.
    pub array_with_references: BTreeMap<String, String>,
    pub removed_fields: RemovedFieldPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    #[serde(default)]
    pub keep_historic: bool,
    /// Lock tracking is on when present.
    #[serde(default)]
    pub lock_fields: Option<LockFieldsConfig>,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keep_historic: false,
            lock_fields: None,
        }
    }

    pub fn with_historic(mut self) -> Self {
        self.keep_historic = true;
        self
    }

    pub fn with_lock_fields(mut self, lock_fields: LockFieldsConfig) -> Self {
        self.lock_fields = Some(lock_fields);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.is_empty() {
            return Err(EngineError::InvalidConfig("collection name is empty".into()));
        }
        self.merge_options(false).map(|_| ())
    }

    pub fn lock_tracking(&self) -> bool {
        self.lock_fields.is_some()
    }

    /// Compiles the textual rules into the options the merge engine takes.
    pub fn merge_options(&self, force: bool) -> Result<MergeOptions, EngineError> {
        let Some(lock_fields) = &self.lock_fields else {
            return Ok(MergeOptions {
                force,
                ..MergeOptions::default()
            });
        };

        let excluded = ExcludedFields::parse(lock_fields.excluded_fields.iter().map(String::as_str))
            .map_err(|e| EngineError::InvalidConfig(format!("excluded_fields: {e}")))?;
        let array_rules = ArrayRules::parse(
            lock_fields
                .array_with_references
                .iter()
                .map(|(path, field)| (path.as_str(), field.as_str())),
        )
        .map_err(|e| EngineError::InvalidConfig(format!("array_with_references: {e}")))?;

        Ok(MergeOptions {
            diff: DiffOptions {
                excluded,
                array_rules,
            },
            force,
            removed_fields: lock_fields.removed_fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = CollectionConfig::from_json_str(
            r#"{
                "name": "products",
                "keep_historic": true,
                "lock_fields": {
                    "excluded_fields": ["sku"],
                    "array_with_references": { "links.bundle": "productId" },
                    "removed_fields": "remove_and_lock"
                }
            }"#,
        )
        .unwrap();
        assert!(config.keep_historic);
        assert!(config.lock_tracking());
        let options = config.merge_options(true).unwrap();
        assert!(options.force);
        assert_eq!(options.removed_fields, RemovedFieldPolicy::RemoveAndLock);
        assert!(!options.diff.excluded.is_empty());
        assert!(!options.diff.array_rules.is_empty());
    }

    #[test]
    fn minimal_config_has_no_lock_tracking() {
        let config = CollectionConfig::from_json_str(r#"{ "name": "plain" }"#).unwrap();
        assert!(!config.keep_historic);
        assert!(!config.lock_tracking());
    }

    #[test]
    fn bad_paths_are_invalid_config() {
        let err = CollectionConfig::from_json_str(
            r#"{ "name": "x", "lock_fields": { "excluded_fields": ["a..b"] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));

        let err = CollectionConfig::from_json_str(r#"{ "name": "" }"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));

        let err = CollectionConfig::from_json_str(r#"{ "keep_historic": true }"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}
