//! Index definitions.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// The stored description of an index: a name plus the source text of its
/// view functions.
///
/// The engine treats `map` and `reduce` as opaque text and hands them to
/// the embedder's [`crate::index::ViewCompiler`]. Definitions persist as
/// one JSON file each under `definitions/`, so they survive restarts and
/// are recompiled on open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Unique index name.
    pub name: String,
    /// Source of the map function.
    pub map: String,
    /// Source of the reduce function, present for map-reduce indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
    /// Field of each map output whose value buckets outputs into reduce
    /// groups. Required exactly when `reduce` is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

impl IndexDefinition {
    /// Creates a plain (map-only) definition.
    #[must_use]
    pub fn map_only(name: impl Into<String>, map: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: map.into(),
            reduce: None,
            group_by: None,
        }
    }

    /// Creates a map-reduce definition.
    #[must_use]
    pub fn map_reduce(
        name: impl Into<String>,
        map: impl Into<String>,
        reduce: impl Into<String>,
        group_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            map: map.into(),
            reduce: Some(reduce.into()),
            group_by: Some(group_by.into()),
        }
    }

    /// `true` when the index aggregates through a reduce function.
    #[must_use]
    pub fn is_map_reduce(&self) -> bool {
        self.reduce.is_some()
    }

    /// Validates structural constraints.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for an empty name or map, or
    /// when `reduce` and `group_by` don't come as a pair.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid_format("index name cannot be empty"));
        }
        if self.map.trim().is_empty() {
            return Err(CoreError::invalid_format(format!(
                "index {} has an empty map function",
                self.name
            )));
        }
        match (&self.reduce, &self.group_by) {
            (Some(_), None) => Err(CoreError::invalid_format(format!(
                "index {} has a reduce function but no group_by field",
                self.name
            ))),
            (None, Some(_)) => Err(CoreError::invalid_format(format!(
                "index {} has a group_by field but no reduce function",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_only_is_valid() {
        let def = IndexDefinition::map_only("byName", "doc.name");
        assert!(def.validate().is_ok());
        assert!(!def.is_map_reduce());
    }

    #[test]
    fn map_reduce_is_valid() {
        let def = IndexDefinition::map_reduce("sales", "doc.qty", "sum(qty)", "region");
        assert!(def.validate().is_ok());
        assert!(def.is_map_reduce());
    }

    #[test]
    fn reduce_without_group_by_is_rejected() {
        let def = IndexDefinition {
            name: "bad".into(),
            map: "doc".into(),
            reduce: Some("sum".into()),
            group_by: None,
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn empty_name_is_rejected() {
        let def = IndexDefinition::map_only("  ", "doc");
        assert!(def.validate().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let def = IndexDefinition::map_reduce("sales", "m", "r", "region");
        let json = serde_json::to_string(&def).unwrap();
        let back: IndexDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
