//! Store configuration.
//!
//! Configuration is plain serde data so it can be embedded in a host
//! application's own settings file or loaded standalone from JSON.
//!
//! ```json
//! { "format_version": { "major": 6, "minor": 0 }, "evict_on_release": true }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::Result;
use crate::storage::FormatVersion;

fn default_evict_on_release() -> bool {
    true
}

/// Settings shared by a database and the scene that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Layout used for records written to newly created database files.
    /// Files opened for update keep the version found in their header.
    #[serde(default)]
    pub format_version: FormatVersion,
    /// Recompute the database bounding box from the remaining blocks after a
    /// block is removed. When off, the box only ever grows.
    #[serde(default)]
    pub recompute_bbox_on_remove: bool,
    /// Free a file-backed block's records when its last pin is dropped.
    #[serde(default = "default_evict_on_release")]
    pub evict_on_release: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            format_version: FormatVersion::default(),
            recompute_bbox_on_remove: false,
            evict_on_release: default_evict_on_release(),
        }
    }
}

impl StoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.format_version.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        info!(path = %path.display(), version = %config.format_version, "loaded store config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = StoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(config.evict_on_release);
        assert_eq!(config.format_version, FormatVersion::CURRENT);
    }

    #[test]
    fn test_partial_override() {
        let config = StoreConfig::from_json_str(
            r#"{ "format_version": { "major": 5, "minor": 0 }, "recompute_bbox_on_remove": true }"#,
        )
        .unwrap();
        assert_eq!(config.format_version, FormatVersion::new(5, 0));
        assert!(config.recompute_bbox_on_remove);
        assert!(config.evict_on_release);
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let err = StoreConfig::from_json_str(r#"{ "format_version": { "major": 9, "minor": 0 } }"#);
        assert!(matches!(err, Err(Error::UnsupportedVersion { major: 9, .. })));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(StoreConfig::from_json_str("{ nope"), Err(Error::Config(_))));
    }
}
