//! Tracker configuration
//!
//! Loaded from a JSON file. Every key is optional and falls back to its default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Default database file name
pub const DEFAULT_DATABASE_PATH: &str = "weight.db";

/// Default username used for guest sessions
pub const DEFAULT_GUEST_USERNAME: &str = "guest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Unit label appended to rendered weights
    pub unit_label: String,
    /// Username backing guest sessions
    pub guest_username: String,
    /// chrono format used to parse entered dates
    pub date_format: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            unit_label: "lbs".to_string(),
            guest_username: DEFAULT_GUEST_USERNAME.to_string(),
            date_format: "%Y-%m-%d".to_string(),
        }
    }
}

impl TrackerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = TrackerConfig::from_json(r#"{"unit_label": "kg"}"#).unwrap();
        assert_eq!(
            config,
            TrackerConfig {
                unit_label: "kg".to_string(),
                ..TrackerConfig::default()
            }
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"database_path": "/tmp/w.db", "guest_username": "visitor"}"#).unwrap();

        let config = TrackerConfig::load(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/w.db"));
        assert_eq!(config.guest_username, "visitor");
        assert_eq!(config.date_format, "%Y-%m-%d");
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            TrackerConfig::from_json("not json"),
            Err(ConfigError::Json(_))
        ));
    }
}
