//! Configuration management.
use crate::error::ReductionError;
use crate::reduction::StageInfo;
use config::Config;
use serde::Deserialize;
use std::path::Path;

/// Top-level settings document.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// The reduction chain.
    pub chain: ChainSettings,
}

/// Raw key and ordered stage list of one reduction chain.
#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    /// Node the first stage reads.
    pub raw_key: String,
    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One `[[chain.stages]]` entry.
///
/// Everything besides the common identity fields lands in `params` and is
/// interpreted by the factory registered for `type`.
#[derive(Debug, Deserialize, Clone)]
pub struct StageConfig {
    /// Registry type name, e.g. `sector`.
    pub r#type: String,
    /// Unique stage name.
    pub name: String,
    /// Explicit upstream node.
    pub key: Option<String>,
    /// Free-text description.
    pub description: Option<String>,
    /// Detector serial number.
    pub serial_number: Option<String>,
    /// Stage-specific parameters.
    #[serde(flatten)]
    pub params: toml::Value,
}

impl StageConfig {
    /// Identity of the stage described by this entry.
    pub fn info(&self) -> StageInfo {
        StageInfo {
            name: self.name.clone(),
            key: self.key.clone(),
            description: self.description.clone(),
            serial_number: self.serial_number.clone(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load `config/<name>` (default `config/default`) in any format the `config` crate detects.
    pub fn new(config_name: Option<&str>) -> Result<Self, ReductionError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Load settings from an explicit file; the format follows the extension.
    pub fn from_path(path: &Path) -> Result<Self, ReductionError> {
        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Parse settings from an in-memory TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ReductionError> {
        let s = Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;

        Ok(s.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
log_level = "debug"

[chain]
raw_key = "detector"

[[chain.stages]]
type = "background"
name = "bg"
description = "empty cell"

[[chain.stages]]
type = "normalisation"
name = "norm"
key = "bg"
calibration_name = "I0"
calib_channel = 1
normvalue = 2.5
"#;

    #[test]
    fn parses_stage_list_with_flattened_params() {
        let settings = Settings::from_toml_str(DOC).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.chain.raw_key, "detector");
        assert_eq!(settings.chain.stages.len(), 2);

        let bg = &settings.chain.stages[0];
        assert_eq!(bg.r#type, "background");
        assert_eq!(bg.info().description.as_deref(), Some("empty cell"));

        let norm = &settings.chain.stages[1];
        assert_eq!(norm.info().key.as_deref(), Some("bg"));
        assert_eq!(
            norm.params.get("calibration_name").and_then(toml::Value::as_str),
            Some("I0")
        );
        assert!(norm.params.get("name").is_none());
    }

    #[test]
    fn log_level_defaults_to_info() {
        let settings = Settings::from_toml_str("[chain]\nraw_key = \"raw\"\n").unwrap();
        assert_eq!(settings.log_level, "info");
        assert!(settings.chain.stages.is_empty());
    }

    #[test]
    fn missing_chain_is_a_config_error() {
        assert!(matches!(
            Settings::from_toml_str("log_level = \"info\"\n"),
            Err(ReductionError::Config(_))
        ));
    }
}
