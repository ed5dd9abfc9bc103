// SPDX-License-Identifier: Apache-2.0

//! Pipeline-level settings, loadable from JSON or YAML (ambient configuration stack,
//! grounded on `otap-df-config::pipeline::PipelineConfig::from_json/from_yaml/from_file`).

use crate::circuit_breaker::{CircuitBreakerMemoryOptions, CircuitBreakerOptions};
use crate::lineage::{LineageOptions, ValidationMode};
use crate::retry::RetryOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading [`PipelineSettings`] from disk or from a string.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// The contents were not valid JSON.
    #[error("invalid JSON settings: {0}")]
    Json(#[from] serde_json::Error),

    /// The contents were not valid YAML.
    #[error("invalid YAML settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The file had an extension other than `.json`, `.yaml` or `.yml`.
    #[error("unsupported settings file extension: {0}")]
    UnsupportedExtension(String),
}

/// Pipeline-wide defaults and policies (spec §6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Default retry/restart policy, used by nodes with no per-node override.
    pub retry_options: RetryOptions,
    /// Circuit-breaker thresholds shared by every tracked resource.
    pub circuit_breaker_options: CircuitBreakerOptions,
    /// Circuit-breaker registry memory management.
    pub circuit_breaker_memory_options: CircuitBreakerMemoryOptions,
    /// Lineage collection settings.
    pub lineage_options: LineageOptions,
    /// Strictness of build-time validation.
    pub validation_mode: ValidationMode,
    /// Default capacity for data-pipe channels.
    pub default_pdata_channel_capacity: usize,
    /// Default capacity for per-node control-message channels.
    pub default_control_channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry_options: RetryOptions::default(),
            circuit_breaker_options: CircuitBreakerOptions::default(),
            circuit_breaker_memory_options: CircuitBreakerMemoryOptions::default(),
            lineage_options: LineageOptions::default(),
            validation_mode: ValidationMode::default(),
            default_pdata_channel_capacity: 1024,
            default_control_channel_capacity: 100,
        }
    }
}

impl PipelineSettings {
    /// Parses settings from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parses settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, SettingsError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads settings from a file, detecting JSON vs. YAML by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Self::from_json(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            other => Err(SettingsError::UnsupportedExtension(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let settings = PipelineSettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let parsed = PipelineSettings::from_json(&json).unwrap();
        assert_eq!(
            parsed.default_pdata_channel_capacity,
            settings.default_pdata_channel_capacity
        );
    }

    #[test]
    fn unknown_extension_rejected() {
        let dir = std::env::temp_dir().join("npipe-settings-test.toml");
        std::fs::write(&dir, "unused").unwrap();
        let err = PipelineSettings::from_file(&dir).unwrap_err();
        assert!(matches!(err, SettingsError::UnsupportedExtension(_)));
        let _ = std::fs::remove_file(&dir);
    }
}
