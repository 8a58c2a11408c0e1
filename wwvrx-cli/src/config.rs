//! TOML run configuration for the CLI.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use wwvrx_core::Station;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub receiver: ReceiverSection,
    pub logging: LoggingConfig,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSection {
    pub station: Station,
    /// Parameter file location; created on the first accepted command
    pub param_file: Option<PathBuf>,
    /// Read the parameter file at startup
    pub reload: bool,
}

impl Default for ReceiverSection {
    fn default() -> Self {
        Self {
            station: Station::Wwv,
            param_file: None,
            reload: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `None` logs to stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// Channel filter; empty means everything
    pub channels: Vec<String>,
    /// `None` writes telemetry lines to stdout
    pub file: Option<PathBuf>,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            file: None,
        }
    }
}

impl CliConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).wrap_err_with(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CliConfig::default();
        assert_eq!(config.receiver.station, Station::Wwv);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.telemetry.channels.is_empty());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: CliConfig = toml::from_str(
            r#"
            [receiver]
            station = "Wwvh"
            reload = true

            [logging]
            format = "json"

            [telemetry]
            channels = ["TICK", "SYNC"]
            "#,
        )
        .unwrap();
        assert_eq!(config.receiver.station, Station::Wwvh);
        assert!(config.receiver.reload);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.telemetry.channels, vec!["TICK", "SYNC"]);
    }
}
