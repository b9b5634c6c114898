//! ---
//! frau_section: "01-core-functionality"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Shared primitives and utilities for frau ports."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;
use crate::origin::{extract_origin, WILDCARD_ORIGIN};

fn default_scheme() -> String {
    "https".to_owned()
}

fn default_target_origin() -> String {
    WILDCARD_ORIGIN.to_owned()
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for processes embedding frau ports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrauConfig {
    #[serde(default)]
    pub port: PortConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`FrauConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedFrauConfig {
    pub config: FrauConfig,
    pub source: PathBuf,
}

impl FrauConfig {
    pub const ENV_CONFIG_PATH: &'static str = "FRAU_CONFIG";

    /// Load configuration from disk, respecting the `FRAU_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedFrauConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedFrauConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedFrauConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<FrauConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.host.validate()?;
        self.client.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for FrauConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: FrauConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Options shared by every port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Emit verbose protocol traces (lifecycle transitions, every envelope).
    #[serde(default)]
    pub debug: bool,
}

/// Options for the embedding side of a frame pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Source URL of the embedded child; its origin becomes the post target.
    #[serde(default)]
    pub src: Option<String>,
    /// Scheme applied to protocol-relative sources.
    #[serde(default = "default_scheme")]
    pub default_scheme: String,
}

impl HostConfig {
    /// Origin the host posts to, derived from `src`.
    pub fn target_origin(&self) -> Option<String> {
        self.src
            .as_deref()
            .and_then(|src| extract_origin(src, &self.default_scheme))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(src) = &self.src {
            if self.target_origin().is_none() {
                return Err(anyhow!("unable to extract origin from host src '{}'", src));
            }
        }
        Ok(())
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            src: None,
            default_scheme: default_scheme(),
        }
    }
}

/// Options for the embedded side of a frame pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Origin the client posts to and accepts messages from.
    #[serde(default = "default_target_origin")]
    pub target_origin: String,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_origin.trim().is_empty() {
            return Err(anyhow!("client target_origin must not be empty"));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target_origin: default_target_origin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Directory for the rolling log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            directory: None,
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_document() {
        let config: FrauConfig = "".parse().expect("empty config parses");
        assert!(!config.port.debug);
        assert_eq!(config.client.target_origin, "*");
        assert_eq!(config.host.default_scheme, "https");
        assert!(config.host.src.is_none());
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }

    #[test]
    fn parses_full_document() {
        let config: FrauConfig = r#"
            [port]
            debug = true

            [host]
            src = "https://child.example.com/app"

            [client]
            target_origin = "https://host.example.com"

            [logging]
            format = "pretty"
            directory = "target/logs"
            "#
        .parse()
        .expect("config parses");

        assert!(config.port.debug);
        assert_eq!(
            config.host.target_origin().as_deref(),
            Some("https://child.example.com")
        );
        assert_eq!(config.client.target_origin, "https://host.example.com");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(
            config.logging.directory.as_deref(),
            Some(Path::new("target/logs"))
        );
    }

    #[test]
    fn rejects_host_src_without_origin() {
        let err = r#"
            [host]
            src = "ftp://files.example.com/app"
            "#
        .parse::<FrauConfig>()
        .expect_err("ftp source is rejected");
        assert!(err.to_string().contains("unable to extract origin"));
    }

    #[test]
    fn rejects_empty_client_target_origin() {
        let result = r#"
            [client]
            target_origin = " "
            "#
        .parse::<FrauConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn load_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("frau.toml");
        fs::write(&present, "[port]\ndebug = true\n").expect("write config");

        let loaded = FrauConfig::load_with_source(&[&missing, &present]).expect("config loads");
        assert_eq!(loaded.source, present);
        assert!(loaded.config.port.debug);
    }

    #[test]
    fn load_reports_inspected_candidates() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("nope.toml");
        let err = FrauConfig::load(&[&missing]).expect_err("nothing to load");
        assert!(err.to_string().contains("nope.toml"));
    }
}
