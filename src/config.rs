//! Process-wide configuration.
//!
//! Recognized keys mirror the domain-level sections they govern:
//! `clock.*`, `root.*`, `harbor.*`. Configuration is loaded from an
//! optional TOML file; a missing file is not an error, a malformed one
//! is.

use crate::error::{ClockError, Result};
use serde::Deserialize;
use std::path::Path;

/// `[clock]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClockSection {
    /// Keep a clock running past source failures instead of requesting
    /// global shutdown.
    pub allow_streaming_errors: bool,
}

impl Default for ClockSection {
    fn default() -> Self {
        Self {
            allow_streaming_errors: false,
        }
    }
}

/// `[root]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RootSection {
    /// Seconds of scheduling delay above which a wallclock resets its
    /// active sources rather than trying to catch up.
    pub max_latency: f64,
}

impl Default for RootSection {
    fn default() -> Self {
        Self { max_latency: 60.0 }
    }
}

/// `[harbor]` section.
///
/// `bind_addr` is the deprecated singular key; `load`/`load_or_default`
/// rewrite it into `bind_addrs` before returning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarborSection {
    pub bind_addrs: Vec<String>,
    #[serde(skip_serializing)]
    bind_addr: Option<String>,
}

impl Default for HarborSection {
    fn default() -> Self {
        Self {
            bind_addrs: Vec::new(),
            bind_addr: None,
        }
    }
}

impl HarborSection {
    fn normalize(&mut self) {
        if let Some(legacy) = self.bind_addr.take() {
            tracing::warn!(
                "harbor.bind_addr is deprecated, use harbor.bind_addrs instead (rewriting '{}')",
                legacy
            );
            if self.bind_addrs.is_empty() {
                self.bind_addrs = vec![legacy];
            }
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub clock: ClockSection,
    pub root: RootSection,
    pub harbor: HarborSection,
}

impl Config {
    pub const FILE_NAME: &'static str = "harborclock.toml";

    /// Load configuration from a directory. Returns an error if the file
    /// is missing or cannot be parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(Self::FILE_NAME);

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            ClockError::Configuration(format!("failed to read {}: {}", config_path.display(), e))
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|e| {
            ClockError::Configuration(format!("failed to parse {}: {}", config_path.display(), e))
        })?;
        config.harbor.normalize();

        tracing::info!("loaded configuration from {}", config_path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is
    /// missing or unparseable.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            tracing::debug!(
                "no {} found in {}, using defaults",
                Self::FILE_NAME,
                dir.display()
            );
            return Self::default();
        }

        match Self::load(dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert!(!config.clock.allow_streaming_errors);
        assert_eq!(config.root.max_latency, 60.0);
        assert!(config.harbor.bind_addrs.is_empty());
    }

    #[test]
    fn load_missing_file_returns_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path());
        assert_eq!(config.root.max_latency, 60.0);
    }

    #[test]
    fn legacy_bind_addr_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join(Config::FILE_NAME)).unwrap();
        writeln!(f, "[harbor]\nbind_addr = \"0.0.0.0:8005\"").unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.harbor.bind_addrs, vec!["0.0.0.0:8005".to_string()]);
    }

    #[test]
    fn explicit_bind_addrs_take_precedence_over_legacy() {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join(Config::FILE_NAME)).unwrap();
        writeln!(
            f,
            "[harbor]\nbind_addr = \"0.0.0.0:8005\"\nbind_addrs = [\"127.0.0.1:9000\"]"
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.harbor.bind_addrs, vec!["127.0.0.1:9000".to_string()]);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join(Config::FILE_NAME)).unwrap();
        writeln!(f, "not valid toml {{{{").unwrap();

        let config = Config::load_or_default(dir.path());
        assert_eq!(config.root.max_latency, 60.0);
    }
}
