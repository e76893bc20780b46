use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogLevel;

const DEFAULT_FORWARD_TIMEOUT_MS: u64 = 5000;

/// Static configuration of one relay process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address other hops use to reach this relay.
    pub address: String,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Fixed timeout of one outbound send.
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    /// Run configuration to install at start-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_file: Option<PathBuf>,
}

fn default_forward_timeout_ms() -> u64 {
    DEFAULT_FORWARD_TIMEOUT_MS
}

impl RelayConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            log_level: LogLevel::default(),
            forward_timeout_ms: DEFAULT_FORWARD_TIMEOUT_MS,
            run_file: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".into()));
        }
        if self.forward_timeout_ms == 0 {
            return Err(ConfigError::Invalid("forward_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

/// A checkpoint nonce this relay should see at `layer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpectedNonce {
    pub nonce: String,
    pub layer: usize,
}

/// Per-run configuration, announced by the bulletin board at run start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    /// `d`: key blocks placed in every sepal this run.
    pub bruise_tolerance: usize,
    /// Most bruises a non-mixer still forwards; defaults to `d - 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bruises: Option<usize>,
    #[serde(default)]
    pub expected: Vec<ExpectedNonce>,
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let run: RunConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
        run.validate()?;
        Ok(run)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bad) = self.expected.iter().find(|e| e.layer == 0) {
            return Err(ConfigError::Invalid(format!(
                "nonce {} expected at layer 0",
                bad.nonce
            )));
        }
        Ok(())
    }

    pub fn max_bruises(&self) -> usize {
        self.max_bruises
            .unwrap_or_else(|| self.bruise_tolerance.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_relay_config_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"address": "http://127.0.0.1:8081"}}"#).unwrap();

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config, RelayConfig::new("http://127.0.0.1:8081"));
        assert_eq!(config.forward_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_relay_config_rejects_empty_address() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"address": " ", "log_level": "debug"}}"#).unwrap();
        assert!(matches!(RelayConfig::load(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RelayConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_run_config_max_bruises() {
        let run: RunConfig = serde_json::from_str(
            r#"{"run_id": "r1", "bruise_tolerance": 2,
                "expected": [{"nonce": "n1", "layer": 2}]}"#,
        )
        .unwrap();
        assert_eq!(run.max_bruises(), 1);
        assert_eq!(run.expected, vec![ExpectedNonce { nonce: "n1".into(), layer: 2 }]);

        let zero = RunConfig { bruise_tolerance: 0, ..RunConfig::default() };
        assert_eq!(zero.max_bruises(), 0);

        let explicit = RunConfig { max_bruises: Some(4), ..RunConfig::default() };
        assert_eq!(explicit.max_bruises(), 4);
    }

    #[test]
    fn test_run_config_rejects_layer_zero() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"run_id": "r", "bruise_tolerance": 1, "expected": [{{"nonce": "x", "layer": 0}}]}}"#
        )
        .unwrap();
        assert!(matches!(RunConfig::load(file.path()), Err(ConfigError::Invalid(_))));
    }
}
